use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Why a dynamic resolution left an image unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOpenReason {
    /// The proxy authority returned an error
    Error,
    /// The resolution did not finish within the request budget
    Timeout,
}

impl FailOpenReason {
    fn as_str(&self) -> &'static str {
        match self {
            FailOpenReason::Error => "error",
            FailOpenReason::Timeout => "timeout",
        }
    }
}

/// Prometheus metrics for the webhook
///
/// Each instance owns its registry so tests can assert on exact counts.
pub struct WebhookMetrics {
    registry: Registry,
    /// Labels:
    /// - `outcome`: allowed, patched, denied
    admissions: IntCounterVec,
    image_rewrites: IntCounter,
    /// Labels:
    /// - `reason`: error, timeout
    fail_open: IntCounterVec,
}

impl WebhookMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let admissions = IntCounterVec::new(
            Opts::new(
                "proxy_webhook_admissions_total",
                "Admission requests answered, by outcome",
            ),
            &["outcome"],
        )?;
        let image_rewrites = IntCounter::new(
            "proxy_webhook_image_rewrites_total",
            "Container images redirected to a registry proxy",
        )?;
        let fail_open = IntCounterVec::new(
            Opts::new(
                "proxy_webhook_resolution_fail_open_total",
                "Proxy mapping resolutions that left an image unchanged",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(image_rewrites.clone()))?;
        registry.register(Box::new(fail_open.clone()))?;

        Ok(Self {
            registry,
            admissions,
            image_rewrites,
            fail_open,
        })
    }

    /// Count one answered admission request (`allowed`, `patched` or `denied`)
    pub fn record_admission(&self, outcome: &str) {
        self.admissions.with_label_values(&[outcome]).inc();
    }

    pub fn record_rewrites(&self, count: usize) {
        self.image_rewrites.inc_by(count as u64);
    }

    pub fn record_fail_open(&self, reason: FailOpenReason) {
        self.fail_open.with_label_values(&[reason.as_str()]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_counts() {
        let metrics = WebhookMetrics::new().unwrap();
        metrics.record_admission("patched");
        metrics.record_admission("patched");
        metrics.record_admission("denied");
        metrics.record_rewrites(3);
        metrics.record_fail_open(FailOpenReason::Timeout);

        let text = metrics.render().unwrap();

        assert!(text.contains(r#"proxy_webhook_admissions_total{outcome="patched"} 2"#));
        assert!(text.contains(r#"proxy_webhook_admissions_total{outcome="denied"} 1"#));
        assert!(text.contains("proxy_webhook_image_rewrites_total 3"));
        assert!(text.contains(r#"proxy_webhook_resolution_fail_open_total{reason="timeout"} 1"#));
    }

    #[test]
    fn test_instances_are_independent() {
        let first = WebhookMetrics::new().unwrap();
        let second = WebhookMetrics::new().unwrap();
        first.record_rewrites(5);

        assert!(!second
            .render()
            .unwrap()
            .contains("proxy_webhook_image_rewrites_total 5"));
    }
}
