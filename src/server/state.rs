use crate::server::admission::AdmissionHandler;
use crate::server::metrics::WebhookMetrics;
use crate::server::settings::{Settings, TransformerConfig};
use crate::server::transform::{ContainerTransformer, DynamicTransformer, StaticTransformer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared state for the webhook, health and metrics routers
#[derive(Clone)]
pub struct AppState {
    pub transformer: Arc<dyn ContainerTransformer>,
    pub admission: Arc<AdmissionHandler>,
    pub metrics: Arc<WebhookMetrics>,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        transformer: Arc<dyn ContainerTransformer>,
        metrics: Arc<WebhookMetrics>,
    ) -> Self {
        let admission = Arc::new(AdmissionHandler::new(
            transformer.clone(),
            settings.admission.decode_failure,
            metrics.clone(),
        ));
        Self {
            transformer,
            admission,
            metrics,
        }
    }

    /// Build the configured transformer and start its background work
    ///
    /// Returns the refresher task handle for the dynamic transformer. The task
    /// only finishes early when the initial sync never succeeds.
    pub fn new_for_server(settings: &Settings) -> Result<(Self, Option<JoinHandle<Result<()>>>)> {
        let metrics =
            Arc::new(WebhookMetrics::new().context("Failed to register webhook metrics")?);

        let (transformer, refresher): (Arc<dyn ContainerTransformer>, _) =
            match settings.transformer()? {
                TransformerConfig::Static(config) => {
                    let transformer = StaticTransformer::new(config)
                        .context("Failed to initialize static transformer")?;
                    tracing::info!("Using static rewrite rules");
                    (Arc::new(transformer), None)
                }
                TransformerConfig::Dynamic(config) => {
                    tracing::info!(endpoint = %config.endpoint, "Using Harbor proxy-cache discovery");
                    let transformer = Arc::new(
                        DynamicTransformer::new(config, metrics.clone())
                            .context("Failed to initialize dynamic transformer")?,
                    );
                    let refresher = Arc::clone(&transformer).start();
                    (transformer, Some(refresher))
                }
            };

        Ok((Self::new(settings, transformer, metrics), refresher))
    }
}
