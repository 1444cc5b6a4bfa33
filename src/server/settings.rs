use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::Path;

use crate::server::transform::models::{DynamicConfig, StaticConfig};

/// Prefix for environment variable overrides, e.g. `PROXY_WEBHOOK_SERVER__PORT=9443`
const ENV_PREFIX: &str = "PROXY_WEBHOOK";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub admission: AdmissionSettings,
    #[serde(default, rename = "static")]
    pub static_rules: Option<StaticConfig>,
    #[serde(default)]
    pub dynamic: Option<DynamicConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Address the webhook listener binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the admission webhook (default: 9443)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory containing `tls.crt` and `tls.key` for the webhook listener
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// Whether the webhook listener serves TLS (default: true)
    /// API servers only call webhooks over HTTPS; disable for local testing only.
    #[serde(default = "default_tls")]
    pub tls: bool,

    /// Plain HTTP address for /healthz and /readyz (default: "0.0.0.0:8080")
    #[serde(default = "default_health_addr")]
    pub health_addr: String,

    /// Plain HTTP address for Prometheus /metrics (default: "0.0.0.0:9090")
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cert_dir: default_cert_dir(),
            tls: default_tls(),
            health_addr: default_health_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9443
}

fn default_cert_dir() -> String {
    "/tmp/k8s-webhook-server/serving-certs".to_string()
}

fn default_tls() -> bool {
    true
}

fn default_health_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

/// What to answer when an admission request cannot be decoded into a pod
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Reject the request with an explanatory message
    #[default]
    Deny,
    /// Admit the request unchanged
    Allow,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct AdmissionSettings {
    #[serde(default)]
    pub decode_failure: DecodeFailurePolicy,
}

/// The transformer selected by configuration
#[derive(Debug, Clone)]
pub enum TransformerConfig {
    Static(StaticConfig),
    Dynamic(DynamicConfig),
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        let re = match regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
            Ok(re) => re,
            Err(_) => return s.to_string(),
        };

        re.replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(val) => val,
                Err(_) => default_value.unwrap_or("").to_string(),
            }
        })
        .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Load settings from an optional config file (TOML, YAML or JSON) plus
    /// `PROXY_WEBHOOK_*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !Path::new(path).exists() {
                return Err(ConfigError::Message(format!(
                    "Config file not found: {}",
                    path
                )));
            }
            tracing::info!("Loading config file: {}", path);
            builder = builder.add_source(config::File::from(Path::new(path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        // Deserialize from JSON value and collect unused fields
        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in webhook config: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// The transformer to run; exactly one of `static` and `dynamic` must be configured
    pub fn transformer(&self) -> Result<TransformerConfig, ConfigError> {
        match (&self.static_rules, &self.dynamic) {
            (Some(static_config), None) => Ok(TransformerConfig::Static(static_config.clone())),
            (None, Some(dynamic_config)) => Ok(TransformerConfig::Dynamic(dynamic_config.clone())),
            (None, None) => Err(ConfigError::Message(
                "No transformer configured. Add either a [static] or a [dynamic] block".to_string(),
            )),
            (Some(_), Some(_)) => Err(ConfigError::Message(
                "Both [static] and [dynamic] blocks are configured; they are mutually exclusive"
                    .to_string(),
            )),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let TransformerConfig::Dynamic(dynamic) = self.transformer()? {
            if dynamic.endpoint.is_empty() {
                return Err(ConfigError::Message(
                    "dynamic.endpoint must be set to the Harbor URL".to_string(),
                ));
            }
            if dynamic.refresh_interval_secs == 0 {
                return Err(ConfigError::Message(
                    "dynamic.refresh_interval_secs must be greater than zero".to_string(),
                ));
            }
            if dynamic.timeout_ms == 0 {
                return Err(ConfigError::Message(
                    "dynamic.timeout_ms must be greater than zero".to_string(),
                ));
            }
        }

        if !self.server.tls {
            tracing::warn!("TLS is disabled for the webhook listener; API servers require HTTPS");
        }

        Ok(())
    }
}
