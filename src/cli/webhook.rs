use anyhow::Result;

use crate::server::settings::{Settings, TransformerConfig};
use crate::server::transform::StaticTransformer;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum WebhookCommands {
    /// Start the admission webhook and health servers
    Serve,
    /// Check configuration for errors and unused options
    CheckConfig,
}

pub async fn handle_command(cmd: WebhookCommands, config: Option<&str>) -> Result<()> {
    match cmd {
        WebhookCommands::Serve => {
            let settings = Settings::load(config)?;
            crate::server::run_server(settings).await
        }
        WebhookCommands::CheckConfig => {
            println!("Checking webhook configuration...");
            match check_config(config) {
                Ok(summary) => {
                    println!("✓ Configuration is valid ({})", summary);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn check_config(config: Option<&str>) -> Result<String> {
    let settings = Settings::load(config)?;
    let summary = match settings.transformer()? {
        TransformerConfig::Static(config) => {
            let rules = config.rules.len();
            StaticTransformer::new(config)?;
            format!("static transformer, {} rules", rules)
        }
        TransformerConfig::Dynamic(config) => {
            crate::server::transform::harbor::harbor_host(&config.endpoint)?;
            format!("dynamic transformer, Harbor at {}", config.endpoint)
        }
    };
    Ok(summary)
}
