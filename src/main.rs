//! Token Bridge operator tool
//!
//! Validates a bridge configuration and runs a
//! single WS-Trust exchange against the configured STS.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use token_bridge::sts::{ExchangeContext, StsExchangeClient};
use token_bridge::{BridgeConfig, ClientCertificate, FederatedPrincipal, TokenBridge};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "token-bridge")]
#[command(about = "Bridges federated SAML identities to WS-Trust and OpenID Connect tokens")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, global = true, default_value = "/etc/token-bridge/config.json", env = "BRIDGE_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true, env = "BRIDGE_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration, signing keys and clients, then exit
    Check,

    /// Exchange an assertion at the STS and print the escaped token
    Exchange {
        /// Relying-party realm the token is requested for
        #[arg(long)]
        realm: String,

        /// File holding the SAML assertion to send on behalf of the user
        #[arg(long)]
        assertion: PathBuf,

        /// Subject name of the principal
        #[arg(long, default_value = "operator")]
        subject: String,

        /// Local port used to resolve an STS location without a port
        #[arg(long)]
        local_port: Option<u16>,

        /// PEM client certificate for public-key confirmation
        #[arg(long)]
        client_cert: Option<PathBuf>,

        /// Deadline for the STS round trip
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::from_file(&args.config)?;
    info!(config = ?args.config, "Configuration loaded");

    match args.command {
        Command::Check => {
            let bridge = TokenBridge::from_config(&config)
                .with_context(|| format!("Failed to initialize bridge from {:?}", args.config))?;

            info!(
                wsdl_location = %config.sts.wsdl_location,
                realms = config.sts.realm_claims.as_ref().map_or(0, |t| t.len()),
                scopes = config.oauth.scopes.len() + 1,
                clients = bridge.grants().store().client_count(),
                "Configuration OK"
            );
        }
        Command::Exchange {
            realm,
            assertion,
            subject,
            local_port,
            client_cert,
            timeout_secs,
        } => {
            let assertion = std::fs::read_to_string(&assertion)
                .with_context(|| format!("Failed to read assertion: {:?}", assertion))?;
            let principal = FederatedPrincipal::new(subject, assertion);

            let mut ctx = ExchangeContext::default();
            if let Some(port) = local_port {
                ctx = ctx.with_local_port(port);
            }
            if let Some(path) = client_cert {
                let pem = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read client certificate: {:?}", path))?;
                ctx = ctx.with_certificate(ClientCertificate::parse(&pem)?);
            }
            if let Some(secs) = timeout_secs {
                ctx = ctx.with_deadline(Duration::from_secs(secs));
            }

            // Only the STS side is needed here
            let sts = StsExchangeClient::from_config(config.sts.clone())
                .with_context(|| format!("Failed to initialize STS client from {:?}", args.config))?;
            let token = sts.exchange(&principal, &realm, &ctx).await?;
            println!("{}", token);
        }
    }

    Ok(())
}
