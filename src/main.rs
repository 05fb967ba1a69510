mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction, WebhookAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("signalproc {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Check => commands::check::run().await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Run { config } => commands::run::run(config.as_deref()).await?,
        Commands::Webhook { action } => match action {
            WebhookAction::Serve {
                addr,
                tls_cert,
                tls_key,
            } => commands::webhook::serve(&addr, &tls_cert, &tls_key).await?,
            WebhookAction::CertGenerate {
                service_name,
                namespace,
                output_dir,
                ip_sans,
            } => commands::webhook::generate_certs(&service_name, &namespace, &output_dir, &ip_sans)?,
            WebhookAction::InstallConfig {
                service_name,
                namespace,
                ca_bundle_path,
            } => commands::webhook::install_config(&service_name, &namespace, &ca_bundle_path)?,
        },
    }

    Ok(())
}
