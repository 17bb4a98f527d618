//! Event Gateway - file, webhook and timer signals as one event stream

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use event_gateway::{
    cli::{Cli, Command},
    config::Config,
    eventsource::EventSourceResource,
    gateway::{Gateway, GatewayService},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Validate { ref file }) => run_validate(cli.config.as_deref(), file),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Validate every entry of a resource file without starting anything
fn run_validate(config_path: Option<&Path>, file: &Path) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let resource = match EventSourceResource::from_file(file) {
        Ok(resource) => resource,
        Err(e) => {
            eprintln!("❌ Failed to parse {}: {e}", file.display());
            return ExitCode::FAILURE;
        }
    };

    let sources = match resource.event_sources() {
        Ok(sources) => sources,
        Err(e) => {
            eprintln!("❌ {}: {e}", resource.metadata.name);
            return ExitCode::FAILURE;
        }
    };

    if sources.is_empty() {
        println!("No event sources in {}", file.display());
        return ExitCode::SUCCESS;
    }

    let service = GatewayService::from_config(&config);
    let mut failed = 0usize;
    for source in &sources {
        let verdict = service.validate_event_source(source);
        if verdict.is_valid {
            println!("✅ {} ({}) - valid", source.name, source.source_type);
        } else {
            failed += 1;
            println!("❌ {} ({}) - {}", source.name, source.source_type, verdict.reason);
        }
    }

    println!("\n{} of {} event source(s) valid", sources.len() - failed, sources.len());
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        webhook_host = %config.webhook.host,
        "Starting Event Gateway"
    );

    if let Err(e) = Gateway::new(config).run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
