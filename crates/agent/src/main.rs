//! # Fleetline agent CLI
//!
//! Entry point: configuration loading, observability setup, pipeline
//! lifecycle. Real bus bindings are injected by the embedding product; this
//! binary wires the bundled simulated buses so the agent can run end-to-end
//! on a development machine.

mod cli;
mod config;
mod pipeline;

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use tracing::{error, info};

use data_sources::mock::{
    MockCanEndpointFactory, MockCanNetwork, MockObdNetwork, MockObdTransport,
};

use cli::{Cli, Commands};
use config::AgentConfig;
use pipeline::AgentPipeline;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => {
            let config = AgentConfig::load(&args.config)?;
            init_logging(&cli, config.metrics_port)?;
            info!(version = env!("CARGO_PKG_VERSION"), "fleetline agent starting");
            run(&config)
        }
        Commands::Validate(args) => {
            init_logging(&cli, None)?;
            validate(args)
        }
    };

    if let Err(ref e) = result {
        error!(error = %e, "command failed");
    }
    result
}

fn run(config: &AgentConfig) -> Result<()> {
    let can_network = MockCanNetwork::new();
    let obd_network = MockObdNetwork::new();
    let pipeline = AgentPipeline::build(
        config,
        Arc::new(MockCanEndpointFactory::new(can_network)),
        Some(Arc::new(MockObdTransport::new(obd_network))),
    )?;
    pipeline.start()?;

    if let Some(path) = &config.seed_decoder_manifest {
        let payload = std::fs::read(path)?;
        pipeline.scheme_manager().on_decoder_manifest(Bytes::from(payload));
        info!(path = %path.display(), "seed decoder manifest queued");
    }
    if let Some(path) = &config.seed_collection_schemes {
        let payload = std::fs::read(path)?;
        pipeline
            .scheme_manager()
            .on_collection_scheme_list(Bytes::from(payload));
        info!(path = %path.display(), "seed collection schemes queued");
    }

    // Runs until a source reports an unrecoverable failure; an external
    // signal simply kills the process and the OS reclaims the sockets.
    pipeline.wait_for_fatal_error();
    pipeline.shutdown();
    Ok(())
}

fn validate(args: &cli::ValidateArgs) -> Result<()> {
    let config = AgentConfig::load(&args.config)?;
    info!(
        can_interfaces = config.can_interfaces.len(),
        obd = config.obd.is_some(),
        "configuration is valid"
    );
    Ok(())
}

fn init_logging(cli: &Cli, metrics_port: Option<u16>) -> Result<()> {
    let default_log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    observability::init_with_config(observability::ObservabilityConfig {
        log_format: cli.log_format.into(),
        metrics_port,
        default_log_level: default_log_level.to_string(),
    })
}
