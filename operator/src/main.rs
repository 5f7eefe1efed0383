//! Operator for BOSH deployments on Kubernetes
#![deny(missing_docs)]
use std::net::SocketAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use quarks_common::telemetry::{self, LogFormat};
use quarks_operator::config::{ControllerOpts, OperatorConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OTLP endpoint spans are exported to, no export when unset.
    #[arg(long, env = "OPERATOR_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Address the Prometheus metrics are served on.
    #[arg(long, env = "OPERATOR_PROM_BIND", default_value = "0.0.0.0:9464")]
    prom_bind: SocketAddr,

    /// Write logs as JSON lines.
    #[arg(long, env = "OPERATOR_LOG_JSON")]
    log_json: bool,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the BOSHDeployment controller
    Daemon(ControllerOpts),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    telemetry::init_tracing("quarks-operator", args.otlp_endpoint.clone(), format)?;
    let registry = telemetry::init_metrics("quarks-operator")?;
    let metrics = telemetry::serve_metrics(args.prom_bind, registry)?;

    info!(?args.command, ?args.otlp_endpoint, %args.prom_bind, "starting operator");
    match args.command {
        Command::Daemon(opts) => {
            quarks_operator::deployment::run(OperatorConfig::from(opts)).await?;
        }
    };

    metrics.abort();
    // Flush traces before shutdown
    telemetry::shutdown();
    Ok(())
}
