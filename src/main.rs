//! chat-resilience - dependency probe and configuration inspector

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use chat_resilience::{
    cli::{Cli, Command, OutputFormat},
    clients::{ProbeReport, ServiceClients},
    config::Config,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Probe { format } => {
            let clients =
                ServiceClients::from_config(&config).context("failed to build service clients")?;
            info!("Probing downstream services");
            let report = clients.probe_all().await;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => print_report(&report),
            }

            Ok(if report.all_reachable() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn print_report(report: &ProbeReport) {
    println!("Probe at {}\n", report.checked_at.to_rfc3339());
    for dep in &report.dependencies {
        let mark = if dep.reachable { "✅" } else { "❌" };
        println!("{mark} {}", dep.status.service);
        println!("   URL:     {}", dep.status.base_url);
        println!("   Circuit: {}", dep.status.circuit.state);
        if let Some(name) = dep
            .info
            .as_ref()
            .and_then(|i| i.get("service").or_else(|| i.get("name")))
            .and_then(|v| v.as_str())
        {
            println!("   Reports: {name}");
        }
        println!();
    }
}
