use crate::config::Config;
use crate::lifecycle::LifeCycle;
use crate::logging::{DiagnosticFormat, LoggingConfig};
use crate::relay::{RelayFactory, RelayParams};
use crate::smtp_server::SmtpListener;
use anyhow::Context;
use clap::Parser;
use rfc5321::SmtpClientTimeouts;
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod envelope;
mod lifecycle;
mod logging;
mod relay;
mod routing;
mod session;
mod smtp_server;
#[cfg(test)]
mod test_backend;
mod tls_helpers;

#[derive(Debug, Parser)]
#[command(about = "SMTP relay that splits each message by recipient domain")]
struct Opt {
    /// Path to the JSON configuration file
    config: PathBuf,

    /// Write diagnostic logs to hourly files in this directory
    /// instead of stderr
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let config = Config::load(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?;

    let _flusher = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: logging::FILTER_ENV_VAR,
        default_filter: logging::default_filter(config.debug),
        diag_format: opts.diag_format,
    }
    .init()?;

    config.log_summary();
    tracing::info!("routing mail for {} domains", config.routes.len());

    let factory = RelayFactory::new(
        Arc::new(config.routes.clone()),
        RelayParams {
            hostname: config.host.clone(),
            timeouts: SmtpClientTimeouts::uniform(config.timeout()),
        },
    );

    let mut life_cycle = LifeCycle::new();
    let listener = SmtpListener::bind(&config, Arc::new(factory)).await?;
    let shutdown = life_cycle.subscribe();
    let requester = life_cycle.requester();
    let listener = tokio::spawn(async move {
        let result = listener.run(shutdown).await;
        // Nothing left to do without a listener
        requester.request_shutdown();
        result
    });

    life_cycle.wait_for_shutdown().await?;

    match listener.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("smtp listener task failed: {err:#}")),
    }
}
