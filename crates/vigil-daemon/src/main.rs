mod config;
mod logfile;
mod rule_builder;

use anyhow::{Context, Result};
use config::{DaemonConfig, SourceKind};
use logfile::ReopenableLog;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use vigil_common::types::Sem;
use vigil_common::units::Units;
use vigil_engine::{Engine, Signals, SystemActions};
use vigil_source::archive::ArchiveSource;
use vigil_source::local::LocalSource;
use vigil_source::sim::SimulatedSource;
use vigil_source::MetricSource;

fn init_tracing(config: &DaemonConfig) -> Result<Option<ReopenableLog>> {
    let filter = EnvFilter::from_default_env().add_directive("vigil=info".parse()?);
    match &config.log_file {
        Some(path) => {
            let log = ReopenableLog::open(path)
                .with_context(|| format!("cannot open log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(log.clone())
                .init();
            Ok(Some(log))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Builds the configured metric source and the host fetches default to.
fn build_source(config: &DaemonConfig) -> Result<(Box<dyn MetricSource>, String)> {
    match config.source {
        SourceKind::Local => {
            let source = LocalSource::new();
            let host = source.hostname().to_string();
            Ok((Box::new(source), host))
        }
        SourceKind::Archive => {
            if config.archives.is_empty() {
                anyhow::bail!("source = \"archive\" needs at least one file in archives");
            }
            let mut source = ArchiveSource::new();
            for path in &config.archives {
                source
                    .add_file(path)
                    .with_context(|| format!("cannot load archive {path}"))?;
            }
            let host = source
                .hosts()
                .first()
                .map(|h| h.to_string())
                .context("archives contain no hosts")?;
            Ok((Box::new(source), host))
        }
        SourceKind::Simulated => {
            let source = SimulatedSource::new();
            for m in &config.simulated {
                let sem: Sem = m
                    .sem
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!("{}: {e}", m.metric))?;
                source.add_host(&m.host);
                source.add_metric(&m.host, &m.metric, sem, Units::NONE, None);
                source.set_value(&m.host, &m.metric, m.value);
            }
            Ok((Box::new(source), "localhost".to_string()))
        }
    }
}

/// Routes process signals to the evaluation loop.
fn spawn_signal_handlers(signals: Arc<Signals>) {
    let s = signals.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            s.shutdown();
        }
    });

    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};
        let s = signals.clone();
        tokio::spawn(async move {
            match unix_signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    tracing::info!("terminated");
                    s.shutdown();
                }
                Err(e) => tracing::warn!(error = %e, "cannot install SIGTERM handler"),
            }
        });
        tokio::spawn(async move {
            match unix_signal(SignalKind::hangup()) {
                Ok(mut hup) => {
                    while hup.recv().await.is_some() {
                        signals.rotate();
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cannot install SIGHUP handler"),
            }
        });
    }
}

fn write_stats(engine: &Engine, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(engine.stats())?;
    std::fs::write(path, json).with_context(|| format!("cannot write stats to {path}"))?;
    tracing::info!(path, "stats written");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/vigil.toml".to_string());
    let config = DaemonConfig::load(&config_path)
        .with_context(|| format!("cannot load config {config_path}"))?;
    let log = init_tracing(&config)?;

    let (source, fallback_host) = build_source(&config)?;
    let window = source.time_window();
    tracing::info!(
        source = source.name(),
        config = %config_path,
        "vigil starting"
    );

    let mut engine = Engine::new(
        source,
        Box::new(SystemActions::new()),
        config.engine_options(window, &fallback_host),
    );
    let loaded = rule_builder::load_rules(&mut engine, &config.rules)?;
    if loaded == 0 {
        anyhow::bail!("no rules to evaluate in {}", config.rules);
    }
    let (hosts, metrics) = engine.referenced();
    tracing::info!(
        hosts = %hosts.join(","),
        metrics = metrics.len(),
        "monitoring"
    );

    let signals = Arc::new(Signals::new());
    spawn_signal_handlers(signals.clone());

    engine
        .run(&signals, || {
            if let Some(log) = &log {
                match log.reopen() {
                    Ok(()) => tracing::info!(path = %log.path().display(), "log reopened"),
                    Err(e) => tracing::warn!(error = %e, "cannot reopen log"),
                }
            }
        })
        .await;

    if let Some(path) = &config.stats_path {
        write_stats(&engine, path)?;
    }
    Ok(())
}
