#![forbid(unsafe_code)]

//! mediafetch HTTP server.
//!
//! Accepts a media URL, lets yt-dlp fetch it into a per-job staging directory
//! under `MEDIA_ROOT`, reports progress while it runs and hands the finished
//! file back exactly once. Nothing survives a restart; jobs live in memory.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use mediafetch::api::{AppState, router};
use mediafetch::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use mediafetch::extractor::YtDlp;
use mediafetch::jobs::{JobStore, run_sweeper};
use mediafetch::logging::{LogFormat, init_logging};
use mediafetch::security::{ensure_not_root, ensure_private_staging};
use tokio::signal;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BackendArgs {
    media_root: Option<PathBuf>,
    port: Option<u16>,
    host: Option<IpAddr>,
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };

            match flag.as_str() {
                "--media-root" => parsed.media_root = Some(PathBuf::from(value()?)),
                "--port" => parsed.port = Some(parse_port_arg(&value()?)?),
                "--host" => parsed.host = Some(parse_host_arg(&value()?)?),
                "--env-file" => parsed.env_file = Some(PathBuf::from(value()?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root,
            port: self.port,
            host: self.host.map(|host| host.to_string()),
            env_path: self.env_file,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MEDIAFETCH_HOST")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;
    ensure_not_root("mediafetch")?;
    init_logging(LogFormat::from_env())?;

    let settings = resolve_runtime_settings(args.into_overrides())?;
    let addr = SocketAddr::new(parse_host_arg(&settings.host)?, settings.port);

    tokio::fs::create_dir_all(&settings.media_root)
        .await
        .with_context(|| format!("creating media root {}", settings.media_root.display()))?;
    ensure_private_staging(&settings.media_root)?;
    log_settings(&settings);

    let store = JobStore::new();
    if let Some(ttl) = settings.job_ttl {
        tokio::spawn(run_sweeper(store.clone(), settings.media_root.clone(), ttl));
    }

    let extractor = Arc::new(YtDlp::new(settings.ytdlp_bin.clone()));
    let app = router(AppState::new(&settings, store, extractor));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    tracing::info!("server stopped");
    Ok(())
}

fn log_settings(settings: &RuntimeSettings) {
    tracing::info!(
        media_root = %settings.media_root.display(),
        ytdlp = %settings.ytdlp_bin.display(),
        fetch_timeout_secs = settings.fetch_timeout.map(|limit| limit.as_secs()),
        job_ttl_secs = settings.job_ttl.map(|ttl| ttl.as_secs()),
        submit_mode = ?settings.submit_mode,
        "runtime settings resolved"
    );
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still kills the process.
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!("failed to install Ctrl+C handler: {err}");
    }
    tracing::info!("shutdown requested");
}
