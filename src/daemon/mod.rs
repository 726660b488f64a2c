// Daemon: the translation pipeline plus the bootstrap that wires it to
// storage, capabilities and the HTTP server.

pub mod acquirer;
pub mod coordinator;
pub mod events;
pub mod formats;
pub mod package;
pub mod processor;
pub mod retry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::capabilities::{
    Capabilities, HttpFetcher, HttpOcrEngine, HttpTranslator, OcrEngine, PassthroughOcr,
    RasterTypesetter, Translator, UnconfiguredTranslator,
};
use crate::daemon::coordinator::Coordinator;
use crate::daemon::events::JobEvent;
use crate::models::PipelineConfig;
use crate::registry::JobRegistry;
use crate::server::{self, AppState};
use crate::storage::{ArtifactStore, FsArtifactStore, JobStore, JsonJobStore};

const APP_DIR_NAME: &str = "translateable";

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config(path: &Path, source: &str) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", source))?;
    let config: PipelineConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", source))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the PipelineConfig. Resolution order:
///   1. --config CLI flag (passed as config_path)
///   2. TRANSLATEABLE_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/translateable/config.json)
///   4. {data_dir}/config.json
///   5. PipelineConfig::default()
pub fn load_config(config_path: Option<&Path>) -> Result<PipelineConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path, "config file");
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("TRANSLATEABLE_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            return read_config(&path, "TRANSLATEABLE_CONFIG_DIR");
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join(APP_DIR_NAME).join("config.json");
        if path.exists() {
            return read_config(&path, "platform config dir");
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return read_config(&path, "data dir");
    }

    tracing::info!("No config file found, using defaults");
    Ok(PipelineConfig::default())
}

/// Resolve the data directory: the override, then TRANSLATEABLE_DATA_DIR,
/// then the platform data dir (`~/.local/share/translateable` on Linux).
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("TRANSLATEABLE_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub async fn create_data_dirs(data_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("Failed to create data directory")?;
    tokio::fs::create_dir_all(data_dir.join("artifacts"))
        .await
        .context("Failed to create artifacts directory")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log to stderr and to `daemon.log` in the data dir. Falls back to stderr
/// only when the log file cannot be opened. The returned guard flushes the
/// file writer and must live as long as the daemon.
pub fn init_logging(data_dir: &Path) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = data_dir.join("daemon.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    match file {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            let result = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            if result.is_ok() {
                tracing::info!("Logging to stderr and {}", log_path.display());
            }
            Some(guard)
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init();
            tracing::warn!(
                "Could not open {} ({}), logging to stderr only",
                log_path.display(),
                e
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Build the capability set from the configured endpoints. Missing endpoints
/// fall back to stand-ins that keep the daemon usable: pages pass through
/// untouched without OCR, and translation fails permanently.
pub fn build_capabilities(config: &PipelineConfig) -> Result<Capabilities> {
    let ocr: Arc<dyn OcrEngine> = match config.ocr {
        Some(ref endpoint) => {
            tracing::info!("OCR endpoint: {}", endpoint.url);
            Arc::new(HttpOcrEngine::new(endpoint, config.ocr_timeout())?)
        }
        None => {
            tracing::warn!("No OCR endpoint configured; pages will pass through untranslated");
            Arc::new(PassthroughOcr)
        }
    };

    let translator: Arc<dyn Translator> = match config.translation {
        Some(ref endpoint) => {
            tracing::info!("Translation endpoint: {}", endpoint.url);
            Arc::new(HttpTranslator::new(endpoint, config.translate_timeout())?)
        }
        None => {
            tracing::warn!("No translation endpoint configured; pages with text will fail");
            Arc::new(UnconfiguredTranslator)
        }
    };

    Ok(Capabilities {
        ocr,
        translator,
        typesetter: Arc::new(RasterTypesetter::new(config.fonts_dir.as_deref())),
    })
}

// ---------------------------------------------------------------------------
// Daemon bootstrap
// ---------------------------------------------------------------------------

/// Open the stores, recover from an unclean previous run and assemble the
/// shared server state.
pub async fn build_state(config: Arc<PipelineConfig>, data_dir: &Path) -> Result<Arc<AppState>> {
    let job_store = Arc::new(JsonJobStore::new(data_dir.to_path_buf()).await?) as Arc<dyn JobStore>;
    let artifact_store = Arc::new(FsArtifactStore::new(data_dir.join("artifacts")).await?)
        as Arc<dyn ArtifactStore>;

    let (event_tx, _event_rx) = broadcast::channel::<JobEvent>(config.broadcast_capacity);
    let fetcher = Arc::new(HttpFetcher::new(config.fetch_timeout())?);
    let capabilities = build_capabilities(&config)?;

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&job_store),
        Arc::clone(&artifact_store),
        capabilities,
        fetcher,
        Arc::clone(&config),
        event_tx.clone(),
    ));

    // Recovery runs before the server accepts submissions.
    match coordinator.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!("Marked {} interrupted jobs as failed", n),
        Err(e) => tracing::error!("Failed to recover interrupted jobs: {}", e),
    }
    if let Err(e) = coordinator.sweep_orphaned_artifacts().await {
        tracing::warn!("Failed to sweep orphaned artifacts: {}", e);
    }

    Ok(Arc::new(AppState::new(
        coordinator,
        JobRegistry::new(Arc::clone(&job_store)),
        artifact_store,
        event_tx,
        config,
    )))
}

/// Run the daemon in the foreground until Ctrl+C or SIGTERM.
pub async fn start_daemon(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    let data_dir = if let Some(d) = data_dir_override {
        d.to_path_buf()
    } else if let Some(ref d) = config.data_dir {
        d.clone()
    } else {
        resolve_data_dir(None)
    };
    config.data_dir = Some(data_dir.clone());

    create_data_dirs(&data_dir).await?;
    let _log_guard = init_logging(&data_dir);
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Arc::new(config);
    let state = build_state(Arc::clone(&config), &data_dir).await?;

    let router = server::create_router(Arc::clone(&state));
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context(format!("Failed to bind to {}", bind_addr))?;

    tracing::info!(
        "Daemon started with {} workers. Listening on http://{}",
        config.max_workers,
        bind_addr
    );

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await
            .ok();
    });

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C signal");
    }

    let _ = shutdown_tx.send(());

    tracing::info!("Beginning graceful shutdown sequence...");
    state.coordinator.shutdown(config.shutdown_grace()).await;
    let _ = server_handle.await;

    tracing::info!("Daemon exited cleanly.");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9100, "max_workers": 2}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_load_config_missing_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(Some(&tmp.path().join("nope.json"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_load_config_invalid_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config"));
    }

    #[test]
    fn test_resolve_data_dir_override() {
        let dir = resolve_data_dir(Some(Path::new("/tmp/translateable-test")));
        assert_eq!(dir, PathBuf::from("/tmp/translateable-test"));
    }

    #[tokio::test]
    async fn test_create_data_dirs() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("nested").join("data");
        create_data_dirs(&data_dir).await.unwrap();
        assert!(data_dir.join("artifacts").is_dir());
    }

    #[test]
    fn test_build_capabilities_without_endpoints() {
        let caps = build_capabilities(&PipelineConfig::default());
        assert!(caps.is_ok());
    }

    #[tokio::test]
    async fn test_build_state_recovers_interrupted_jobs() {
        use crate::models::{FailurePolicy, Job, JobStatus, JobUpdate, SourceKind};

        let tmp = TempDir::new().unwrap();
        create_data_dirs(tmp.path()).await.unwrap();
        {
            let store = JsonJobStore::new(tmp.path().to_path_buf()).await.unwrap();
            let job = store
                .create_job(Job::new(
                    "Left behind".to_string(),
                    SourceKind::RemoteUrl,
                    "ja".to_string(),
                    "en".to_string(),
                    FailurePolicy::BestEffort,
                ))
                .await
                .unwrap();
            store
                .update_job(job.id, JobUpdate::status(JobStatus::Acquiring))
                .await
                .unwrap();
        }

        let state = build_state(Arc::new(PipelineConfig::default()), tmp.path())
            .await
            .unwrap();
        let (items, total) = state
            .registry
            .list(&Default::default(), Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].status, JobStatus::Failed);
    }
}
