/// Platform bootstrap
///
/// Wires the registry, starts every configured engine and installs the archives
/// found under `BPM_ARCHIVE_DIR` (one subdirectory per archive, installed on
/// the default engine). Runs until ctrl-c, then stops all engines.

use crate::config::PlatformConfig;
use crate::platform::{ProcessArchive, ProcessEngineRegistry};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Create the registry and start the engines of `config`
pub async fn create_platform(config: PlatformConfig) -> Result<Arc<ProcessEngineRegistry>> {
    for engine in &config.engines {
        if let Some(path) = engine.datasource.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tracing::info!("📁 Ensuring data directory exists: {}", parent.display());
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
            }
        }
    }

    tracing::info!("📊 Initializing process engine registry");
    let registry = ProcessEngineRegistry::new();

    tracing::info!("🚀 Starting {} process engines", config.engines.len());
    registry
        .start_platform(config)
        .await
        .context("Failed to start process engines")?;

    if let Ok(dir) = std::env::var("BPM_ARCHIVE_DIR") {
        install_archives(&registry, Path::new(&dir)).await?;
    }

    tracing::info!("✅ Platform initialized with engines {:?}", registry.engine_names());
    Ok(registry)
}

/// Install every subdirectory of `dir` as a process archive
async fn install_archives(registry: &ProcessEngineRegistry, dir: &Path) -> Result<()> {
    tracing::info!("📥 Loading process archives from {}", dir.display());
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read archive directory {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let archive = ProcessArchive::from_dir(&path)?;
        match registry.install_archive(&archive).await {
            Ok(handle) => tracing::info!(
                "📦 Archive '{}' installed on '{}' (deployment {})",
                handle.archive_name,
                handle.process_engine_name,
                handle.deployment_id.as_deref().unwrap_or("-")
            ),
            Err(e) => tracing::error!("❌ Failed to install archive from {}: {}", path.display(), e.message_chain()),
        }
    }
    Ok(())
}

/// Run the platform until ctrl-c
pub async fn start_platform(config: PlatformConfig) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting bpm-platform...");

    let registry = create_platform(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down bpm-platform...");
    registry.stop_all().await;

    Ok(())
}
