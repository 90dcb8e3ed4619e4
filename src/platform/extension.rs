/// Extension hooks around engine and archive lifecycles
///
/// Extensions are third-party code, so hooks return `anyhow::Result`. A
/// failing "before" hook vetoes the transition; "after" hook failures are
/// only logged.

use crate::engine::controller::ProcessEngineController;
use crate::platform::archive::ProcessArchive;
use async_trait::async_trait;
use std::fmt::Debug;

/// Hooks around engine and archive lifecycle
#[async_trait]
pub trait PlatformExtension: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn before_engine_start(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_engine_start(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_engine_stop(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_engine_stop(&self, _controller: &ProcessEngineController) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_archive_install(
        &self,
        _controller: &ProcessEngineController,
        _archive: &ProcessArchive,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_archive_install(
        &self,
        _controller: &ProcessEngineController,
        _archive: &ProcessArchive,
        _deployment_id: Option<&str>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_archive_uninstall(
        &self,
        _controller: &ProcessEngineController,
        _archive: &ProcessArchive,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_archive_uninstall(
        &self,
        _controller: &ProcessEngineController,
        _archive: &ProcessArchive,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
