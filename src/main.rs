/// bpm-platform entry point
///
/// Loads the platform descriptor (`BPM_PLATFORM_CONFIG`, else environment
/// defaults) and runs the engines until interrupted.

use bpm_platform::{config::PlatformConfig, server::start_platform};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PlatformConfig::load()?;

    start_platform(config).await?;

    Ok(())
}
