mod config_cmd;
mod demo;
mod row;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use demo::DemoCommand;
pub use row::RowCommand;
pub use sync_cmd::SyncCommand;

use clap::ValueEnum;
use std::sync::Arc;
use std::time::Duration;

use tablesync_core::{HttpRemote, LoggingHook, SyncContext};

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Open the local database and wire it to the configured remote service.
pub async fn open_context(config: &Config) -> Result<SyncContext, Box<dyn std::error::Error>> {
    let remote = &config.remote;
    let mut http = HttpRemote::new(
        remote.server_url.value.clone(),
        Duration::from_secs(remote.request_timeout_secs.value),
    )?;
    if remote.log_http.value {
        http = http.with_hook(LoggingHook);
    }

    let ctx = SyncContext::open_path(
        &config.database_path.value,
        Arc::new(http),
        remote.sync_options(),
    )
    .await?;
    Ok(ctx)
}
