//! Start command - launches the Locus broker.

use crate::cli::args::StartArgs;
use crate::config::Config;
use crate::domain::{JournalRecordStore, StaticUserDirectory};
use crate::runtime::Runtime;
use crate::telemetry;
use crate::time::system_clock;
use anyhow::{Context, Result};
use std::sync::Arc;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    config.apply_env_overrides()?;
    let log_handle = telemetry::init_tracing(
        Some(config.telemetry.log_level.as_str()),
        config.telemetry.log_format,
    )?;
    let record_store = JournalRecordStore::open(&config.domain.journal_path).with_context(|| {
        format!("open record journal {}", config.domain.journal_path.display())
    })?;
    let directory = StaticUserDirectory::from_entries(&config.users);
    let mut runtime = Runtime::new(
        config,
        Arc::new(record_store),
        Arc::new(directory),
        system_clock(),
        Some(log_handle),
    )?;
    runtime.run().await
}
