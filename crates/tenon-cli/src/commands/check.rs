//! `tenon check-config`: validate a settings file and print the effective values

use crate::config::Settings;
use anyhow::Context;
use std::path::Path;

pub fn execute(path: &Path) -> anyhow::Result<()> {
    let settings = Settings::from_file(path)
        .with_context(|| format!("checking {}", path.display()))?;
    let workers = settings.executor.to_executor_config().worker_count();

    println!("# {} is valid ({} worker threads)", path.display(), workers);
    print!("{}", settings.to_toml()?);
    Ok(())
}
