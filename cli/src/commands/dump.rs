//! Dump command - print the generated Envoy config without starting
//! tunnels or touching the hosts file.

use std::path::PathBuf;

use anyhow::{Context, Result};

use localmesh_core::{config, engine, MockConfig};

pub async fn run(config_path: PathBuf, mock_config: Option<PathBuf>) -> Result<()> {
    let cfg = config::load(&config_path).context("failed to load config")?;
    let mock = match mock_config {
        Some(path) => Some(MockConfig::load(&path).context("failed to load mock config")?),
        None => None,
    };

    let yaml = engine::dump_config(&cfg, mock.as_ref()).await?;
    print!("{}", yaml);
    Ok(())
}
