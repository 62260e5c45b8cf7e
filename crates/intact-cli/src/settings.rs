use config::{Config, ConfigError, File as ConfigFile};
use serde::Deserialize;

/// Optional defaults from `Intact.toml` in the working directory; command
/// line flags win.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    pub workers: Option<usize>,
    pub algo: Option<String>,
    pub index_name: Option<String>,
    pub ignore_name: Option<String>,
    pub include_dot: Option<bool>,
    pub skip_symlinks: Option<bool>,
    pub track_directories: Option<bool>,
}

pub fn load(no_config: bool) -> Result<Settings, ConfigError> {
    if no_config {
        return Ok(Settings::default());
    }
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Intact").required(false))
        .build()?;
    builder.try_deserialize::<Settings>()
}
