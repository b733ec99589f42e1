mod settings;

use config::{Config, Environment, File};

use crate::utils::Result;

pub use settings::{ExternalSettings, LogSettings, PartialSettings, Settings};

pub const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Environment variables override the file, e.g.
/// `TOPICBUS_EXTERNAL__ENDPOINT=mqtts://broker:8883`.
pub const ENV_PREFIX: &str = "TOPICBUS";

/// Loads `config/default` (any format the `config` crate knows, optional)
/// and the environment, and merges them over the defaults.
pub fn load_config() -> Result<Settings> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

pub fn load_config_from(path: &str) -> Result<Settings> {
    let config = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("acl.allowed_prefixes")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(Settings::merge(partial))
}
