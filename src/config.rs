//! Tool configuration loading.
//!
//! Defaults can come from a TOML file named by the `WALB_CONFIG`
//! environment variable, then `WALB__section__field` variables override
//! individual values. Command-line flags win over both.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::redo::DiscardMode;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolConfig {
    /// Redo tool configuration.
    pub redo: Option<RedoSection>,
    /// Merge tool configuration.
    pub merge: Option<MergeSection>,
    /// Converter configuration.
    pub convert: Option<ConvertSection>,
}

/// `wlog-redo` overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedoSection {
    /// In-flight buffer size in bytes.
    pub buffer_size: Option<usize>,
    /// Discard handling: "issue", "ignore" or "zero".
    pub discard: Option<String>,
}

/// `wdiff-merge` overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MergeSection {
    /// Look-ahead window in logical blocks.
    pub search_len: Option<u64>,
    /// Output record split bound in logical blocks.
    pub max_io_blocks: Option<u32>,
}

/// `wlog-to-wdiff` overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvertSection {
    /// Output record split bound in logical blocks.
    pub max_io_blocks: Option<u32>,
}

impl ToolConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `WALB_CONFIG` env var (if set), then
    /// apply `WALB__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("WALB_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("WALB__") {
                continue;
            }
            let path = key["WALB__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["redo", "buffer_size"] => {
                    self.redo_mut().buffer_size = Some(parse_value(&key, &value)?);
                }
                ["redo", "discard"] => {
                    parse_discard_mode(&key, &value)?;
                    self.redo_mut().discard = Some(value);
                }
                ["merge", "search_len"] => {
                    self.merge_mut().search_len = Some(parse_value(&key, &value)?);
                }
                ["merge", "max_io_blocks"] => {
                    self.merge_mut().max_io_blocks = Some(parse_value(&key, &value)?);
                }
                ["convert", "max_io_blocks"] => {
                    self.convert_mut().max_io_blocks = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Configured discard mode, if any.
    pub fn discard_mode(&self) -> Result<Option<DiscardMode>, ConfigError> {
        match self.redo.as_ref().and_then(|r| r.discard.as_deref()) {
            Some(s) => Ok(Some(parse_discard_mode("redo.discard", s)?)),
            None => Ok(None),
        }
    }

    fn redo_mut(&mut self) -> &mut RedoSection {
        self.redo.get_or_insert_with(RedoSection::default)
    }

    fn merge_mut(&mut self) -> &mut MergeSection {
        self.merge.get_or_insert_with(MergeSection::default)
    }

    fn convert_mut(&mut self) -> &mut ConvertSection {
        self.convert.get_or_insert_with(ConvertSection::default)
    }
}

fn parse_discard_mode(key: &str, value: &str) -> Result<DiscardMode, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "issue" => Ok(DiscardMode::Issue),
        "ignore" => Ok(DiscardMode::Ignore),
        "zero" => Ok(DiscardMode::Zero),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("WALB__redo__buffer_size", "1048576");
        env::set_var("WALB__merge__search_len", "4096");
        env::set_var("WALB__redo__discard", "zero");

        let mut config = ToolConfig::default();
        config.apply_env_overrides().unwrap();

        env::remove_var("WALB__redo__buffer_size");
        env::remove_var("WALB__merge__search_len");
        env::remove_var("WALB__redo__discard");

        assert_eq!(config.redo.as_ref().unwrap().buffer_size, Some(1048576));
        assert_eq!(config.merge.as_ref().unwrap().search_len, Some(4096));
        assert_eq!(config.discard_mode().unwrap(), Some(DiscardMode::Zero));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("WALB__redo__bogus", "1");
        let mut config = ToolConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("WALB__redo__bogus");
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("WALB__redo__buffer_size", "lots");
        let mut config = ToolConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("WALB__redo__buffer_size");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_toml_parsing() {
        let config: ToolConfig = toml::from_str(
            r#"
            [redo]
            buffer_size = 2097152
            discard = "issue"

            [convert]
            max_io_blocks = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.redo.as_ref().unwrap().buffer_size, Some(2097152));
        assert_eq!(config.discard_mode().unwrap(), Some(DiscardMode::Issue));
        assert_eq!(config.convert.as_ref().unwrap().max_io_blocks, Some(64));
    }

    #[test]
    fn test_default_is_empty() {
        let config = ToolConfig::default();
        assert!(config.redo.is_none());
        assert!(config.merge.is_none());
        assert!(config.convert.is_none());
        assert_eq!(config.discard_mode().unwrap(), None);
    }
}
