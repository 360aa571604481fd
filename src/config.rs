use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Open(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Wall-clock limit for one local command.
    #[serde(default = "default_command_timeout", with = "duration_ms")]
    pub command_timeout: Duration,

    #[serde(default = "default_shell")]
    pub shell: String,

    /// When false, mentioning an agent that is neither registered nor
    /// declared in the front-matter is a dispatch error.
    #[serde(default = "default_true")]
    pub allow_undeclared_agents: bool,

    /// Command output is truncated to this many bytes.
    #[serde(default = "default_max_command_output")]
    pub max_command_output: usize,

    /// Normalize code blocks through the language table before output.
    #[serde(default)]
    pub format_code_blocks: bool,
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_command_output() -> usize {
    64 * 1024
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            shell: default_shell(),
            allow_undeclared_agents: default_true(),
            max_command_output: default_max_command_output(),
            format_code_blocks: false,
        }
    }
}

impl CompilerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "command_timeout must be greater than 0".to_string(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".to_string()));
        }
        if self.max_command_output == 0 {
            return Err(ConfigError::Invalid(
                "max_command_output must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = CompilerConfig::from_json(r#"{"command_timeout": 1500}"#).unwrap();
        assert_eq!(config.command_timeout, Duration::from_millis(1500));
        assert_eq!(config.shell, "sh");
        assert!(config.allow_undeclared_agents);
        assert!(!config.format_code_blocks);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            CompilerConfig::from_json(r#"{"command_timeout": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CompilerConfig::from_json(r#"{"shell": " "}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CompilerConfig::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = CompilerConfig {
            shell: "bash".to_string(),
            allow_undeclared_agents: false,
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();
        assert_eq!(CompilerConfig::from_file(file.path()).unwrap(), config);
    }
}
