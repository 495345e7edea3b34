use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub record: RecordConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_address")]
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Descriptor ids to disable on the profiled process before recording.
    #[serde(default)]
    pub disabled_blocks: Vec<u32>,

    #[serde(default)]
    pub event_tracing: bool,

    #[serde(default)]
    pub low_priority_events: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            address: default_address(),
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        RecordConfig {
            heartbeat_secs: default_heartbeat_secs(),
            disabled_blocks: Vec::new(),
            event_tracing: false,
            low_priority_events: false,
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:28077".to_string()
}

fn default_heartbeat_secs() -> u64 {
    1
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.global.address, "127.0.0.1:28077");
        assert_eq!(config.record.heartbeat_secs, 1);
        assert!(config.record.disabled_blocks.is_empty());
        assert!(!config.record.event_tracing);
    }

    #[rstest]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
address = "10.0.0.5:9000"

[record]
heartbeat_secs = 5
disabled_blocks = [3, 7]
event_tracing = true
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.global.address, "10.0.0.5:9000");
        assert_eq!(config.record.heartbeat_secs, 5);
        assert_eq!(config.record.disabled_blocks, vec![3, 7]);
        assert!(config.record.event_tracing);
        assert!(!config.record.low_priority_events);
    }
}
