use std::path::Path;
use std::time::Duration;

use pubsub_client::{ClientConfig, TimingConfig};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

pub(crate) const DEFAULT_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_PORT: u16 = 6379;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub host: String,
    pub port: u16,
    pub timing: TimingFile,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timing: TimingFile::default(),
        }
    }
}

/// Timeouts in milliseconds. `idle_timeout_ms: null` or `0` disables the idle probe.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingFile {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub idle_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: u64,
}

impl Default for TimingFile {
    fn default() -> Self {
        let timing = TimingConfig::default();
        Self {
            connect_timeout_ms: millis(timing.connect_timeout),
            command_timeout_ms: millis(timing.command_timeout),
            idle_timeout_ms: timing.idle_timeout.map(millis),
            shutdown_timeout_ms: millis(timing.shutdown_timeout),
        }
    }
}

impl From<&TimingFile> for TimingConfig {
    fn from(file: &TimingFile) -> Self {
        Self {
            connect_timeout: Duration::from_millis(file.connect_timeout_ms),
            command_timeout: Duration::from_millis(file.command_timeout_ms),
            idle_timeout: file
                .idle_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            shutdown_timeout: Duration::from_millis(file.shutdown_timeout_ms),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Load and validate a client config from a YAML file.
pub async fn load(path: &Path) -> CliResult<FileConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CliError::Config(format!("read {}: {e}", path.display())))?;
    let config: FileConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| CliError::Config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

impl FileConfig {
    fn validate(&self) -> CliResult<()> {
        if self.host.is_empty() {
            return Err(CliError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(CliError::Config("port must not be 0".into()));
        }
        let t = &self.timing;
        for (label, ms) in [
            ("connect_timeout_ms", t.connect_timeout_ms),
            ("command_timeout_ms", t.command_timeout_ms),
            ("shutdown_timeout_ms", t.shutdown_timeout_ms),
        ] {
            if ms == 0 {
                return Err(CliError::Config(format!("{label} must be positive")));
            }
        }
        Ok(())
    }

    /// Build the client config, letting command-line values override the file.
    pub fn into_client_config(self, host: Option<String>, port: Option<u16>) -> ClientConfig {
        let mut config = ClientConfig::new(host.unwrap_or(self.host), port.unwrap_or(self.port));
        config.timing = TimingConfig::from(&self.timing);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_config(dir: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
        let path = dir.path().join("pubsub.yaml");
        tokio::fs::write(&path, yaml).await.unwrap();
        path
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
host: cache.internal
port: 6380
timing:
  connect_timeout_ms: 250
  command_timeout_ms: 1500
  idle_timeout_ms: 10000
  shutdown_timeout_ms: 100
"#,
        )
        .await;

        let config = load(&path).await.unwrap();
        assert_eq!(
            config,
            FileConfig {
                host: "cache.internal".into(),
                port: 6380,
                timing: TimingFile {
                    connect_timeout_ms: 250,
                    command_timeout_ms: 1500,
                    idle_timeout_ms: Some(10_000),
                    shutdown_timeout_ms: 100,
                },
            }
        );

        let client = config.into_client_config(None, None);
        assert_eq!(client.addr(), "cache.internal:6380");
        assert_eq!(client.timing.command_timeout, Duration::from_millis(1500));
        assert_eq!(client.timing.idle_timeout, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "port: 7000\n").await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 7000);
        assert_eq!(config.timing, TimingFile::default());

        let timing = TimingConfig::from(&config.timing);
        let defaults = TimingConfig::default();
        assert_eq!(timing.connect_timeout, defaults.connect_timeout);
        assert_eq!(timing.idle_timeout, defaults.idle_timeout);
    }

    #[tokio::test]
    async fn idle_probe_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        for yaml in ["timing:\n  idle_timeout_ms: null\n", "timing:\n  idle_timeout_ms: 0\n"] {
            let path = write_config(&dir, yaml).await;
            let client = load(&path).await.unwrap().into_client_config(None, None);
            assert_eq!(client.timing.idle_timeout, None, "yaml: {yaml}");
        }
    }

    #[tokio::test]
    async fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "host: from-file\nport: 7000\n").await;

        let client = load(&path)
            .await
            .unwrap()
            .into_client_config(Some("from-flag".into()), Some(7001));
        assert_eq!(client.addr(), "from-flag:7001");
    }

    #[tokio::test]
    async fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(err.to_string().contains("read"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        for (yaml, needle) in [
            ("port: 0\n", "port"),
            ("host: \"\"\n", "host"),
            ("timing:\n  command_timeout_ms: 0\n", "command_timeout_ms"),
            ("port: [1, 2]\n", "parse"),
        ] {
            let path = write_config(&dir, yaml).await;
            let err = load(&path).await.unwrap_err();
            assert!(err.to_string().contains(needle), "yaml {yaml:?} gave: {err}");
        }
    }
}
