//! Config file loading
//!
//! Settings live in an optional TOML file; anything missing falls back to the
//! defaults in [`ManagerConfig`].

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use cachelog_jobs::ManagerConfig;

/// Load settings from `path`, or the defaults when no file was given
pub fn load(path: Option<&Path>) -> Result<ManagerConfig> {
    let Some(path) = path else {
        return Ok(ManagerConfig::default());
    };

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn parse(content: &str) -> Result<ManagerConfig, toml::de::Error> {
    toml::from_str(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse(
            r#"
            logs_dir = "/srv/lancache/logs"
            worker_timeout_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.logs_dir, PathBuf::from("/srv/lancache/logs"));
        assert_eq!(config.worker_timeout_secs, Some(600));
        assert_eq!(config.worker_program, ManagerConfig::default().worker_program);
        assert_eq!(config.removal_retention_secs, 3600);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(parse("log_dir = \"/logs\"").is_err());
    }

    #[test]
    fn test_missing_path_uses_defaults() {
        assert_eq!(load(None).unwrap(), ManagerConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cachelog.toml");
        fs::write(&path, "worker_program = \"/usr/local/bin/log_manager\"\n").unwrap();

        let config = load(Some(path.as_path())).unwrap();
        assert_eq!(config.worker_program, PathBuf::from("/usr/local/bin/log_manager"));

        let err = load(Some(dir.path().join("missing.toml").as_path())).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
