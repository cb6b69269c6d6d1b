//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.bookmarch/` in
//! production, overridable via `BOOKMARCH_DATA_DIR`) and deserializes it
//! into [`EngineConfig`]. Falls back to defaults when the file is missing
//! or malformed -- a bad config file must never prevent the engine from
//! starting.

use std::path::{Path, PathBuf};

use bookmarch_types::config::EngineConfig;

/// Resolve the data directory: `BOOKMARCH_DATA_DIR`, else `~/.bookmarch`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BOOKMARCH_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bookmarch")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no config.toml at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookmarch_types::stage::StageName;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.health_interval_secs, 60);
        assert!(config.stages.is_empty());
    }

    #[tokio::test]
    async fn valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
health_interval_secs = 30
poll_interval_ms = 100

[stages.embed]
concurrency = 1

[stages.embed.retry]
max_attempts = 5
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.health_interval_secs, 30);
        assert_eq!(config.poll_interval_ms, 100);
        let embed = config.policy_for(StageName::Embed);
        assert_eq!(embed.concurrency, 1);
        assert_eq!(embed.retry.max_attempts, 5);
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.health_interval_secs, 60);
    }

    #[test]
    fn data_dir_resolution_has_fallback() {
        let dir = resolve_data_dir();
        assert!(dir.to_string_lossy().contains(".bookmarch") || dir == PathBuf::from("."));
    }
}
