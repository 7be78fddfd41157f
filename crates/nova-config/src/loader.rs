use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::AppConfig;

const DEFAULT_ENV_PREFIX: &str = "NOVA";

/// 配置加载器
///
/// TOML 文件之上叠加 `NOVA__SECTION__KEY` 形式的环境变量；文件不存在时使用默认值。
pub struct ConfigLoader {
    path: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载配置，不做校验
    pub fn load_unchecked(&self) -> Result<AppConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid config path: {}", self.path.display()))?;

        let config = Config::builder()
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config from {}", self.path.display()))?;

        config
            .try_deserialize()
            .with_context(|| format!("Failed to parse config {}", self.path.display()))
    }

    /// 加载并校验配置
    pub fn load(&self) -> Result<AppConfig> {
        let config = self.load_unchecked()?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", self.path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = tempdir().unwrap();
        let loader = ConfigLoader::new(temp_dir.path().join("nova.toml"))
            .with_env_prefix("NOVA_TEST_MISSING");

        let config = loader.load().unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_environment_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nova.toml");
        fs::write(&path, "[server]\nport = 8080\n").unwrap();

        std::env::set_var("NOVA_TEST_ENV__SERVER__PORT", "7070");
        let config = ConfigLoader::new(&path)
            .with_env_prefix("NOVA_TEST_ENV")
            .load()
            .unwrap();
        std::env::remove_var("NOVA_TEST_ENV__SERVER__PORT");

        assert_eq!(config.server.port, 7070);
    }

    #[test]
    fn test_malformed_rule_is_fatal() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nova.toml");
        fs::write(
            &path,
            r#"
[[rules]]
id = "broken"
selector = "cpu{host=web"
comparator = ">"
threshold = 1.0
"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(&path).with_env_prefix("NOVA_TEST_BROKEN");
        let err = loader.load().unwrap_err();
        assert!(format!("{err:#}").contains("selector"));
        assert!(loader.load_unchecked().is_ok());
    }
}
