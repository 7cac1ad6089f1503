//! 配置文件管理模块

use crate::core::models::AppConfig;
use anyhow::Result;
use std::path::PathBuf;

/// 覆盖配置文件的环境变量
pub const ENV_PRIORS_URL: &str = "WHO_API_URL";
pub const ENV_PRIORS_KEY: &str = "WHO_API_KEY";
pub const ENV_SEVERITY_URL: &str = "SEVERITY_API_URL";
pub const ENV_SEVERITY_KEY: &str = "SEVERITY_API_KEY";

/// 配置管理器
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// 创建配置管理器
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// 获取默认配置路径
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "triage", "Triage")
            .map(|d| d.config_dir().join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }

    /// 默认数据库路径
    pub fn default_database_path() -> PathBuf {
        directories::ProjectDirs::from("com", "triage", "Triage")
            .map(|d| d.data_dir().join("triage.db"))
            .unwrap_or_else(|| PathBuf::from("triage.db"))
    }

    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    /// 加载配置，文件不存在时使用默认值
    pub fn load(&self) -> Result<AppConfig> {
        if self.config_path.exists() {
            let content = std::fs::read_to_string(&self.config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// 加载配置并应用环境变量覆盖
    pub fn load_with_env(&self) -> Result<AppConfig> {
        let mut config = self.load()?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// 保存配置
    pub fn save(&self, config: &AppConfig) -> Result<()> {
        // 确保目录存在
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }
}

/// 用环境变量覆盖外部服务配置，空值忽略
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(url) = get(ENV_PRIORS_URL) {
        config.priors_provider.api_url = url;
    }
    if let Some(key) = get(ENV_PRIORS_KEY) {
        config.priors_provider.api_key = key;
    }
    if let Some(url) = get(ENV_SEVERITY_URL) {
        config.severity_service.api_url = url;
    }
    if let Some(key) = get(ENV_SEVERITY_KEY) {
        config.severity_service.api_key = key;
    }
}
