//! 统一配置中心
//!
//! 提供在线状态服务的全局配置，包括：
//! - 输入提示与在线状态的时间窗口
//! - Redis 传输
//! - 日志
//!
//! 加载顺序：默认值 -> 可选配置文件（`CHATROOM_CONFIG_FILE`，YAML）-> 环境变量（`CHATROOM_*`，
//! 嵌套字段用 `__` 分隔，例如 `CHATROOM_REDIS__URL`）。

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 配置文件路径的环境变量
pub const CONFIG_FILE_ENV: &str = "CHATROOM_CONFIG_FILE";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "CHATROOM_";

/// 全局应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 在线状态配置
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Redis配置
    #[serde(default)]
    pub redis: RedisConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 在线状态配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// 收到的输入状态在本地保留多久
    pub typing_expiry_ms: u64,
    /// 本地停止按键多久后自动发布停止输入
    pub typing_idle_ms: u64,
    /// 变更通知与频道事件的缓冲区大小
    pub event_buffer: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_expiry_ms: 3000,
            typing_idle_ms: 3000,
            event_buffer: 256,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 频道与成员哈希键的前缀
    pub key_prefix: String,
    /// 成员哈希与心跳集合的过期时间，频道无人心跳后整体清除
    pub member_ttl_secs: u64,
    /// 每个连接刷新心跳的间隔
    pub heartbeat_interval_ms: u64,
    /// 超过该时间没有心跳的连接视为已断开
    pub connection_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    /// 0 表示不限次数
    pub max_reconnect_attempts: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "chatroom:presence".to_string(),
            member_ttl_secs: 86_400,
            heartbeat_interval_ms: 10_000,
            connection_timeout_ms: 30_000,
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 0,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `RUST_LOG` 未设置时使用的过滤指令
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// 按默认值、配置文件、环境变量的顺序加载并验证
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    /// 在默认值之上合并一段 YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Yaml::string(yaml)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presence.typing_expiry_ms == 0 || self.presence.typing_idle_ms == 0 {
            return Err(ConfigError::InvalidPresenceConfig(
                "typing windows must be greater than 0".to_string(),
            ));
        }
        if self.presence.event_buffer == 0 {
            return Err(ConfigError::InvalidPresenceConfig(
                "event buffer must be greater than 0".to_string(),
            ));
        }

        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::InvalidRedisConfig(
                "Redis URL cannot be empty".to_string(),
            ));
        }
        if self.redis.key_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidRedisConfig(
                "key prefix cannot be empty".to_string(),
            ));
        }
        if self.redis.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidRedisConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.redis.connection_timeout_ms <= self.redis.heartbeat_interval_ms {
            return Err(ConfigError::InvalidRedisConfig(
                "connection timeout must exceed heartbeat interval".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),
    #[error("Invalid presence configuration: {0}")]
    InvalidPresenceConfig(String),
    #[error("Invalid Redis configuration: {0}")]
    InvalidRedisConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.presence.typing_expiry_ms, 3000);
        assert_eq!(config.presence.typing_idle_ms, 3000);
        assert_eq!(config.redis.member_ttl_secs, 86_400);
    }

    #[test]
    fn test_yaml_overrides_only_given_fields() {
        let config = AppConfig::from_yaml_str(
            "presence:\n  typing_expiry_ms: 5000\nredis:\n  url: redis://prod-redis:6379\n",
        )
        .unwrap();

        assert_eq!(config.presence.typing_expiry_ms, 5000);
        assert_eq!(config.presence.typing_idle_ms, 3000);
        assert_eq!(config.redis.url, "redis://prod-redis:6379");
        assert_eq!(config.redis.key_prefix, "chatroom:presence");
    }

    #[test]
    fn test_validation_rejects_zero_windows() {
        let result = AppConfig::from_yaml_str("presence:\n  typing_expiry_ms: 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidPresenceConfig(_))));

        let mut config = AppConfig::default();
        config.presence.event_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_redis_settings() {
        let mut config = AppConfig::default();
        config.redis.url = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRedisConfig(_))
        ));

        let mut config = AppConfig::default();
        config.redis.key_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_timeout_must_outlast_heartbeats() {
        let mut config = AppConfig::default();
        config.redis.heartbeat_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRedisConfig(_))
        ));

        let mut config = AppConfig::default();
        config.redis.connection_timeout_ms = config.redis.heartbeat_interval_ms;
        assert!(config.validate().is_err());

        config.redis.connection_timeout_ms = config.redis.heartbeat_interval_ms * 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_yaml_is_a_load_error() {
        let result = AppConfig::from_yaml_str("presence:\n  typing_expiry_ms: soon\n");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
