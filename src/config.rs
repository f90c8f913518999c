use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::TokenError;

/// 应用配置
///
/// 进程启动时构造一次，之后按值 / `Arc` 传入各组件，不存在全局可变配置。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub token: TokenConfig,
    pub redis: RedisConfig,
    pub server: HttpConfig,
    pub logging: LoggingConfig,
}

/// Token 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Session 记录最大 TTL（天）
    pub max_ttl_days: u64,
    /// 淘汰后保留的设备数
    pub min_devices: usize,
    /// 触发淘汰的设备数，`min_devices < max_devices`
    pub max_devices: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_ttl_days: 90,
            min_devices: 10,
            max_devices: 20,
        }
    }
}

/// `max_ttl_days` 的上限（约 100 年）
pub const MAX_TTL_DAYS_LIMIT: u64 = 36_500;

impl TokenConfig {
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_days.saturating_mul(24 * 3600))
    }
}

/// Redis 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接数
    pub min_idle: u32,
    /// 连接超时时间（秒）
    pub connection_timeout_secs: u64,
    /// 单条命令超时（毫秒）
    pub command_timeout_ms: u64,
    /// 空闲连接回收时间（秒）
    pub idle_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            min_idle: 1,
            connection_timeout_secs: 5,
            command_timeout_ms: 2000,
            idle_timeout_secs: 300,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// HTTP 适配层监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// 管理接口的 X-Service-Key；未配置时管理接口全部拒绝
    pub admin_key: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            admin_key: None,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            file: None,
        }
    }
}

impl AppConfig {
    /// 从 TOML 文件加载配置（缺省字段使用默认值）
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("配置文件格式错误")?;
        Ok(toml_config.into())
    }

    /// 从环境变量合并配置
    pub fn merge_from_env(&mut self) {
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(days) = env::var("API_TOKEN_MAX_TTL_DAYS") {
            self.token.max_ttl_days = days.parse().unwrap_or(self.token.max_ttl_days);
        }
        if let Ok(min) = env::var("API_TOKEN_MIN_DEVICES") {
            self.token.min_devices = min.parse().unwrap_or(self.token.min_devices);
        }
        if let Ok(max) = env::var("API_TOKEN_MAX_DEVICES") {
            self.token.max_devices = max.parse().unwrap_or(self.token.max_devices);
        }
        if let Ok(host) = env::var("API_TOKEN_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("API_TOKEN_PORT") {
            self.server.port = port.parse().unwrap_or(self.server.port);
        }
        if let Ok(key) = env::var("API_TOKEN_ADMIN_KEY") {
            self.server.admin_key = Some(key);
        }
        if let Ok(level) = env::var("API_TOKEN_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(url) = &cli.redis_url {
            self.redis.url = url.clone();
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = level;
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if let Some(config_file) = &cli.config_file {
            info!("📄 从配置文件加载: {}", config_file);
            Self::from_toml_file(config_file)?
        } else if Path::new("config.toml").exists() {
            info!("📄 从默认配置文件加载: config.toml");
            Self::from_toml_file("config.toml")?
        } else {
            Self::default()
        };

        config.merge_from_env();
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// 校验配置；非法配置在启动阶段直接失败
    pub fn validate(&self) -> std::result::Result<(), TokenError> {
        let token = &self.token;
        if token.max_ttl_days == 0 {
            return Err(TokenError::Configuration(
                "token.max_ttl_days must be > 0".to_string(),
            ));
        }
        if token.max_ttl_days > MAX_TTL_DAYS_LIMIT {
            return Err(TokenError::Configuration(format!(
                "token.max_ttl_days must be <= {} (got {})",
                MAX_TTL_DAYS_LIMIT, token.max_ttl_days
            )));
        }
        if token.min_devices == 0 {
            return Err(TokenError::Configuration(
                "token.allow_devices.min must be > 0".to_string(),
            ));
        }
        if token.min_devices >= token.max_devices {
            return Err(TokenError::Configuration(format!(
                "token.allow_devices requires min < max (min={}, max={})",
                token.min_devices, token.max_devices
            )));
        }
        if self.redis.pool_size == 0 {
            return Err(TokenError::Configuration(
                "redis.pool_size must be > 0".to_string(),
            ));
        }
        if self.redis.command_timeout_ms == 0 {
            return Err(TokenError::Configuration(
                "redis.command_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// TOML 配置文件结构（用于反序列化）
#[derive(Debug, Deserialize)]
struct TomlConfig {
    token: Option<TomlTokenConfig>,
    redis: Option<TomlRedisConfig>,
    server: Option<TomlServerConfig>,
    logging: Option<TomlLoggingConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlTokenConfig {
    max_ttl_days: Option<u64>,
    allow_devices: Option<TomlAllowDevices>,
}

#[derive(Debug, Deserialize)]
struct TomlAllowDevices {
    min: Option<usize>,
    max: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TomlRedisConfig {
    url: Option<String>,
    pool_size: Option<u32>,
    min_idle: Option<u32>,
    connection_timeout_secs: Option<u64>,
    command_timeout_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlServerConfig {
    host: Option<String>,
    port: Option<u16>,
    admin_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingConfig {
    level: Option<String>,
    format: Option<String>,
    file: Option<String>,
}

impl From<TomlConfig> for AppConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut config = AppConfig::default();

        if let Some(token) = toml.token {
            if let Some(days) = token.max_ttl_days {
                config.token.max_ttl_days = days;
            }
            if let Some(devices) = token.allow_devices {
                if let Some(min) = devices.min {
                    config.token.min_devices = min;
                }
                if let Some(max) = devices.max {
                    config.token.max_devices = max;
                }
            }
        }

        if let Some(redis) = toml.redis {
            if let Some(url) = redis.url {
                config.redis.url = url;
            }
            if let Some(size) = redis.pool_size {
                config.redis.pool_size = size;
            }
            if let Some(min_idle) = redis.min_idle {
                config.redis.min_idle = min_idle;
            }
            if let Some(secs) = redis.connection_timeout_secs {
                config.redis.connection_timeout_secs = secs;
            }
            if let Some(ms) = redis.command_timeout_ms {
                config.redis.command_timeout_ms = ms;
            }
            if let Some(secs) = redis.idle_timeout_secs {
                config.redis.idle_timeout_secs = secs;
            }
        }

        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                config.server.host = host;
            }
            if let Some(port) = server.port {
                config.server.port = port;
            }
            config.server.admin_key = server.admin_key.or(config.server.admin_key);
        }

        if let Some(logging) = toml.logging {
            if let Some(level) = logging.level {
                config.logging.level = level;
            }
            config.logging.format = logging.format.or(config.logging.format);
            config.logging.file = logging.file.or(config.logging.file);
        }

        config
    }
}

/// `generate-config` 输出的默认配置文件
pub const DEFAULT_CONFIG_TOML: &str = r#"# api-token 配置文件
# 此文件由 api-token generate-config 生成

[token]
# Session 记录最大 TTL（天）
max_ttl_days = 90

# 每个用户允许的设备数：达到 max 时淘汰最久未活跃的设备，直到剩余 min 个
[token.allow_devices]
min = 10
max = 20

[redis]
url = "redis://127.0.0.1:6379"
pool_size = 16
min_idle = 1
connection_timeout_secs = 5
command_timeout_ms = 2000
idle_timeout_secs = 300

[server]
host = "0.0.0.0"
port = 9090
# 管理接口密钥（请求头 X-Service-Key），不配置则关闭管理接口
# admin_key = "change-me"

[logging]
level = "info"
format = "compact"
# file = "./logs/api-token.log"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.token.max_ttl(), Duration::from_secs(90 * 24 * 3600));
        assert_eq!(config.token.min_devices, 10);
        assert_eq!(config.token.max_devices, 20);
    }

    #[test]
    fn test_huge_ttl_is_rejected() {
        let mut config = AppConfig::default();
        config.token.max_ttl_days = 300_000_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(TokenError::Configuration(_))
        ));
        // 不做校验直接换算也不会溢出
        assert_eq!(config.token.max_ttl(), Duration::from_secs(u64::MAX));

        config.token.max_ttl_days = MAX_TTL_DAYS_LIMIT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_parses() {
        let config = AppConfig::from_toml_str(DEFAULT_CONFIG_TOML).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.redis.command_timeout(), Duration::from_millis(2000));
        assert_eq!(config.logging.format.as_deref(), Some("compact"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [token.allow_devices]
            min = 2
            max = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.token.min_devices, 2);
        assert_eq!(config.token.max_devices, 5);
        assert_eq!(config.token.max_ttl_days, 90);
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_min_not_below_max_is_rejected() {
        let mut config = AppConfig::default();
        config.token.min_devices = 20;
        config.token.max_devices = 20;
        assert!(matches!(
            config.validate(),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let mut config = AppConfig::default();
        config.token.max_ttl_days = 0;
        assert!(config.validate().is_err());
    }
}
