//! 配置管理模块
//! 加载 Caster 列表、连接参数与日志配置，支持 TOML 文件与环境变量覆盖

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::common::error::ConfigError;
use crate::common::ntrip::default_user_agent;

/// 默认最大重连次数
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// 默认重连等待时间(秒)
pub const RECONNECT_BACKOFF_SECS: u64 = 10;
/// 默认连接/握手超时(秒)
pub const CONNECT_TIMEOUT_SECS: u64 = 10;
/// 默认单次读取超时(秒)
pub const READ_TIMEOUT_SECS: u64 = 10;
/// 停止连接时等待任务退出的上限(秒)
pub const JOIN_TIMEOUT_SECS: u64 = 2;
/// 单次读取字节上限
pub const READ_CHUNK_SIZE: usize = 4096;
/// 握手响应头缓冲区大小
pub const HEADER_BUFFER_SIZE: usize = 1024;

/// 监测程序配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Caster 列表
    pub casters: Vec<CasterConfig>,

    /// 连接配置
    pub connection: ConnectionSettings,

    /// 日志配置
    pub log: LogConfig,
}

/// 单个 Caster 配置，连接运行期间不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasterConfig {
    /// 名称 (唯一键)
    pub name: String,
    /// 主机
    pub host: String,
    /// 端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// 挂载点
    pub mount: String,
    /// 用户名
    #[serde(default)]
    pub username: String,
    /// 密码
    #[serde(default)]
    pub password: String,
    /// 纬度
    #[serde(default)]
    pub lat: Option<f64>,
    /// 经度
    #[serde(default)]
    pub lon: Option<f64>,
    /// 海拔
    #[serde(default)]
    pub alt: Option<f64>,
}

fn default_port() -> u16 {
    2101
}

impl CasterConfig {
    /// 创建新的 Caster 配置
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, mount: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            mount: mount.into().trim_start_matches('/').to_string(),
            username: String::new(),
            password: String::new(),
            lat: None,
            lon: None,
            alt: None,
        }
    }

    /// 设置认证信息
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField(format!("{}.host", self.name)));
        }
        if self.mount.trim_start_matches('/').trim().is_empty() {
            return Err(ConfigError::MissingField(format!("{}.mount", self.name)));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(format!("{}.port must be in 1..=65535", self.name)));
        }
        if let Some(lat) = self.lat {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ConfigError::InvalidValue(format!("{}.lat out of range: {}", self.name, lat)));
            }
        }
        if let Some(lon) = self.lon {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(ConfigError::InvalidValue(format!("{}.lon out of range: {}", self.name, lon)));
            }
        }
        Ok(())
    }

    /// 挂载点 (不含前导 '/')
    pub fn mount_path(&self) -> &str {
        self.mount.trim_start_matches('/')
    }
}

/// 连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// 连接与握手超时(秒)
    pub connect_timeout_secs: u64,

    /// 流读取超时(秒)，超时仅重试读取
    pub read_timeout_secs: u64,

    /// 最大重连次数
    pub max_retries: u32,

    /// 重连等待时间(秒)
    pub reconnect_backoff_secs: u64,

    /// 停止时等待任务退出的上限(秒)
    pub join_timeout_secs: u64,

    /// 单次读取字节上限
    pub read_chunk_size: usize,

    /// 握手响应头缓冲区大小
    pub header_buffer_size: usize,

    /// User-Agent
    pub user_agent: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            max_retries: MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff_secs: RECONNECT_BACKOFF_SECS,
            join_timeout_secs: JOIN_TIMEOUT_SECS,
            read_chunk_size: READ_CHUNK_SIZE,
            header_buffer_size: HEADER_BUFFER_SIZE,
            user_agent: default_user_agent(),
        }
    }
}

impl ConnectionSettings {
    /// 连接超时
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 读取超时
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// 重连等待时间
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    /// 停止等待上限
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// 校验参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_size == 0 || self.header_buffer_size == 0 {
            return Err(ConfigError::InvalidValue("buffer sizes must be non-zero".to_string()));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,

    /// 日志文件路径，按天滚动
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
        }
    }
}

impl MonitorConfig {
    /// 校验全部配置，Caster 名称必须唯一
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        let mut names = std::collections::HashSet::new();
        for caster in &self.casters {
            caster.validate()?;
            if !names.insert(caster.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!("duplicate caster name: {}", caster.name)));
            }
        }
        Ok(())
    }
}

/// 加载配置文件
pub fn load(config_path: impl AsRef<Path>) -> Result<MonitorConfig, ConfigError> {
    let path = config_path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let settings = Config::builder()
        // 从文件加载基础配置
        .add_source(File::from(path))
        // 从环境变量覆盖配置 (NTRIP_ 前缀)
        .add_source(Environment::with_prefix("NTRIP").separator("__"))
        .build()?;

    let config: MonitorConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert!(config.casters.is_empty());
        assert_eq!(config.connection.max_retries, 3);
        assert_eq!(config.connection.reconnect_backoff(), Duration::from_secs(10));
        assert_eq!(config.connection.read_chunk_size, 4096);
        assert!(config.connection.user_agent.starts_with("NTRIP-Monitor/"));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_loading() {
        let toml_content = r#"
[connection]
max_retries = 5
reconnect_backoff_secs = 2

[log]
level = "debug"

[[casters]]
name = "base-1"
host = "caster.example.com"
port = 2102
mount = "/RTCM3"
username = "user"
password = "secret"
lat = 60.17
lon = 24.94

[[casters]]
name = "base-2"
host = "10.0.0.2"
mount = "MSM7"
"#;

        let mut temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = load(temp_file.path()).unwrap();
        assert_eq!(config.connection.max_retries, 5);
        assert_eq!(config.connection.reconnect_backoff_secs, 2);
        assert_eq!(config.connection.connect_timeout_secs, 10);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.casters.len(), 2);
        assert_eq!(config.casters[0].port, 2102);
        assert_eq!(config.casters[0].mount_path(), "RTCM3");
        assert_eq!(config.casters[1].port, 2101);
        assert_eq!(config.casters[1].username, "");
        assert_eq!(config.casters[1].lat, None);
    }

    #[test]
    fn test_missing_file() {
        let err = load("/nonexistent/monitor.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_caster_validation() {
        assert!(CasterConfig::new("a", "host", 2101, "MNT").validate().is_ok());
        assert!(matches!(
            CasterConfig::new("", "host", 2101, "MNT").validate(),
            Err(ConfigError::MissingField(_))
        ));
        assert!(CasterConfig::new("a", "", 2101, "MNT").validate().is_err());
        assert!(CasterConfig::new("a", "host", 2101, "/").validate().is_err());
        assert!(matches!(
            CasterConfig::new("a", "host", 0, "MNT").validate(),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut bad_lat = CasterConfig::new("a", "host", 2101, "MNT");
        bad_lat.lat = Some(91.0);
        assert!(bad_lat.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = MonitorConfig {
            casters: vec![
                CasterConfig::new("dup", "h1", 2101, "A"),
                CasterConfig::new("dup", "h2", 2101, "B"),
            ],
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
