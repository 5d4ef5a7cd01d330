//! 错误处理模块
//! 定义统一错误类型与失败分类

use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

/// 全局错误类型
#[derive(Debug, Error)]
pub enum MonitorError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(#[from] ConnectionError),

    /// 监管器错误
    #[error("监管器错误: {0}")]
    Supervisor(#[from] SupervisorError),

    /// RTCM 解码错误
    #[error("RTCM解码错误: {0}")]
    Decode(#[from] DecodeError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] IoError),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 文件未找到
    #[error("配置文件未找到: {0}")]
    FileNotFound(String),

    /// 解析错误
    #[error("配置解析错误: {0}")]
    ParseError(String),

    /// 缺少必填字段
    #[error("缺少必填配置字段: {0}")]
    MissingField(String),

    /// 无效值
    #[error("配置值无效: {0}")]
    InvalidValue(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => ConfigError::MissingField(key),
            other => ConfigError::ParseError(other.to_string()),
        }
    }
}

/// 单个 Caster 连接过程中的错误
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// 握手被服务器拒绝
    #[error("NTRIP server rejected connection: {status_line}")]
    Rejected {
        /// 响应首行
        status_line: String,
    },

    /// 连接或读取超时
    #[error("connection timed out during {0}")]
    Timeout(&'static str),

    /// 服务器主动关闭
    #[error("connection closed by server")]
    ClosedByServer,

    /// 底层 IO 错误
    #[error("socket error: {0}")]
    Io(#[from] IoError),
}

impl ConnectionError {
    /// 将错误归类为用户可见的失败原因
    pub fn kind(&self) -> FailureKind {
        match self {
            ConnectionError::Rejected { .. } => FailureKind::AuthenticationFailed,
            ConnectionError::Timeout(_) => FailureKind::ConnectionTimeout,
            ConnectionError::ClosedByServer => FailureKind::NetworkError,
            ConnectionError::Io(e) => match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock => FailureKind::ConnectionTimeout,
                ErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
                ErrorKind::PermissionDenied => FailureKind::AuthenticationFailed,
                _ => FailureKind::NetworkError,
            },
        }
    }
}

/// 失败分类，优先级：认证 > 超时 > 拒绝 > 其他网络错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// 认证失败 (握手被拒/401)
    AuthenticationFailed,
    /// 超时
    ConnectionTimeout,
    /// 连接被拒绝
    ConnectionRefused,
    /// 其他网络错误
    NetworkError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::AuthenticationFailed => write!(f, "Authentication failed"),
            FailureKind::ConnectionTimeout => write!(f, "Connection timeout"),
            FailureKind::ConnectionRefused => write!(f, "Connection refused"),
            FailureKind::NetworkError => write!(f, "Network error"),
        }
    }
}

/// 监管器错误
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Caster 未找到
    #[error("caster not found: {0}")]
    UnknownCaster(String),

    /// 名称冲突
    #[error("caster name already in use: {0}")]
    DuplicateName(String),
}

/// RTCM 帧体解析错误，帧本身已通过 CRC 校验
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// MSM 帧体长度不足
    #[error("message {msg_type} truncated: need {needed} bits, have {available}")]
    Truncated {
        /// 消息类型
        msg_type: u16,
        /// 所需位数
        needed: usize,
        /// 实际位数
        available: usize,
    },

    /// 单元掩码过大
    #[error("message {msg_type} cell mask too large: {cells} cells")]
    CellMaskTooLarge {
        /// 消息类型
        msg_type: u16,
        /// 单元数
        cells: usize,
    },
}

/// 简化错误类型定义
pub type Result<T> = std::result::Result<T, MonitorError>;
