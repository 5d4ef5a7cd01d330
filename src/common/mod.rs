//! 公共组件：错误类型、NTRIP 握手、RTCM 解码、卫星提取与统计

pub mod error;
pub mod ntrip;
pub mod rtcm;
pub mod satellite;
pub mod stats;

pub use error::{ConfigError, ConnectionError, DecodeError, FailureKind, MonitorError, Result, SupervisorError};
pub use rtcm::{DecodeOutput, DecodedMessage, MsmHeader, RtcmDecoder};
pub use satellite::{extract, Constellation, Extraction};
pub use stats::{MessageStat, SatelliteSnapshot, StatsStore, ThroughputMeter};
