//! 连接管理与数据解码核心模块
//! 每个 Caster 一个连接任务，字节经缓冲区交给解码消费者

pub mod buffer;
pub mod caster;
pub mod consumer;
pub mod manager;
pub mod transport;

// 重新导出常用类型
pub use buffer::PendingBuffer;
pub use caster::{CasterConnection, ConnectionEvent, ConnectionState, ConnectionStatus};
pub use consumer::DecodeConsumer;
pub use manager::{ConnectionManager, ConnectionStats};
pub use transport::{AsyncStream, BoxedStream, Connector, TcpConnector};
