//! 传输层抽象
//! 连接状态机只依赖 `Connector`，测试中可替换为内存管道

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// 可读写的字节流
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// 装箱的字节流
pub type BoxedStream = Box<dyn AsyncStream>;

/// 建立到 Caster 的字节流
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// 连接到指定主机与端口
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// TCP 连接器
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connected to {}:{}", host, port);
        Ok(Box::new(stream))
    }
}
