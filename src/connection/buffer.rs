//! 待解码字节缓冲区
//! 网络任务追加、解码消费者快照后按长度裁剪，二者共用同一把锁

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Mutex;

/// 单个连接独占的待解码缓冲区
#[derive(Debug, Default)]
pub struct PendingBuffer {
    inner: Mutex<BytesMut>,
}

impl PendingBuffer {
    /// 创建新的缓冲区
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加收到的字节
    pub async fn append(&self, data: &[u8]) {
        self.inner.lock().await.extend_from_slice(data);
    }

    /// 在锁内复制当前内容
    pub async fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().await[..])
    }

    /// 移除已消费的前缀
    ///
    /// 只按长度裁剪，快照之后追加的字节保留在尾部。
    pub async fn consume(&self, consumed: usize) {
        let mut buf = self.inner.lock().await;
        let n = consumed.min(buf.len());
        buf.advance(n);
    }

    /// 当前长度
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// 是否为空
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trim_keeps_bytes_appended_after_snapshot() {
        let buffer = PendingBuffer::new();
        buffer.append(b"abcdef").await;

        let snapshot = buffer.snapshot().await;
        assert_eq!(&snapshot[..], b"abcdef");

        buffer.append(b"XYZ").await;
        buffer.consume(4).await;

        assert_eq!(&buffer.snapshot().await[..], b"efXYZ");
        assert_eq!(buffer.len().await, 5);
    }

    #[tokio::test]
    async fn over_consume_is_clamped() {
        let buffer = PendingBuffer::new();
        buffer.append(b"ab").await;
        buffer.consume(10).await;
        assert!(buffer.is_empty().await);
    }
}
