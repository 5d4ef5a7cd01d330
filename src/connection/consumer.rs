//! 解码消费者
//! 收到数据通知后在锁内快照缓冲区，解码并汇总统计，最后按长度裁剪已消费前缀

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::caster::{CasterConnection, ConnectionEvent};
use super::manager::ConnectionManager;
use crate::common::rtcm::RtcmDecoder;
use crate::common::stats::StatsStore;

/// 解码消费者
#[derive(Clone)]
pub struct DecodeConsumer {
    manager: Arc<ConnectionManager>,
    stats: StatsStore,
    decoder: RtcmDecoder,
}

impl DecodeConsumer {
    /// 创建新的解码消费者
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let stats = manager.stats();
        Self {
            manager,
            stats,
            decoder: RtcmDecoder::new(),
        }
    }

    /// 处理一个 Caster 的待解码数据，返回本轮解出的消息数
    pub async fn process(&self, caster: &str) -> usize {
        match self.manager.connection(caster).await {
            Some(conn) => self.process_connection(&conn).await,
            None => 0,
        }
    }

    /// 处理指定连接的缓冲区
    ///
    /// 统计按连接登记时的代号写入，连接在解码期间被移除或重建时结果被丢弃。
    pub async fn process_connection(&self, conn: &CasterConnection) -> usize {
        let caster = conn.name();
        let generation = conn.stats_generation();
        let buffer = conn.buffer();

        let snapshot = buffer.snapshot().await;
        if snapshot.is_empty() {
            return 0;
        }

        let out = self.decoder.decode(&snapshot);
        let merged = self.stats.merge_all(caster, generation, &out.messages).await;
        self.stats
            .record_decode_issues(caster, generation, out.crc_failures, out.error.is_some())
            .await;

        if out.crc_failures > 0 {
            debug!("{} RTCM frame(s) with bad CRC skipped for {}", out.crc_failures, caster);
        }
        if let Some(e) = &out.error {
            warn!("RTCM decode pass abandoned for {}: {}", caster, e);
        }

        buffer.consume(out.consumed).await;
        if merged {
            out.messages.len()
        } else {
            0
        }
    }

    /// 处理全部 Caster，用于事件积压后的补偿
    pub async fn process_all(&self) -> usize {
        let mut total = 0;
        for name in self.manager.caster_names().await {
            total += self.process(&name).await;
        }
        total
    }

    /// 事件驱动的消费循环，事件通道关闭后退出
    pub async fn run(self, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::DataAvailable { caster }) => {
                    self.process(&caster).await;
                }
                Ok(ConnectionEvent::Disconnected { caster }) => {
                    // 断开前残留的完整帧仍需计入
                    self.process(&caster).await;
                }
                Ok(ConnectionEvent::Status { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Decode consumer lagged by {} event(s), draining all casters", skipped);
                    self.process_all().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Decode consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rtcm::tests::{msm_frame, plain_frame};
    use crate::common::satellite::Constellation;
    use crate::config::{CasterConfig, ConnectionSettings};
    use crate::connection::transport::testing::ScriptedConnector;
    use std::collections::BTreeSet;

    async fn setup() -> (Arc<ConnectionManager>, DecodeConsumer, tokio::io::DuplexStream) {
        let connector = Arc::new(ScriptedConnector::default());
        let (client, server) = tokio::io::duplex(1024);
        connector.push(client);
        let manager = Arc::new(ConnectionManager::with_connector(ConnectionSettings::default(), connector));
        manager.start(CasterConfig::new("A", "h", 2101, "M")).await.unwrap();
        let consumer = DecodeConsumer::new(manager.clone());
        (manager, consumer, server)
    }

    #[tokio::test]
    async fn partial_frame_kept_for_next_pass() {
        let (manager, consumer, _server) = setup().await;
        let buffer = manager.buffer("A").await.unwrap();

        let first = msm_frame(1074, &[4, 9, 17], &[1, 2]);
        let second = plain_frame(1005, 17);
        buffer.append(&first).await;
        buffer.append(&second[..5]).await;

        assert_eq!(consumer.process("A").await, 1);
        assert_eq!(buffer.len().await, 5);

        buffer.append(&second[5..]).await;
        assert_eq!(consumer.process("A").await, 1);
        assert!(buffer.is_empty().await);

        let stats = manager.stats();
        let messages = stats.message_stats("A").await;
        assert_eq!(messages[&1074].count, 1);
        assert_eq!(messages[&1005].count, 1);
        let sky = stats.satellite_stats("A").await;
        assert_eq!(sky.satellites[&Constellation::Gps], BTreeSet::from([4, 9, 17]));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn malformed_frame_does_not_stall_decoding() {
        let (manager, consumer, _server) = setup().await;
        let buffer = manager.buffer("A").await.unwrap();

        // 仅含消息号的 MSM 帧，帧体过短
        buffer.append(&plain_frame(1077, 2)).await;
        buffer.append(&plain_frame(1033, 4)).await;

        assert_eq!(consumer.process("A").await, 0);
        assert_eq!(consumer.process("A").await, 1);
        assert!(buffer.is_empty().await);
        assert_eq!(manager.stats().decode_health("A").await.decode_errors, 1);

        assert_eq!(consumer.process("missing").await, 0);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn decode_racing_restart_does_not_revive_stats() {
        let (manager, consumer, _server) = setup().await;
        let old = manager.connection("A").await.unwrap();
        old.buffer().append(&msm_frame(1074, &[4, 9, 17], &[1])).await;

        // 解码前连接已被同名重建
        manager
            .restart("A", CasterConfig::new("A", "h", 2101, "M"))
            .await
            .unwrap();
        assert_eq!(consumer.process_connection(&old).await, 0);

        let stats = manager.stats();
        assert!(stats.message_stats("A").await.is_empty());
        assert!(stats.satellite_stats("A").await.satellites.is_empty());
        assert!(old.buffer().is_empty().await);

        // 移除后迟到的结果同样被丢弃
        let current = manager.connection("A").await.unwrap();
        current.buffer().append(&plain_frame(1005, 17)).await;
        manager.remove("A").await.unwrap();
        assert_eq!(consumer.process_connection(&current).await, 0);
        assert!(stats.message_stats("A").await.is_empty());
        assert_eq!(stats.decode_health("A").await.crc_failures, 0);
    }
}
