//! 统计信息模块
//! 按 Caster 汇总 RTCM 消息计数、卫星与信号集合

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::rtcm::DecodedMessage;
use super::satellite::{extract, Constellation, Extraction};

/// 单个消息类型的统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStat {
    /// 累计帧数，只增不减
    pub count: u64,
    /// 最后一次收到的时间
    pub last_seen: DateTime<Utc>,
}

/// 卫星与信号快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteSnapshot {
    /// 各星座已见卫星
    pub satellites: BTreeMap<Constellation, BTreeSet<u8>>,
    /// 各星座已见信号
    pub signals: BTreeMap<Constellation, BTreeSet<String>>,
}

impl SatelliteSnapshot {
    /// 所有星座的卫星总数
    pub fn total_satellites(&self) -> usize {
        self.satellites.values().map(BTreeSet::len).sum()
    }
}

/// 单个 Caster 的统计
#[derive(Debug, Clone, Default)]
struct CasterStats {
    generation: u64,
    messages: BTreeMap<u16, MessageStat>,
    sky: SatelliteSnapshot,
    crc_failures: u64,
    decode_errors: u64,
}

impl CasterStats {
    fn merge(&mut self, message: &DecodedMessage, extraction: Option<&Extraction>, now: DateTime<Utc>) {
        self.messages
            .entry(message.msg_type)
            .and_modify(|stat| {
                stat.count += 1;
                stat.last_seen = now;
            })
            .or_insert(MessageStat { count: 1, last_seen: now });

        if let Some(ex) = extraction {
            if !ex.satellites.is_empty() {
                self.sky
                    .satellites
                    .entry(ex.constellation)
                    .or_default()
                    .extend(ex.satellites.iter().copied());
            }
            if !ex.signals.is_empty() {
                self.sky
                    .signals
                    .entry(ex.constellation)
                    .or_default()
                    .extend(ex.signals.iter().cloned());
            }
        }
    }
}

/// 解码异常计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeHealth {
    /// CRC 失败次数
    pub crc_failures: u64,
    /// 帧体解析错误次数
    pub decode_errors: u64,
}

/// 统计存储，由监管器持有并以句柄形式交给解码消费者
///
/// 每个 Caster 登记时分配一个代号，写入必须携带匹配的代号；
/// 移除或重建后，旧连接迟到的解码结果被丢弃。
#[derive(Debug, Clone, Default)]
pub struct StatsStore {
    casters: Arc<RwLock<HashMap<String, CasterStats>>>,
    next_generation: Arc<AtomicU64>,
}

impl StatsStore {
    /// 创建新的统计存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 Caster 并返回其统计代号，已登记时沿用原代号
    pub async fn register(&self, caster: &str) -> u64 {
        let mut casters = self.casters.write().await;
        if let Some(stats) = casters.get(caster) {
            return stats.generation;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        casters.insert(
            caster.to_string(),
            CasterStats {
                generation,
                ..CasterStats::default()
            },
        );
        generation
    }

    /// 合并单条消息，代号不匹配时返回 false
    pub async fn merge(
        &self,
        caster: &str,
        generation: u64,
        message: &DecodedMessage,
        extraction: Option<&Extraction>,
    ) -> bool {
        let mut casters = self.casters.write().await;
        match current(&mut casters, caster, generation) {
            Some(stats) => {
                stats.merge(message, extraction, Utc::now());
                true
            }
            None => false,
        }
    }

    /// 合并一轮解码的全部消息，只获取一次写锁
    pub async fn merge_all(&self, caster: &str, generation: u64, messages: &[DecodedMessage]) -> bool {
        let now = Utc::now();
        let mut casters = self.casters.write().await;
        let Some(stats) = current(&mut casters, caster, generation) else {
            debug!("Dropping {} stale message(s) for {}", messages.len(), caster);
            return false;
        };
        for message in messages {
            let extraction = extract(message);
            stats.merge(message, extraction.as_ref(), now);
        }
        true
    }

    /// 记录解码异常
    pub async fn record_decode_issues(&self, caster: &str, generation: u64, crc_failures: usize, decode_error: bool) {
        if crc_failures == 0 && !decode_error {
            return;
        }
        let mut casters = self.casters.write().await;
        if let Some(stats) = current(&mut casters, caster, generation) {
            stats.crc_failures += crc_failures as u64;
            if decode_error {
                stats.decode_errors += 1;
            }
        }
    }

/// 消息统计快照
    pub async fn message_stats(&self, caster: &str) -> BTreeMap<u16, MessageStat> {
        let casters = self.casters.read().await;
        casters.get(caster).map(|s| s.messages.clone()).unwrap_or_default()
    }

    /// 卫星与信号快照
    pub async fn satellite_stats(&self, caster: &str) -> SatelliteSnapshot {
        let casters = self.casters.read().await;
        casters.get(caster).map(|s| s.sky.clone()).unwrap_or_default()
    }

    /// 解码异常快照
    pub async fn decode_health(&self, caster: &str) -> DecodeHealth {
        let casters = self.casters.read().await;
        casters
            .get(caster)
            .map(|s| DecodeHealth {
                crc_failures: s.crc_failures,
                decode_errors: s.decode_errors,
            })
            .unwrap_or_default()
    }

    /// 清除某个 Caster 的全部统计
    pub async fn remove(&self, caster: &str) {
        if self.casters.write().await.remove(caster).is_some() {
            debug!("Statistics cleared for {}", caster);
        }
    }
}

fn current<'a>(
    casters: &'a mut HashMap<String, CasterStats>,
    caster: &str,
    generation: u64,
) -> Option<&'a mut CasterStats> {
    casters.get_mut(caster).filter(|s| s.generation == generation)
}

/// 按采样间隔计算各 Caster 的字节速率
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    last_totals: HashMap<String, u64>,
}

impl ThroughputMeter {
    /// 创建新的速率计
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录当前累计字节数并返回与上次采样的差值
    ///
    /// 连接被替换后累计值会回到 0，此时从新值重新计算。
    pub fn sample(&mut self, caster: &str, total: u64) -> u64 {
        let last = self.last_totals.insert(caster.to_string(), total).unwrap_or(0);
        total.checked_sub(last).unwrap_or(total)
    }

    /// 忘记某个 Caster
    pub fn forget(&mut self, caster: &str) {
        self.last_totals.remove(caster);
    }
}

/// 将运行时长格式化为 HH:MM:SS
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rtcm::MsmHeader;

    fn msm(msg_type: u16, prns: &[u8], signal_mask: u32) -> DecodedMessage {
        DecodedMessage {
            msg_type,
            payload_len: 40,
            msm: Some(MsmHeader {
                satellite_count: prns.len(),
                prns: prns.to_vec(),
                signal_mask,
                ..MsmHeader::default()
            }),
        }
    }

    #[tokio::test]
    async fn counts_are_per_identity_and_monotonic() {
        let store = StatsStore::new();
        let a = store.register("A").await;
        let plain = DecodedMessage {
            msg_type: 1005,
            payload_len: 19,
            msm: None,
        };

        assert!(store.merge("A", a, &plain, None).await);
        let first = store.message_stats("A").await[&1005].clone();
        store.merge_all("A", a, &[plain.clone(), msm(1074, &[1], 1)]).await;
        let stats = store.message_stats("A").await;

        assert_eq!(stats[&1005].count, 2);
        assert!(stats[&1005].last_seen >= first.last_seen);
        assert_eq!(stats[&1074].count, 1);
        assert!(store.message_stats("B").await.is_empty());
    }

    #[tokio::test]
    async fn satellite_sets_only_grow() {
        let store = StatsStore::new();
        let a = store.register("A").await;
        store.merge_all("A", a, &[msm(1074, &[4, 9], 0b1)]).await;
        store.merge_all("A", a, &[msm(1074, &[9, 17], 0b10)]).await;
        // 重复输入不改变集合
        store.merge_all("A", a, &[msm(1074, &[4], 0b1)]).await;

        let sky = store.satellite_stats("A").await;
        assert_eq!(sky.satellites[&Constellation::Gps], BTreeSet::from([4, 9, 17]));
        let signals: Vec<&str> = sky.signals[&Constellation::Gps].iter().map(String::as_str).collect();
        assert_eq!(signals, vec!["L1 C/A", "L1 P(Y)"]);
        assert_eq!(sky.total_satellites(), 3);
    }

    #[tokio::test]
    async fn remove_clears_caster() {
        let store = StatsStore::new();
        let a = store.register("A").await;
        let b = store.register("B").await;
        store.merge_all("A", a, &[msm(1084, &[2], 0)]).await;
        store.merge_all("B", b, &[msm(1094, &[11], 0)]).await;
        store.record_decode_issues("A", a, 2, true).await;
        assert_eq!(
            store.decode_health("A").await,
            DecodeHealth {
                crc_failures: 2,
                decode_errors: 1
            }
        );

        store.remove("A").await;
        assert!(store.message_stats("A").await.is_empty());
        assert_eq!(store.satellite_stats("A").await, SatelliteSnapshot::default());
        assert_eq!(store.decode_health("A").await, DecodeHealth::default());
        assert_eq!(store.message_stats("B").await[&1094].count, 1);
    }

    #[tokio::test]
    async fn stale_generation_cannot_recreate_stats() {
        let store = StatsStore::new();
        let old = store.register("A").await;
        assert_eq!(store.register("A").await, old);

        store.remove("A").await;
        assert!(!store.merge_all("A", old, &[msm(1074, &[4], 1)]).await);
        store.record_decode_issues("A", old, 3, true).await;
        assert!(store.message_stats("A").await.is_empty());
        assert_eq!(store.decode_health("A").await, DecodeHealth::default());

        // 同名重新登记后旧代号仍被拒绝
        let fresh = store.register("A").await;
        assert_ne!(fresh, old);
        assert!(!store.merge_all("A", old, &[msm(1074, &[4], 1)]).await);
        assert!(store.satellite_stats("A").await.satellites.is_empty());
        assert!(store.merge_all("A", fresh, &[msm(1074, &[9], 1)]).await);
        assert_eq!(
            store.satellite_stats("A").await.satellites[&Constellation::Gps],
            BTreeSet::from([9])
        );

        // 未登记的 Caster 不接受写入
        assert!(!store.merge_all("B", fresh, &[msm(1074, &[1], 1)]).await);
    }

    #[test]
    fn throughput_and_uptime() {
        let mut meter = ThroughputMeter::new();
        assert_eq!(meter.sample("A", 100), 100);
        assert_eq!(meter.sample("A", 350), 250);
        // 连接重建后计数归零
        assert_eq!(meter.sample("A", 20), 20);
        meter.forget("A");
        assert_eq!(meter.sample("A", 30), 30);

        assert_eq!(format_uptime(Duration::seconds(3 * 3600 + 25 * 60 + 7)), "03:25:07");
        assert_eq!(format_uptime(Duration::seconds(-5)), "00:00:00");
    }
}
