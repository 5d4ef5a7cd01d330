//! NTRIP 多 Caster 监测客户端核心库
//! 同时保持多路 RTCM 数据流，统计消息类型、卫星与信号

pub mod common;
pub mod config;
pub mod connection;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use common::error::{MonitorError, Result};
use common::rtcm::describe;
use common::satellite::Constellation;
use common::stats::{format_uptime, ThroughputMeter};
use config::{LogConfig, MonitorConfig};
use connection::{ConnectionEvent, ConnectionManager, DecodeConsumer};

/// 汇总输出间隔
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// 初始化日志
///
/// `RUST_LOG` 优先于配置的级别；配置了日志文件时额外按天滚动写入文件，
/// 返回的 guard 需在程序退出前保持存活。
pub fn init_logging(log: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let console = fmt::layer().with_target(false);

    match &log.file_path {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.map(|p| p.to_path_buf()).unwrap_or_else(|| ".".into());
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "ntrip-monitor.log".into());
            std::fs::create_dir_all(&dir)?;

            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

/// 单个 Caster 的周期汇总
#[derive(Debug, Serialize)]
struct CasterReport {
    name: String,
    status: Option<String>,
    bytes_per_second: u64,
    total_bytes: u64,
    uptime: Option<String>,
    messages: BTreeMap<u16, MessageReport>,
    constellations: BTreeMap<Constellation, ConstellationReport>,
    crc_failures: u64,
}

#[derive(Debug, Serialize)]
struct MessageReport {
    count: u64,
    description: String,
}

#[derive(Debug, Serialize)]
struct ConstellationReport {
    description: &'static str,
    satellites: Vec<u8>,
    signals: Vec<String>,
}

impl CasterReport {
    async fn collect(manager: &ConnectionManager, name: String, meter: &mut ThroughputMeter, now: DateTime<Utc>) -> Self {
        let stats = manager.stats();
        let total_bytes = manager.total_bytes_received(&name).await.unwrap_or(0);
        let sky = stats.satellite_stats(&name).await;

        let messages = stats
            .message_stats(&name)
            .await
            .into_iter()
            .map(|(msg_type, stat)| {
                let report = MessageReport {
                    count: stat.count,
                    description: describe(msg_type),
                };
                (msg_type, report)
            })
            .collect();

        let constellations = sky
            .satellites
            .keys()
            .chain(sky.signals.keys())
            .map(|c| {
                let report = ConstellationReport {
                    description: c.description(),
                    satellites: sky.satellites.get(c).map(|s| s.iter().copied().collect()).unwrap_or_default(),
                    signals: sky.signals.get(c).map(|s| s.iter().cloned().collect()).unwrap_or_default(),
                };
                (*c, report)
            })
            .collect();

        Self {
            bytes_per_second: meter.sample(&name, total_bytes),
            total_bytes,
            status: manager.status_text(&name).await,
            uptime: manager
                .uptime_since(&name)
                .await
                .map(|since| format_uptime(now - since)),
            messages,
            constellations,
            crc_failures: stats.decode_health(&name).await.crc_failures,
            name,
        }
    }

    fn total_satellites(&self) -> usize {
        self.constellations.values().map(|c| c.satellites.len()).sum()
    }
}

/// 运行监测客户端直到收到 Ctrl-C
pub async fn run(config: MonitorConfig) -> Result<()> {
    config.validate()?;

    let manager = Arc::new(ConnectionManager::new(config.connection.clone()));

    // 先订阅，保证首批数据事件不会丢失
    let consumer = DecodeConsumer::new(manager.clone());
    let consumer_task = tokio::spawn(consumer.run(manager.subscribe()));
    let status_task = tokio::spawn(log_status_events(manager.subscribe()));

    for caster in config.casters {
        let name = caster.name.clone();
        if let Err(e) = manager.start(caster).await {
            warn!("Failed to start {}: {}", name, e);
        }
    }
    info!("Monitoring {} caster(s)", manager.caster_names().await.len());

    let mut meter = ThroughputMeter::new();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                report(&manager, &mut meter).await;
            }
        }
    }

    manager.stop_all().await;
    status_task.abort();
    consumer_task.abort();
    info!("NTRIP monitor stopped");
    Ok(())
}

/// 输出状态变化，通道关闭后返回已输出的条数
async fn log_status_events(mut events: broadcast::Receiver<ConnectionEvent>) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Status { caster, status }) => {
                info!("[{}] {}", caster, status);
                logged += 1;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
    logged
}

async fn report(manager: &ConnectionManager, meter: &mut ThroughputMeter) {
    let now = Utc::now();

    for name in manager.caster_names().await {
        let report = CasterReport::collect(manager, name, meter, now).await;
        info!(
            "{}: {} B/s, uptime {}, {} message type(s), {} satellite(s)",
            report.name,
            report.bytes_per_second,
            report.uptime.as_deref().unwrap_or("--:--:--"),
            report.messages.len(),
            report.total_satellites()
        );
        match serde_json::to_string(&report) {
            Ok(json) => debug!("{}", json),
            Err(e) => debug!("Failed to serialize report: {}", e),
        }
    }
}
