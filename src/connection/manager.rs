//! 连接管理器，按 Caster 名称负责连接的创建、停止、重启与监控

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::buffer::PendingBuffer;
use super::caster::{CasterConnection, ConnectionEvent, ConnectionState};
use super::transport::{Connector, TcpConnector};
use crate::common::error::{Result, SupervisorError};
use crate::common::stats::StatsStore;
use crate::config::{CasterConfig, ConnectionSettings};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 连接统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// 已登记的连接数
    pub total: usize,
    /// 运行中的连接数
    pub running: usize,
    /// 正在推流的连接数
    pub streaming: usize,
    /// 全部连接累计接收字节
    pub total_rx_bytes: u64,
}

/// 连接管理器
pub struct ConnectionManager {
    /// 连接映射：Caster 名称 -> 连接
    connections: RwLock<HashMap<String, Arc<CasterConnection>>>,
    /// 统计存储
    stats: StatsStore,
    /// 连接器
    connector: Arc<dyn Connector>,
    /// 连接参数
    settings: ConnectionSettings,
    /// 事件广播
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// 创建使用 TCP 的连接管理器
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_connector(settings, Arc::new(TcpConnector))
    }

    /// 使用指定连接器创建连接管理器
    pub fn with_connector(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: RwLock::new(HashMap::new()),
            stats: StatsStore::new(),
            connector,
            settings,
            events,
        }
    }

    /// 订阅连接事件
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// 统计存储句柄
    pub fn stats(&self) -> StatsStore {
        self.stats.clone()
    }

    /// 启动连接，同名连接运行中时不做任何事并返回 false
    pub async fn start(&self, config: CasterConfig) -> Result<bool> {
        config.validate()?;

        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(&config.name) {
            if existing.is_running() {
                debug!("Connection {} already running", config.name);
                return Ok(false);
            }
        }

        let name = config.name.clone();
        info!("Starting connection {} -> {}:{}/{}", name, config.host, config.port, config.mount_path());
        let generation = self.stats.register(&name).await;
        let conn = CasterConnection::new(config, self.settings.clone(), self.events.clone(), generation);
        conn.start(self.connector.clone()).await;
        connections.insert(name, conn);
        Ok(true)
    }

    /// 停止连接并在限定时间内等待其退出
    pub async fn stop(&self, name: &str, user_initiated: bool) -> Result<()> {
        let conn = self
            .get(name)
            .await
            .ok_or_else(|| SupervisorError::UnknownCaster(name.to_string()))?;
        self.stop_connection(&conn, user_initiated).await;
        Ok(())
    }

    /// 以新配置重启连接，旧名称的统计被清除
    pub async fn restart(&self, old_name: &str, config: CasterConfig) -> Result<()> {
        config.validate()?;
        if config.name != old_name && self.get(&config.name).await.is_some() {
            return Err(SupervisorError::DuplicateName(config.name).into());
        }

        let old = self.connections.write().await.remove(old_name);
        if let Some(conn) = old {
            self.stop_connection(&conn, false).await;
        }
        self.stats.remove(old_name).await;
        if config.name != old_name {
            info!("Caster {} renamed to {}", old_name, config.name);
        }

        self.start(config).await?;
        Ok(())
    }

    /// 移除连接并清除其统计
    pub async fn remove(&self, name: &str) -> Result<()> {
        let conn = self
            .connections
            .write()
            .await
            .remove(name)
            .ok_or_else(|| SupervisorError::UnknownCaster(name.to_string()))?;
        self.stop_connection(&conn, false).await;
        self.stats.remove(name).await;
        info!("Caster {} removed", name);
        Ok(())
    }

    /// 停止全部连接
    pub async fn stop_all(&self) {
        let connections: Vec<Arc<CasterConnection>> = self.connections.read().await.values().cloned().collect();
        for conn in &connections {
            conn.stop(false);
        }
        for conn in &connections {
            conn.join(self.settings.join_timeout()).await;
        }
        info!("Stopped {} connection(s)", connections.len());
    }

    /// 重新启动所有未运行的连接，返回启动数量
    pub async fn connect_all_disconnected(&self) -> usize {
        let stopped: Vec<CasterConfig> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| !c.is_running())
            .map(|c| c.config().clone())
            .collect();

        let mut started = 0;
        for config in stopped {
            let name = config.name.clone();
            match self.start(config).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to start {}: {}", name, e),
            }
        }

        if started > 0 {
            info!("Connecting {} disconnected caster(s)", started);
        } else {
            info!("All casters already connected");
        }
        started
    }

    /// 累计接收字节数
    pub async fn total_bytes_received(&self, name: &str) -> Option<u64> {
        self.get(name).await.map(|c| c.total_bytes_received())
    }

    /// 是否运行中
    pub async fn is_running(&self, name: &str) -> bool {
        self.get(name).await.map(|c| c.is_running()).unwrap_or(false)
    }

    /// 运行中连接的启动时间
    pub async fn uptime_since(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name)
            .await
            .filter(|c| c.is_running())
            .map(|c| c.started_at())
    }

    /// 连接状态
    pub async fn state(&self, name: &str) -> Option<ConnectionState> {
        match self.get(name).await {
            Some(conn) => Some(conn.state().await),
            None => None,
        }
    }

    /// 连续失败次数
    pub async fn retry_count(&self, name: &str) -> Option<u32> {
        self.get(name).await.map(|c| c.retry_count())
    }

    /// 最近一次状态文本
    pub async fn status_text(&self, name: &str) -> Option<String> {
        match self.get(name).await {
            Some(conn) => conn.status_text().await,
            None => None,
        }
    }

    /// 连接的待解码缓冲区
    pub async fn buffer(&self, name: &str) -> Option<Arc<PendingBuffer>> {
        self.get(name).await.map(|c| c.buffer())
    }

    /// 当前登记的连接
    pub async fn connection(&self, name: &str) -> Option<Arc<CasterConnection>> {
        self.get(name).await
    }

    /// 已登记的 Caster 名称，按字母序
    pub async fn caster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 汇总计数
    pub async fn connection_stats(&self) -> ConnectionStats {
        let connections: Vec<Arc<CasterConnection>> = self.connections.read().await.values().cloned().collect();
        let mut stats = ConnectionStats {
            total: connections.len(),
            ..ConnectionStats::default()
        };
        for conn in connections {
            if conn.is_running() {
                stats.running += 1;
            }
            if conn.state().await == ConnectionState::Streaming {
                stats.streaming += 1;
            }
            stats.total_rx_bytes += conn.total_bytes_received();
        }
        stats
    }

    async fn get(&self, name: &str) -> Option<Arc<CasterConnection>> {
        self.connections.read().await.get(name).cloned()
    }

    async fn stop_connection(&self, conn: &CasterConnection, user_initiated: bool) {
        conn.stop(user_initiated);
        if !conn.join(self.settings.join_timeout()).await {
            warn!("Connection {} still shutting down", conn.name());
        }
    }
}
