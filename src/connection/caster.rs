//! 单个 Caster 的连接状态机
//! 连接 → 握手 → 流读取 → {重连 | 断开}，停止请求可随时打断读取与重连等待

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::buffer::PendingBuffer;
use super::transport::{BoxedStream, Connector};
use crate::common::error::{ConnectionError, FailureKind};
use crate::common::ntrip::{self, StreamRequest};
use crate::config::{CasterConfig, ConnectionSettings};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 未启动
    Idle,
    /// TCP 连接中
    Connecting,
    /// NTRIP 握手中
    Handshaking,
    /// 数据流读取中
    Streaming,
    /// 等待重连
    Reconnecting,
    /// 本轮运行结束
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Handshaking => write!(f, "Handshaking"),
            ConnectionState::Streaming => write!(f, "Streaming"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// 面向展示层的状态更新
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// 开始连接
    Connecting,
    /// 握手成功
    Connected,
    /// 本次尝试失败
    Failed(FailureKind),
    /// 准备第 attempt 次重连
    Reconnecting {
        /// 当前次数
        attempt: u32,
        /// 上限
        max: u32,
    },
    /// 已断开，None 表示用户主动停止
    Disconnected(Option<FailureKind>),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "Connecting..."),
            ConnectionStatus::Connected => write!(f, "Connection OK"),
            ConnectionStatus::Failed(kind) => write!(f, "{}", kind),
            ConnectionStatus::Reconnecting { attempt, max } => write!(f, "Reconnecting ({}/{})...", attempt, max),
            ConnectionStatus::Disconnected(Some(kind)) => write!(f, "Disconnected ({})", kind),
            ConnectionStatus::Disconnected(None) => write!(f, "Disconnected (User stopped)"),
        }
    }
}

/// 连接事件，只携带 Caster 名称，消费者需自行在锁内重新读取状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// 状态变化
    Status {
        /// Caster 名称
        caster: String,
        /// 状态
        status: ConnectionStatus,
    },
    /// 缓冲区有新数据
    DataAvailable {
        /// Caster 名称
        caster: String,
    },
    /// 运行结束
    Disconnected {
        /// Caster 名称
        caster: String,
    },
}

impl ConnectionEvent {
    /// 事件所属 Caster
    pub fn caster(&self) -> &str {
        match self {
            ConnectionEvent::Status { caster, .. }
            | ConnectionEvent::DataAvailable { caster }
            | ConnectionEvent::Disconnected { caster } => caster,
        }
    }
}

/// Caster 连接
#[derive(Debug)]
pub struct CasterConnection {
    /// 配置
    config: CasterConfig,
    /// 连接参数
    settings: ConnectionSettings,
    /// 待解码缓冲区
    buffer: Arc<PendingBuffer>,
    /// 累计接收字节数，仅由连接任务递增
    total_bytes: AtomicU64,
    /// 连续失败次数
    retry_count: AtomicU32,
    /// 运行标志
    running: AtomicBool,
    /// 是否为用户主动停止
    user_stopped: AtomicBool,
    /// 停止信号
    cancel: CancellationToken,
    /// 启动时间
    started_at: DateTime<Utc>,
    /// 当前状态
    state: RwLock<ConnectionState>,
    /// 最近一次状态文本
    last_status: RwLock<Option<String>>,
    /// 事件通道
    events: broadcast::Sender<ConnectionEvent>,
    /// 连接任务句柄
    task: Mutex<Option<JoinHandle<()>>>,
    /// 统计代号
    stats_generation: u64,
}

impl CasterConnection {
    /// 创建新的连接 (未启动)
    pub fn new(
        config: CasterConfig,
        settings: ConnectionSettings,
        events: broadcast::Sender<ConnectionEvent>,
        stats_generation: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            settings,
            buffer: Arc::new(PendingBuffer::new()),
            total_bytes: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
            running: AtomicBool::new(false),
            user_stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
            state: RwLock::new(ConnectionState::Idle),
            last_status: RwLock::new(None),
            events,
            task: Mutex::new(None),
            stats_generation,
        })
    }

    /// Caster 名称
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 配置
    pub fn config(&self) -> &CasterConfig {
        &self.config
    }

    /// 待解码缓冲区
    pub fn buffer(&self) -> Arc<PendingBuffer> {
        self.buffer.clone()
    }

    /// 本连接写入统计时使用的代号
    pub fn stats_generation(&self) -> u64 {
        self.stats_generation
    }

    /// 累计接收字节数
    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// 连续失败次数
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// 是否运行中
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 是否被用户主动停止
    pub fn is_user_stopped(&self) -> bool {
        self.user_stopped.load(Ordering::Acquire)
    }

    /// 启动时间
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 当前状态
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// 最近一次状态文本
    pub async fn status_text(&self) -> Option<String> {
        self.last_status.read().await.clone()
    }

    /// 启动连接任务，已启动或已停止的实例不会重复启动
    pub async fn start(self: &Arc<Self>, connector: Arc<dyn Connector>) {
        let mut task = self.task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        self.running.store(true, Ordering::Release);
        self.emit_status(ConnectionStatus::Connecting).await;

        let conn = self.clone();
        *task = Some(tokio::spawn(async move {
            conn.run(connector).await;
        }));
    }

    /// 停止连接
    ///
    /// 可在任意线程重复调用。取消信号会立即打断进行中的连接、读取和重连等待，
    /// 连接任务随后关闭套接字。
    pub fn stop(&self, user_initiated: bool) {
        self.running.store(false, Ordering::Release);
        if user_initiated {
            self.user_stopped.store(true, Ordering::Release);
        }
        self.cancel.cancel();
    }

    /// 等待连接任务退出，超时返回 false
    pub async fn join(&self, limit: Duration) -> bool {
        let handle = self.task.lock().await.take();
        match handle {
            Some(handle) => match timeout(limit, handle).await {
                Ok(_) => true,
                Err(_) => {
                    warn!("Connection task for {} did not stop within {:?}", self.name(), limit);
                    false
                }
            },
            None => true,
        }
    }

    /// 连接主循环
    async fn run(self: Arc<Self>, connector: Arc<dyn Connector>) {
        let max_retries = self.settings.max_retries;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let err = match self.session(connector.as_ref()).await {
                Ok(()) => break,
                Err(e) => e,
            };

            // 本地停止导致的套接字错误不上报
            if self.cancel.is_cancelled() {
                debug!("Socket closed for {} (expected during shutdown): {}", self.name(), err);
                break;
            }

            let kind = err.kind();
            warn!("Connection error for {}: {}", self.name(), err);
            self.emit_status(ConnectionStatus::Failed(kind)).await;

            let attempt = self.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
            if attempt > max_retries {
                self.emit_status(ConnectionStatus::Disconnected(Some(kind))).await;
                break;
            }

            self.set_state(ConnectionState::Reconnecting).await;
            self.emit_status(ConnectionStatus::Reconnecting {
                attempt,
                max: max_retries,
            })
            .await;
            if !self.backoff().await {
                break;
            }
        }

        self.running.store(false, Ordering::Release);
        self.set_state(ConnectionState::Disconnected).await;
        if self.is_user_stopped() {
            self.emit_status(ConnectionStatus::Disconnected(None)).await;
        }
        info!("Connection to {} finished", self.name());
        let _ = self.events.send(ConnectionEvent::Disconnected {
            caster: self.config.name.clone(),
        });
    }

    /// 可取消的重连等待，被取消返回 false
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.settings.reconnect_backoff()) => !self.cancel.is_cancelled(),
        }
    }

    /// 单次连接会话，仅在被本地停止时返回 Ok
    async fn session(&self, connector: &dyn Connector) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting).await;
        let connect_timeout = self.settings.connect_timeout();

        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            res = timeout(connect_timeout, connector.connect(&self.config.host, self.config.port)) => {
                res.map_err(|_| ConnectionError::Timeout("connect"))??
            }
        };

        self.set_state(ConnectionState::Handshaking).await;
        let handshake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            res = timeout(connect_timeout, self.handshake(&mut stream)) => {
                Some(res.map_err(|_| ConnectionError::Timeout("handshake")).and_then(|r| r))
            }
        };
        let result = match handshake {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok(())) => {
                self.retry_count.store(0, Ordering::Release);
                self.set_state(ConnectionState::Streaming).await;
                info!("Connected to {} ({}:{}/{})", self.name(), self.config.host, self.config.port, self.config.mount_path());
                self.emit_status(ConnectionStatus::Connected).await;
                self.stream_loop(&mut stream).await
            }
        };

        // shutdown 只关闭写方向，流在函数返回时被丢弃，套接字随之完全关闭
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown of {} socket failed: {}", self.name(), e);
        }
        result
    }

    /// 发送流请求并校验响应头
    async fn handshake(&self, stream: &mut BoxedStream) -> Result<(), ConnectionError> {
        let request = StreamRequest {
            mount: self.config.mount_path(),
            username: &self.config.username,
            password: &self.config.password,
            user_agent: &self.settings.user_agent,
        }
        .encode();
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut header = vec![0u8; self.settings.header_buffer_size];
        let n = stream.read(&mut header).await?;
        ntrip::check_response(&header[..n])
    }

    /// 读取数据流直到出错或被停止
    async fn stream_loop(&self, stream: &mut BoxedStream) -> Result<(), ConnectionError> {
        let mut chunk = vec![0u8; self.settings.read_chunk_size];
        let read_timeout = self.settings.read_timeout();

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = timeout(read_timeout, stream.read(&mut chunk)) => res,
            };

            let n = match read {
                Err(_) => {
                    trace!("Read timeout on {}, retrying", self.name());
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(0)) => return Err(ConnectionError::ClosedByServer),
                Ok(Ok(n)) => n,
            };

            self.buffer.append(&chunk[..n]).await;
            self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
            let _ = self.events.send(ConnectionEvent::DataAvailable {
                caster: self.config.name.clone(),
            });
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn emit_status(&self, status: ConnectionStatus) {
        let text = status.to_string();
        debug!("{}: {}", self.name(), text);
        *self.last_status.write().await = Some(text);
        let _ = self.events.send(ConnectionEvent::Status {
            caster: self.config.name.clone(),
            status,
        });
    }
}
