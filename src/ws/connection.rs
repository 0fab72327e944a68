use crate::domain::{ConnectionMeta, Frame};
use crate::error::NotifyError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};

/// 连接状态机 / Connection state machine
///
/// `Opening → Open → Closing → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// 单个 WebSocket 连接 / One live socket
///
/// 出站队列有界；`enqueue` 从不阻塞，队列满即视为慢消费者。
/// The outbound queue is bounded; `enqueue` never blocks and a full queue marks a slow consumer.
pub struct Connection {
    pub user_id: i64,
    pub connection_id: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    state: AtomicU8,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    inbound_count: AtomicU64,
    written_count: AtomicU64,
}

impl Connection {
    /// 创建连接及其出站队列的接收端（由写循环持有）
    /// Create a connection and the receiving half of its outbound queue (owned by the writer).
    pub fn open(
        user_id: i64,
        remote_addr: impl Into<String>,
        user_agent: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Utc::now();
        let conn = Arc::new(Self {
            user_id,
            connection_id: uuid::Uuid::new_v4().to_string(),
            remote_addr: remote_addr.into(),
            user_agent: user_agent.into(),
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            state: AtomicU8::new(ConnectionState::Opening as u8),
            outbound: Mutex::new(Some(tx)),
            inbound_count: AtomicU64::new(0),
            written_count: AtomicU64::new(0),
        });
        (conn, rx)
    }

    /// 非阻塞入队 / Non-blocking enqueue
    pub fn enqueue(&self, frame: Frame) -> Result<(), NotifyError> {
        if self.state() >= ConnectionState::Closing {
            return Err(NotifyError::Transport(format!("connection {} is closing", self.connection_id)));
        }
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(NotifyError::Transport(format!("connection {} is closed", self.connection_id)));
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(NotifyError::Saturated {
                connection_id: self.connection_id.clone(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(NotifyError::Transport(format!("connection {} writer gone", self.connection_id)))
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Opening → Open`
    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Opening as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 进入 `Closing`，只有第一次调用返回 true
    /// Move to `Closing`; only the first caller gets `true`.
    pub fn begin_closing(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 释放出站队列；写循环在排空剩余帧后退出
    /// Release the outbound queue; the writer exits after flushing what is left.
    pub(crate) fn close(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        self.outbound.lock().take();
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.connected_at)
    }

    pub fn record_inbound(&self) -> u64 {
        self.touch();
        self.inbound_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inbound_count(&self) -> u64 {
        self.inbound_count.load(Ordering::Relaxed)
    }

    pub fn written_count(&self) -> u64 {
        self.written_count.load(Ordering::Relaxed)
    }

    /// 出站队列中等待写出的帧数
    pub fn queued(&self) -> usize {
        self.outbound
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn meta(&self, username: String) -> ConnectionMeta {
        ConnectionMeta {
            username,
            connection_id: self.connection_id.clone(),
            client_ip: self.remote_addr.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user_id", &self.user_id)
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// 关闭原因 / Close reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// 出站队列释放（注销或关闭）/ outbound queue released
    Normal,
    /// 写失败或写超时 / write failure or deadline
    Error,
}

/// 写循环的输出端，生产环境为 actix-ws 会话
/// Output side of the writer loop; an actix-ws session in production.
#[async_trait]
pub trait FrameSink: Send {
    /// 一次写出多帧，每帧仍是独立的文本消息
    /// Write several frames at once; each stays a separate text message.
    async fn send_batch(&mut self, frames: Vec<Frame>) -> Result<(), NotifyError>;
    async fn ping(&mut self) -> Result<(), NotifyError>;
    async fn close(self, kind: CloseKind);
}

/// 连接计时参数 / Connection timing
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTiming {
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub ping_write: Duration,
    pub max_frame_bytes: usize,
}

impl From<&crate::comm::settings::HubSettings> for ConnectionTiming {
    fn from(s: &crate::comm::settings::HubSettings) -> Self {
        Self {
            pong_wait: s.pong_wait(),
            ping_period: s.ping_period(),
            write_wait: s.write_wait(),
            ping_write: s.ping_write(),
            max_frame_bytes: s.max_frame_bytes,
        }
    }
}

/// 写循环退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteExit {
    /// 出站队列被释放（正常注销）/ outbound queue released
    Drained,
    Failed(NotifyError),
}

/// 写循环：排空出站队列并按周期发送 ping
/// Writer loop: drains the outbound queue and pings periodically.
///
/// 同一连接内帧按入队顺序写出。
/// Frames on one connection are written in enqueue order.
pub async fn write_loop<S: FrameSink>(
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Frame>,
    mut sink: S,
    timing: ConnectionTiming,
) -> WriteExit {
    let mut ticker = interval_at(Instant::now() + timing.ping_period, timing.ping_period);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(first) = maybe else {
                    let _ = timeout(timing.ping_write, sink.close(CloseKind::Normal)).await;
                    return WriteExit::Drained;
                };
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }
                let n = batch.len() as u64;
                match timeout(timing.write_wait, sink.send_batch(batch)).await {
                    Ok(Ok(())) => {
                        conn.written_count.fetch_add(n, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(connection_id = %conn.connection_id, "write failed: {}", e);
                        let _ = timeout(timing.ping_write, sink.close(CloseKind::Error)).await;
                        return WriteExit::Failed(e);
                    }
                    Err(_) => {
                        tracing::warn!(connection_id = %conn.connection_id, "write deadline exceeded");
                        let _ = timeout(timing.ping_write, sink.close(CloseKind::Error)).await;
                        return WriteExit::Failed(NotifyError::timeout("websocket write"));
                    }
                }
            }
            _ = ticker.tick() => {
                match timeout(timing.ping_write, sink.ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return WriteExit::Failed(e),
                    Err(_) => return WriteExit::Failed(NotifyError::timeout("websocket ping")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        written: Arc<Mutex<Vec<Vec<String>>>>,
        pings: Arc<AtomicU64>,
        closed: Arc<Mutex<Option<CloseKind>>>,
        fail: bool,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_batch(&mut self, frames: Vec<Frame>) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Transport("broken pipe".into()));
            }
            self.written
                .lock()
                .push(frames.iter().map(|f| f.to_string()).collect());
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), NotifyError> {
            self.pings.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn close(self, kind: CloseKind) {
            *self.closed.lock() = Some(kind);
        }
    }

    fn timing() -> ConnectionTiming {
        ConnectionTiming {
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_millis(30),
            write_wait: Duration::from_secs(1),
            ping_write: Duration::from_secs(1),
            max_frame_bytes: 4096,
        }
    }

    #[tokio::test]
    async fn test_enqueue_saturates_at_capacity() {
        let (conn, _rx) = Connection::open(9, "127.0.0.1", "test-agent/1.0", 2);
        assert!(conn.enqueue(Frame::from("a")).is_ok());
        assert!(conn.enqueue(Frame::from("b")).is_ok());
        assert_eq!(conn.queued(), 2);
        assert!(matches!(
            conn.enqueue(Frame::from("c")),
            Err(NotifyError::Saturated { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (conn, _rx) = Connection::open(1, "127.0.0.1", "test-agent/1.0", 4);
        assert_eq!(conn.state(), ConnectionState::Opening);
        assert!(conn.mark_open());
        assert!(!conn.mark_open());
        assert!(conn.begin_closing());
        assert!(!conn.begin_closing());
        assert!(conn.enqueue(Frame::from("x")).is_err());
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_writer_preserves_order_and_drains_on_close() {
        let (conn, rx) = Connection::open(1, "127.0.0.1", "test-agent/1.0", 16);
        for i in 0..5 {
            conn.enqueue(Frame::from(i.to_string())).unwrap();
        }
        let written = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(None));
        let sink = RecordingSink {
            written: written.clone(),
            pings: Arc::new(AtomicU64::new(0)),
            closed: closed.clone(),
            fail: false,
        };
        conn.close();
        let exit = write_loop(conn.clone(), rx, sink, timing()).await;
        assert_eq!(exit, WriteExit::Drained);
        let flat: Vec<String> = written.lock().iter().flatten().cloned().collect();
        assert_eq!(flat, vec!["0", "1", "2", "3", "4"]);
        // 已排队的帧合并为一次写出
        assert_eq!(written.lock().len(), 1);
        assert_eq!(conn.written_count(), 5);
        assert_eq!(*closed.lock(), Some(CloseKind::Normal));
    }

    #[tokio::test]
    async fn test_writer_pings_periodically() {
        let (conn, rx) = Connection::open(1, "127.0.0.1", "test-agent/1.0", 4);
        let pings = Arc::new(AtomicU64::new(0));
        let sink = RecordingSink {
            written: Arc::new(Mutex::new(Vec::new())),
            pings: pings.clone(),
            closed: Arc::new(Mutex::new(None)),
            fail: false,
        };
        let handle = tokio::spawn(write_loop(conn.clone(), rx, sink, timing()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.close();
        assert_eq!(handle.await.unwrap(), WriteExit::Drained);
        assert!(pings.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test]
    async fn test_writer_exits_on_write_error() {
        let (conn, rx) = Connection::open(1, "127.0.0.1", "test-agent/1.0", 4);
        conn.enqueue(Frame::from("x")).unwrap();
        let closed = Arc::new(Mutex::new(None));
        let sink = RecordingSink {
            written: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(AtomicU64::new(0)),
            closed: closed.clone(),
            fail: true,
        };
        let exit = write_loop(conn, rx, sink, timing()).await;
        assert!(matches!(exit, WriteExit::Failed(NotifyError::Transport(_))));
        assert_eq!(*closed.lock(), Some(CloseKind::Error));
    }
}
