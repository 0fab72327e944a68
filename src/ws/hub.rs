use crate::domain::{ConnectionMeta, Frame};
use crate::error::NotifyError;
use crate::ws::connection::{Connection, ConnectionState};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use utoipa::ToSchema;

/// Hub 请求通道容量
const CONTROL_CHANNEL_CAPACITY: usize = 1024;

/// Hub 使用的在线状态写入接口
/// Narrow presence interface the hub writes through.
#[async_trait]
pub trait PresenceWriter: Send + Sync {
    async fn mark_online(&self, user_id: i64, meta: &ConnectionMeta);
    async fn mark_offline(&self, user_id: i64);
}

/// 不记录在线状态 / Discards presence updates
pub struct NoopPresence;

#[async_trait]
impl PresenceWriter for NoopPresence {
    async fn mark_online(&self, _user_id: i64, _meta: &ConnectionMeta) {}
    async fn mark_offline(&self, _user_id: i64) {}
}

struct RegisterRequest {
    conn: Arc<Connection>,
    ack: oneshot::Sender<bool>,
}

struct UnregisterRequest {
    conn: Arc<Connection>,
    /// `Some(user_gone)` 表示已移除 / `Some(user_gone)` when the connection was removed
    ack: oneshot::Sender<Option<bool>>,
}

/// Hub 统计 / Hub statistics
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct HubStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_messages: u64,
    pub unique_users: usize,
    pub max_user_connections: usize,
    pub avg_connections_per_user: f64,
    pub ip_connections: HashMap<String, usize>,
    pub inbound_messages: u64,
    pub failed_deliveries: u64,
}

#[derive(Default)]
struct HubCounters {
    active: AtomicUsize,
    total: AtomicU64,
    messages: AtomicU64,
    inbound: AtomicU64,
    failed_deliveries: AtomicU64,
}

struct HubShared {
    by_user: Mutex<HashMap<i64, Vec<Arc<Connection>>>>,
    counters: HubCounters,
    presence: Arc<dyn PresenceWriter>,
}

/// 连接注册中心句柄 / Handle to the connection registry
///
/// `connections` 只由控制循环持有；`by_user` 由互斥锁保护，
/// 供分发工作线程直接读取。
/// `connections` is owned by the control loop alone; `by_user` sits behind a mutex
/// so dispatcher workers can read it directly.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<UnregisterRequest>,
    broadcast_tx: mpsc::Sender<Frame>,
    snapshot_tx: mpsc::Sender<oneshot::Sender<HubStats>>,
}

impl Hub {
    /// 启动控制循环 / Spawn the control loop
    pub fn spawn(presence: Arc<dyn PresenceWriter>, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(HubShared {
            by_user: Mutex::new(HashMap::new()),
            counters: HubCounters::default(),
            presence,
        });
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(16);

        let control = HubLoop {
            shared: shared.clone(),
            connections: HashMap::new(),
        };
        let handle = tokio::spawn(control.run(register_rx, unregister_rx, broadcast_rx, snapshot_rx, shutdown));

        (
            Self {
                shared,
                register_tx,
                unregister_tx,
                broadcast_tx,
                snapshot_tx,
            },
            handle,
        )
    }

    /// 注册连接并写入在线状态；同一连接重复注册返回 `Ok(false)`
    /// Register a connection and mark its user online; re-registering returns `Ok(false)`.
    pub async fn register(&self, conn: Arc<Connection>, meta: &ConnectionMeta) -> Result<bool, NotifyError> {
        let (ack, done) = oneshot::channel();
        self.register_tx
            .send(RegisterRequest { conn: conn.clone(), ack })
            .await
            .map_err(|_| NotifyError::Closed)?;
        let added = done.await.map_err(|_| NotifyError::Closed)?;
        if added {
            self.shared.presence.mark_online(conn.user_id, meta).await;
        } else if conn.state() >= ConnectionState::Closing {
            return Err(NotifyError::Transport(format!(
                "connection {} closed before registration",
                conn.connection_id
            )));
        }
        Ok(added)
    }

    /// 注销连接；只有第一次调用生效，用户最后一个连接断开时标记离线
    /// Unregister a connection; only the first call takes effect and the user is marked
    /// offline once their last socket is gone.
    pub async fn unregister(&self, conn: &Arc<Connection>) -> bool {
        if !conn.begin_closing() {
            return false;
        }
        let (ack, done) = oneshot::channel();
        if self
            .unregister_tx
            .send(UnregisterRequest { conn: conn.clone(), ack })
            .await
            .is_err()
        {
            conn.close();
            return false;
        }
        match done.await {
            Ok(Some(user_gone)) => {
                if user_gone {
                    self.shared.presence.mark_offline(conn.user_id).await;
                }
                true
            }
            _ => false,
        }
    }

    /// 发送给某个用户的所有连接，返回成功入队的数量
    /// Enqueue to every socket of a user; returns how many accepted the frame.
    ///
    /// 饱和的连接立即从 `by_user` 移除，然后提交注销请求。
    /// Saturated sockets leave `by_user` immediately, then an unregister is submitted.
    pub async fn send_to_user(&self, user_id: i64, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let mut by_user = self.shared.by_user.lock();
            if let Some(list) = by_user.get_mut(&user_id) {
                list.retain(|conn| match conn.enqueue(frame.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(e) => {
                        tracing::warn!(user_id, connection_id = %conn.connection_id, "dropping connection: {}", e);
                        dropped.push(conn.clone());
                        false
                    }
                });
                if list.is_empty() {
                    by_user.remove(&user_id);
                }
            }
        }

        let counters = &self.shared.counters;
        counters.messages.fetch_add(delivered as u64, Ordering::Relaxed);
        counters
            .failed_deliveries
            .fetch_add(dropped.len() as u64, Ordering::Relaxed);
        for conn in dropped {
            self.unregister(&conn).await;
        }
        delivered
    }

    /// 广播给所有连接（不等待完成）/ Fire-and-forget broadcast
    pub async fn broadcast(&self, frame: Frame) -> Result<(), NotifyError> {
        self.broadcast_tx.send(frame).await.map_err(|_| NotifyError::Closed)
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.shared.by_user.lock().contains_key(&user_id)
    }

    pub fn user_connection_count(&self, user_id: i64) -> usize {
        self.shared.by_user.lock().get(&user_id).map_or(0, Vec::len)
    }

    pub fn online_user_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.shared.by_user.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn active_connections(&self) -> usize {
        self.shared.counters.active.load(Ordering::Relaxed)
    }

    pub fn record_inbound(&self) {
        self.shared.counters.inbound.fetch_add(1, Ordering::Relaxed);
    }

    /// 通过控制循环获取完整统计；循环已停止时只返回计数器
    /// Full statistics from the control loop; counters only once the loop has stopped.
    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        if self.snapshot_tx.send(reply).await.is_ok() {
            if let Ok(stats) = rx.await {
                return stats;
            }
        }
        self.shared.counter_stats()
    }
}

impl HubShared {
    fn counter_stats(&self) -> HubStats {
        HubStats {
            active_connections: self.counters.active.load(Ordering::Relaxed),
            total_connections: self.counters.total.load(Ordering::Relaxed),
            total_messages: self.counters.messages.load(Ordering::Relaxed),
            inbound_messages: self.counters.inbound.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed_deliveries.load(Ordering::Relaxed),
            ..HubStats::default()
        }
    }
}

/// 串行控制循环，独占 `connections`
struct HubLoop {
    shared: Arc<HubShared>,
    connections: HashMap<String, Arc<Connection>>,
}

impl HubLoop {
    async fn run(
        mut self,
        mut register_rx: mpsc::Receiver<RegisterRequest>,
        mut unregister_rx: mpsc::Receiver<UnregisterRequest>,
        mut broadcast_rx: mpsc::Receiver<Frame>,
        mut snapshot_rx: mpsc::Receiver<oneshot::Sender<HubStats>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("✅ Hub control loop started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(req) = register_rx.recv() => {
                    let added = self.register(req.conn);
                    let _ = req.ack.send(added);
                }
                Some(req) = unregister_rx.recv() => {
                    let outcome = self.unregister(&req.conn);
                    if outcome.is_none() {
                        req.conn.close();
                    }
                    let _ = req.ack.send(outcome);
                }
                Some(frame) = broadcast_rx.recv() => {
                    self.broadcast(frame).await;
                }
                Some(reply) = snapshot_rx.recv() => {
                    let _ = reply.send(self.snapshot());
                }
                else => break,
            }
        }
        self.close_all().await;
        tracing::info!("👋 Hub control loop stopped");
    }

    fn register(&mut self, conn: Arc<Connection>) -> bool {
        if self.connections.contains_key(&conn.connection_id) || conn.state() >= ConnectionState::Closing {
            return false;
        }
        self.connections.insert(conn.connection_id.clone(), conn.clone());
        self.shared
            .by_user
            .lock()
            .entry(conn.user_id)
            .or_default()
            .push(conn.clone());
        conn.mark_open();

        let counters = &self.shared.counters;
        let active = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
        counters.total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            user_id = conn.user_id,
            connection_id = %conn.connection_id,
            remote_addr = %conn.remote_addr,
            active,
            "📨 Connection registered"
        );
        true
    }

    /// 返回 `Some(user_gone)`；连接不存在时为 `None`
    fn unregister(&mut self, conn: &Arc<Connection>) -> Option<bool> {
        let removed = self.connections.remove(&conn.connection_id)?;
        let user_gone = {
            let mut by_user = self.shared.by_user.lock();
            if let Some(list) = by_user.get_mut(&removed.user_id) {
                list.retain(|c| c.connection_id != removed.connection_id);
                if list.is_empty() {
                    by_user.remove(&removed.user_id);
                }
            }
            !by_user.contains_key(&removed.user_id)
        };
        removed.close();
        let active = self.shared.counters.active.fetch_sub(1, Ordering::Relaxed) - 1;
        tracing::info!(
            user_id = removed.user_id,
            connection_id = %removed.connection_id,
            active,
            "👋 Connection unregistered"
        );
        Some(user_gone)
    }

    async fn broadcast(&mut self, frame: Frame) {
        let mut saturated = Vec::new();
        let mut delivered = 0u64;
        for conn in self.connections.values() {
            match conn.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %conn.connection_id, "broadcast dropping connection: {}", e);
                    saturated.push(conn.clone());
                }
            }
        }
        let counters = &self.shared.counters;
        counters.messages.fetch_add(delivered, Ordering::Relaxed);
        counters
            .failed_deliveries
            .fetch_add(saturated.len() as u64, Ordering::Relaxed);

        let mut gone_users = Vec::new();
        for conn in saturated {
            // 已在关闭中的连接由其持有者提交注销
            if !conn.begin_closing() {
                continue;
            }
            if let Some(true) = self.unregister(&conn) {
                gone_users.push(conn.user_id);
            }
        }
        if !gone_users.is_empty() {
            let presence = self.shared.presence.clone();
            tokio::spawn(async move {
                for user_id in gone_users {
                    presence.mark_offline(user_id).await;
                }
            });
        }
    }

    fn snapshot(&self) -> HubStats {
        let mut stats = self.shared.counter_stats();
        stats.active_connections = self.connections.len();
        for conn in self.connections.values() {
            *stats.ip_connections.entry(conn.remote_addr.clone()).or_insert(0) += 1;
        }
        let by_user = self.shared.by_user.lock();
        stats.unique_users = by_user.len();
        stats.max_user_connections = by_user.values().map(Vec::len).max().unwrap_or(0);
        if stats.unique_users > 0 {
            stats.avg_connections_per_user = self.connections.len() as f64 / stats.unique_users as f64;
        }
        stats
    }

    async fn close_all(&mut self) {
        let conns: Vec<Arc<Connection>> = self.connections.values().cloned().collect();
        let mut gone_users = Vec::new();
        for conn in conns {
            conn.begin_closing();
            if let Some(true) = self.unregister(&conn) {
                gone_users.push(conn.user_id);
            }
        }
        for user_id in gone_users {
            self.shared.presence.mark_offline(user_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPresence {
        events: Mutex<Vec<(i64, bool)>>,
    }

    #[async_trait]
    impl PresenceWriter for RecordingPresence {
        async fn mark_online(&self, user_id: i64, _meta: &ConnectionMeta) {
            self.events.lock().push((user_id, true));
        }
        async fn mark_offline(&self, user_id: i64) {
            self.events.lock().push((user_id, false));
        }
    }

    fn spawn_hub() -> (Hub, Arc<RecordingPresence>, watch::Sender<bool>, JoinHandle<()>) {
        let presence = Arc::new(RecordingPresence::default());
        let (tx, rx) = watch::channel(false);
        let (hub, handle) = Hub::spawn(presence.clone(), rx);
        (hub, presence, tx, handle)
    }

    async fn connect(hub: &Hub, user_id: i64, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (conn, rx) = Connection::open(user_id, "10.0.0.1", "test-agent/1.0", capacity);
        hub.register(conn.clone(), &conn.meta(format!("user{}", user_id)))
            .await
            .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (hub, presence, _tx, _h) = spawn_hub();
        let (conn, _rx) = connect(&hub, 1, 8).await;
        assert!(!hub.register(conn.clone(), &conn.meta(String::new())).await.unwrap());
        assert_eq!(hub.active_connections(), 1);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(presence.events.lock().as_slice(), &[(1, true)]);
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let (hub, presence, _tx, _h) = spawn_hub();
        let (conn, _rx) = connect(&hub, 1, 8).await;
        assert!(hub.unregister(&conn).await);
        assert!(!hub.unregister(&conn).await);
        assert_eq!(hub.active_connections(), 0);
        assert!(!hub.is_online(1));
        assert_eq!(presence.events.lock().as_slice(), &[(1, true), (1, false)]);
    }

    #[tokio::test]
    async fn test_offline_only_after_last_socket() {
        let (hub, presence, _tx, _h) = spawn_hub();
        let (a, _ra) = connect(&hub, 5, 8).await;
        let (b, _rb) = connect(&hub, 5, 8).await;
        assert_eq!(hub.user_connection_count(5), 2);
        hub.unregister(&a).await;
        assert!(hub.is_online(5));
        hub.unregister(&b).await;
        assert!(!hub.is_online(5));
        let offline: Vec<_> = presence.events.lock().iter().filter(|e| !e.1).cloned().collect();
        assert_eq!(offline, vec![(5, false)]);
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_every_socket() {
        let (hub, _p, _tx, _h) = spawn_hub();
        let (_a, mut ra) = connect(&hub, 3, 8).await;
        let (_b, mut rb) = connect(&hub, 3, 8).await;
        let frame = Frame::from("hello");
        assert_eq!(hub.send_to_user(3, &frame).await, 2);
        assert_eq!(&*ra.recv().await.unwrap(), "hello");
        assert_eq!(&*rb.recv().await.unwrap(), "hello");
        assert_eq!(hub.send_to_user(99, &frame).await, 0);
    }

    #[tokio::test]
    async fn test_saturated_socket_is_dropped() {
        let (hub, _p, _tx, _h) = spawn_hub();
        let (slow, _rx) = connect(&hub, 9, 2).await;
        let frame = Frame::from("x");
        assert_eq!(hub.send_to_user(9, &frame).await, 1);
        assert_eq!(hub.send_to_user(9, &frame).await, 1);
        assert_eq!(hub.send_to_user(9, &frame).await, 0);
        assert!(!hub.is_online(9));
        assert_eq!(hub.active_connections(), 0);
        assert_eq!(slow.state(), ConnectionState::Closed);
        assert_eq!(hub.stats().await.failed_deliveries, 1);
    }

    #[tokio::test]
    async fn test_broadcast_and_stats() {
        let (hub, _p, _tx, _h) = spawn_hub();
        let (_a, mut ra) = connect(&hub, 1, 8).await;
        let (_b, mut rb) = connect(&hub, 2, 8).await;
        let (_c, _rc) = connect(&hub, 2, 8).await;
        hub.broadcast(Frame::from("all")).await.unwrap();
        assert_eq!(&*tokio::time::timeout(Duration::from_secs(1), ra.recv()).await.unwrap().unwrap(), "all");
        assert_eq!(&*tokio::time::timeout(Duration::from_secs(1), rb.recv()).await.unwrap().unwrap(), "all");

        let stats = hub.stats().await;
        assert_eq!(stats.active_connections, 3);
        assert_eq!(stats.unique_users, 2);
        assert_eq!(stats.max_user_connections, 2);
        assert_eq!(stats.ip_connections.get("10.0.0.1"), Some(&3));
        assert_eq!(stats.total_messages, 3);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (hub, presence, tx, handle) = spawn_hub();
        let (conn, mut rx) = connect(&hub, 4, 8).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(rx.recv().await.is_none());
        assert!(!hub.is_online(4));
        assert!(presence.events.lock().contains(&(4, false)));
        assert!(matches!(
            hub.register(Connection::open(4, "10.0.0.1", "test-agent/1.0", 4).0, &ConnectionMeta::default())
                .await,
            Err(NotifyError::Closed)
        ));
    }
}
