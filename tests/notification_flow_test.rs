//! 通知核心端到端流程：内存存储 + 通道连接
//! End-to-end flows through the core with in-memory stores and channel-backed connections.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use vgo_notify::comm::NotifySettings;
use vgo_notify::domain::{
    AckKind, DeliveryRecord, DeliveryStatus, Frame, MessageCounts, Notification, NotificationLog, NotificationType,
    OnlineStatus, Page, PageRequest, Priority, PushChannel, PushRecord, PushStatus, RecordQuery,
};
use vgo_notify::error::NotifyError;
use vgo_notify::service::{CoreStores, NotificationCore};
use vgo_notify::storage::{
    IndexSpec, LedgerStore, MemoryLedgerStore, MemoryOfflineStore, StaticDirectory, StoreResult, REQUIRED_INDEXES,
};
use vgo_notify::ws::Connection;

const AGENT: &str = "Mozilla/5.0 (integration)";

struct Fixture {
    core: Arc<NotificationCore>,
    ledger: Arc<MemoryLedgerStore>,
    offline: Arc<MemoryOfflineStore>,
    directory: Arc<StaticDirectory>,
}

/// 包装内存台账：可让推送记录与日志写入变慢，或在读取在线行后暂停
/// Wraps the memory ledger: push-record and log writes can be slowed down, and the
/// online-row read can pause until released.
#[derive(Default)]
struct HookedLedger {
    inner: Arc<MemoryLedgerStore>,
    write_delay: Mutex<Duration>,
    rows_gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
}

impl HookedLedger {
    async fn slow_write(&self) {
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LedgerStore for HookedLedger {
    async fn ensure_indexes(&self, specs: &[IndexSpec]) -> StoreResult<()> {
        self.inner.ensure_indexes(specs).await
    }

    async fn insert_record(&self, record: DeliveryRecord) -> StoreResult<()> {
        self.inner.insert_record(record).await
    }

    async fn update_delivery(
        &self,
        message_id: &str,
        user_id: i64,
        status: DeliveryStatus,
        channel: PushChannel,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner
            .update_delivery(message_id, user_id, status, channel, at)
            .await
    }

    async fn apply_ack(
        &self,
        message_id: &str,
        user_id: i64,
        ack: AckKind,
        at: DateTime<Utc>,
        connection_id: Option<&str>,
    ) -> StoreResult<Option<DeliveryRecord>> {
        self.inner
            .apply_ack(message_id, user_id, ack, at, connection_id)
            .await
    }

    async fn find_record(&self, message_id: &str, user_id: i64) -> StoreResult<Option<DeliveryRecord>> {
        self.inner.find_record(message_id, user_id).await
    }

    async fn query_records(&self, query: &RecordQuery) -> StoreResult<Page<DeliveryRecord>> {
        self.inner.query_records(query).await
    }

    async fn message_counts(&self, message_id: &str) -> StoreResult<MessageCounts> {
        self.inner.message_counts(message_id).await
    }

    async fn insert_push_record(&self, record: PushRecord) -> StoreResult<()> {
        self.slow_write().await;
        self.inner.insert_push_record(record).await
    }

    async fn finish_push_record(
        &self,
        message_id: &str,
        status: PushStatus,
        delivered: u64,
        failed: u64,
        total: u64,
    ) -> StoreResult<()> {
        self.inner
            .finish_push_record(message_id, status, delivered, failed, total)
            .await
    }

    async fn push_record_exists(&self, message_id: &str) -> StoreResult<bool> {
        self.slow_write().await;
        self.inner.push_record_exists(message_id).await
    }

    async fn remove_push_record(&self, message_id: &str) -> StoreResult<()> {
        self.inner.remove_push_record(message_id).await
    }

    async fn list_push_records(&self, page: PageRequest) -> StoreResult<Page<PushRecord>> {
        self.inner.list_push_records(page).await
    }

    async fn append_log(&self, log: NotificationLog) -> StoreResult<()> {
        self.slow_write().await;
        self.inner.append_log(log).await
    }

    async fn logs_for(&self, message_id: &str, limit: usize) -> StoreResult<Vec<NotificationLog>> {
        self.inner.logs_for(message_id, limit).await
    }

    async fn load_status(&self, user_id: i64) -> StoreResult<Option<OnlineStatus>> {
        self.inner.load_status(user_id).await
    }

    async fn upsert_status(&self, status: OnlineStatus) -> StoreResult<()> {
        self.inner.upsert_status(status).await
    }

    async fn online_statuses(&self) -> StoreResult<Vec<OnlineStatus>> {
        let rows = self.inner.online_statuses().await?;
        let gate = self.rows_gate.lock().take();
        if let Some((reached, release)) = gate {
            let _ = reached.send(());
            let _ = release.await;
        }
        Ok(rows)
    }

    async fn touch_status(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.touch_status(user_id, at).await
    }

    async fn force_offline(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.force_offline(user_id, at).await
    }
}

fn test_settings() -> NotifySettings {
    let mut settings = NotifySettings::default();
    settings.hub.welcome_frame = false;
    settings.dispatcher.workers = Some(2);
    settings.server.shutdown_timeout_secs = 2;
    settings
}

async fn fixture_on(settings: NotifySettings, ledger: Arc<MemoryLedgerStore>, store: Arc<dyn LedgerStore>) -> Fixture {
    let offline = Arc::new(MemoryOfflineStore::new());
    let directory = Arc::new(StaticDirectory::new());
    let stores = CoreStores {
        offline: offline.clone(),
        ledger: store,
        directory: directory.clone(),
    };
    let core = NotificationCore::start(settings, stores).await.unwrap();
    Fixture {
        core,
        ledger,
        offline,
        directory,
    }
}

async fn fixture_with(settings: NotifySettings) -> Fixture {
    let ledger = Arc::new(MemoryLedgerStore::new());
    fixture_on(settings, ledger.clone(), ledger).await
}

async fn hooked_fixture(settings: NotifySettings) -> (Fixture, Arc<HookedLedger>) {
    let hooked = Arc::new(HookedLedger::default());
    let f = fixture_on(settings, hooked.inner.clone(), hooked.clone()).await;
    (f, hooked)
}

async fn fixture() -> Fixture {
    fixture_with(test_settings()).await
}

async fn connect(core: &NotificationCore, user_id: i64) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
    let (conn, rx) = core.open_connection(user_id, "10.0.0.1", AGENT);
    core.attach(&conn).await.unwrap();
    (conn, rx)
}

async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> serde_json::Value {
    let frame = timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("frame within 3s")
        .expect("queue open");
    serde_json::from_str(&frame).unwrap()
}

fn urgent(n: Notification) -> Notification {
    n.with_priority(Priority::Urgent)
}

#[tokio::test]
async fn test_online_delivery() {
    let f = fixture().await;
    f.directory.insert(42, "buyer", false);
    let (_conn, mut rx) = connect(&f.core, 42).await;

    let outcome = f
        .core
        .submit(urgent(
            Notification::new(NotificationType::OrderPaid, "paid")
                .to_users([42])
                .with_id("m1"),
        ))
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.report.unwrap().delivered, 1);

    let frame = next_frame(&mut rx).await;
    assert_eq!(frame["type"], "order_paid");
    assert_eq!(frame["message_id"], "m1");
    assert!(rx.try_recv().is_err());

    let page = f.core.query_records(&RecordQuery::for_message("m1")).await.unwrap();
    assert_eq!(page.total, 1);
    let record = &page.items[0];
    assert_eq!(record.user_id, 42);
    assert_eq!(record.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(record.push_channel, PushChannel::Websocket);
    assert!(!record.is_received);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_offline_buffer_replayed_on_connect() {
    let f = fixture().await;
    f.directory.insert(7, "seller", false);

    f.core
        .submit(urgent(
            Notification::new(NotificationType::OrderCreated, "new order")
                .to_users([7])
                .with_id("m2"),
        ))
        .await
        .unwrap();
    assert_eq!(f.core.offline_count(7).await.unwrap(), 1);

    let (_conn, mut rx) = connect(&f.core, 7).await;
    let frame = next_frame(&mut rx).await;
    assert_eq!(frame["type"], "offline_message");
    assert_eq!(frame["message_id"], "m2");
    assert_eq!(f.core.offline_count(7).await.unwrap(), 0);

    let page = f.core.query_records(&RecordQuery::for_message("m2")).await.unwrap();
    assert_eq!(page.items[0].delivery_status, DeliveryStatus::Delivered);
    assert_eq!(page.items[0].push_channel, PushChannel::Offline);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_admin_fan_out() {
    let f = fixture().await;
    f.directory.insert(1, "root", true);
    f.directory.insert(2, "ops", true);
    f.directory.insert(3, "guest", false);
    let (_c1, mut rx1) = connect(&f.core, 1).await;
    let (_c2, mut rx2) = connect(&f.core, 2).await;
    let (_c3, mut rx3) = connect(&f.core, 3).await;

    f.core
        .submit(urgent(
            Notification::new(NotificationType::SystemNotice, "alert")
                .to_admins()
                .with_id("m3"),
        ))
        .await
        .unwrap();

    assert_eq!(next_frame(&mut rx1).await["message_id"], "m3");
    assert_eq!(next_frame(&mut rx2).await["message_id"], "m3");
    assert!(rx3.try_recv().is_err());

    let page = f.core.query_records(&RecordQuery::for_message("m3")).await.unwrap();
    assert_eq!(page.total, 2);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_slow_consumer_dropped() {
    let f = fixture().await;
    let (keep, mut keep_rx) = connect(&f.core, 9).await;
    let (slow, _slow_rx) = connect(&f.core, 9).await;
    let before = f.core.hub().active_connections();
    assert_eq!(f.core.hub().user_connection_count(9), 2);

    // 一个连接读取，另一个从不读取
    let frame: Frame = Arc::from("{\"type\":\"system_notice\"}");
    for _ in 0..257 {
        f.core.hub().send_to_user(9, &frame).await;
        while keep_rx.try_recv().is_ok() {}
    }

    assert_eq!(f.core.hub().active_connections(), before - 1);
    assert_eq!(f.core.hub().user_connection_count(9), 1);
    assert!(f.core.hub().is_online(9));
    assert!(keep.enqueue(frame.clone()).is_ok());
    assert!(slow.enqueue(frame).is_err());

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_ack_idempotent() {
    let f = fixture().await;
    f.directory.insert(42, "buyer", false);
    let (_conn, _rx) = connect(&f.core, 42).await;
    f.core
        .submit(urgent(
            Notification::new(NotificationType::OrderPaid, "paid")
                .to_users([42])
                .with_id("m1"),
        ))
        .await
        .unwrap();

    let first = f.core.mark_received("m1", 42, Some("conn-a")).await.unwrap();
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.core.mark_received("m1", 42, Some("conn-a")).await.unwrap();
    }

    let page = f.core.query_records(&RecordQuery::for_message("m1")).await.unwrap();
    let record = &page.items[0];
    assert!(record.is_received);
    assert_eq!(record.received_at, first.received_at);
    assert_eq!(record.connection_id.as_deref(), Some("conn-a"));

    assert!(matches!(
        f.core.mark_read("unknown", 42).await,
        Err(NotifyError::NotFound(_))
    ));

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_stale_presence_repaired() {
    let f = fixture().await;
    let stale_at = Utc::now() - ChronoDuration::minutes(10);
    f.ledger
        .upsert_status(OnlineStatus {
            user_id: 13,
            username: "ghost".to_string(),
            is_online: true,
            last_seen: stale_at,
            online_time: Some(stale_at),
            offline_time: None,
            total_online_count: 1,
            total_online_seconds: 0,
            connection_id: Some("gone".to_string()),
            client_ip: None,
            user_agent: None,
            updated_at: stale_at,
        })
        .await
        .unwrap();

    let online = f.core.list_online().await.unwrap();
    assert!(online.iter().all(|s| s.user_id != 13));
    let row = f.ledger.load_status(13).await.unwrap().unwrap();
    assert!(!row.is_online);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_presence_follows_last_socket() {
    let f = fixture().await;
    let (a, _rx_a) = connect(&f.core, 5).await;
    let (b, _rx_b) = connect(&f.core, 5).await;
    assert!(f.core.is_online(5).await);

    f.core.hub().unregister(&a).await;
    assert!(f.core.is_online(5).await);
    f.core.hub().unregister(&b).await;
    assert!(!f.core.hub().is_online(5));
    assert!(!f.core.is_online(5).await);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_queue_full_rejects_normal_but_accepts_urgent() {
    let mut settings = test_settings();
    settings.dispatcher.workers = Some(0);
    settings.dispatcher.queue_capacity = 1;
    let f = fixture_with(settings).await;
    f.directory.insert(8, "courier", false);
    let (_conn, mut rx) = connect(&f.core, 8).await;

    let queued = f
        .core
        .submit(Notification::new(NotificationType::OrderPaid, "a").to_users([8]))
        .await
        .unwrap();
    assert!(queued.accepted);
    assert!(!queued.completed);

    let rejected = f
        .core
        .submit(Notification::new(NotificationType::OrderPaid, "b").to_users([8]))
        .await;
    assert_eq!(rejected.unwrap_err(), NotifyError::QueueFull);

    let outcome = f
        .core
        .submit(urgent(
            Notification::new(NotificationType::OrderRefunded, "c")
                .to_users([8])
                .with_id("urgent-1"),
        ))
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(next_frame(&mut rx).await["message_id"], "urgent-1");
    assert_eq!(f.core.dispatcher_stats().ephemeral, 1);
    assert_eq!(f.core.dispatcher_stats().queue_depth, 1);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_submit_boundaries() {
    let f = fixture().await;

    let too_long = Notification::new(NotificationType::SystemNotice, "x".repeat(4097)).to_all();
    assert!(matches!(
        f.core.submit(too_long).await,
        Err(NotifyError::Validation { .. })
    ));

    let empty = Notification::new(NotificationType::OrderPaid, "paid").to_users(Vec::<i64>::new());
    assert!(f.core.submit(empty).await.is_err());

    f.core
        .submit(urgent(
            Notification::new(NotificationType::SystemNotice, "hello").to_all().with_id("dup"),
        ))
        .await
        .unwrap();
    let duplicate = Notification::new(NotificationType::SystemNotice, "again").to_all().with_id("dup");
    assert!(matches!(
        f.core.submit(duplicate).await,
        Err(NotifyError::Validation { ref field, .. }) if field == "message_id"
    ));

    let generated = f
        .core
        .submit(Notification::new(NotificationType::SystemNotice, "hi").to_all())
        .await
        .unwrap();
    assert!(generated.message_id.starts_with("msg_"));

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_socket_without_records() {
    let f = fixture().await;
    let (_a, mut rx_a) = connect(&f.core, 21).await;
    let (_b, mut rx_b) = connect(&f.core, 22).await;

    f.core
        .submit(urgent(
            Notification::new(NotificationType::SystemNotice, "maintenance")
                .to_all()
                .with_id("all-1"),
        ))
        .await
        .unwrap();

    assert_eq!(next_frame(&mut rx_a).await["message_id"], "all-1");
    assert_eq!(next_frame(&mut rx_b).await["message_id"], "all-1");
    let page = f.core.query_records(&RecordQuery::for_message("all-1")).await.unwrap();
    assert_eq!(page.total, 0);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let f = fixture().await;
    let (conn, mut rx) = connect(&f.core, 30).await;
    f.core.shutdown().await;

    assert!(!f.core.hub().is_online(30));
    assert!(conn.enqueue(Arc::from("late")).is_err());
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_queue_full_submission_can_be_retried_with_same_id() {
    let mut settings = test_settings();
    settings.dispatcher.workers = Some(0);
    settings.dispatcher.queue_capacity = 1;
    let f = fixture_with(settings).await;
    f.directory.insert(8, "courier", false);
    let (_conn, mut rx) = connect(&f.core, 8).await;

    f.core
        .submit(Notification::new(NotificationType::OrderPaid, "fills the queue").to_users([8]))
        .await
        .unwrap();

    let first = f
        .core
        .submit(
            Notification::new(NotificationType::OrderCreated, "shipped")
                .to_users([8])
                .with_id("retry-me"),
        )
        .await;
    assert_eq!(first.unwrap_err(), NotifyError::QueueFull);
    assert!(!f.ledger.push_record_exists("retry-me").await.unwrap());

    let retried = f
        .core
        .submit(urgent(
            Notification::new(NotificationType::OrderCreated, "shipped")
                .to_users([8])
                .with_id("retry-me"),
        ))
        .await
        .unwrap();
    assert!(retried.accepted);
    assert_eq!(next_frame(&mut rx).await["message_id"], "retry-me");
    assert!(f.ledger.push_record_exists("retry-me").await.unwrap());

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_slow_ledger_bounded_by_submit_wait() {
    let mut settings = test_settings();
    settings.dispatcher.submit_wait_secs = 1;
    settings.ledger.deadline_secs = 5;
    let (f, hooked) = hooked_fixture(settings).await;
    *hooked.write_delay.lock() = Duration::from_secs(3);

    let started = std::time::Instant::now();
    let outcome = f
        .core
        .submit(
            Notification::new(NotificationType::OrderPaid, "paid")
                .to_users([9])
                .with_id("slow-1"),
        )
        .await
        .unwrap();
    assert!(outcome.accepted);
    assert!(started.elapsed() < Duration::from_millis(1900), "took {:?}", started.elapsed());

    let started = std::time::Instant::now();
    let outcome = f
        .core
        .submit(urgent(
            Notification::new(NotificationType::OrderPaid, "paid").to_users([9]).with_id("slow-2"),
        ))
        .await
        .unwrap();
    assert!(outcome.accepted);
    assert!(started.elapsed() < Duration::from_millis(1900), "took {:?}", started.elapsed());

    *hooked.write_delay.lock() = Duration::ZERO;
    f.core.shutdown().await;
}

#[tokio::test]
async fn test_sweep_keeps_user_registered_after_rows_were_read() {
    let (f, hooked) = hooked_fixture(test_settings()).await;
    let now = Utc::now();
    f.ledger
        .upsert_status(OnlineStatus {
            user_id: 60,
            username: "late".to_string(),
            is_online: true,
            last_seen: now,
            online_time: Some(now),
            offline_time: None,
            total_online_count: 1,
            total_online_seconds: 0,
            connection_id: Some("earlier".to_string()),
            client_ip: None,
            user_agent: None,
            updated_at: now,
        })
        .await
        .unwrap();

    let (reached_tx, reached_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    *hooked.rows_gate.lock() = Some((reached_tx, release_rx));

    let core = f.core.clone();
    let sweep = tokio::spawn(async move { core.sweep_presence().await });
    reached_rx.await.unwrap();

    // 在线行已读取，此时连接才注册
    let (_conn, _rx) = connect(&f.core, 60).await;
    release_tx.send(()).unwrap();

    let report = sweep.await.unwrap().unwrap();
    assert_eq!(report.downgraded, 0);
    assert_eq!(report.touched, 1);
    assert!(f.core.is_online(60).await);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_custom_target_skips_excluded_users() {
    let f = fixture().await;
    let (_a, mut rx_a) = connect(&f.core, 31).await;
    let (_b, mut rx_b) = connect(&f.core, 32).await;
    let (_c, mut rx_c) = connect(&f.core, 33).await;

    let outcome = f
        .core
        .submit(urgent(
            Notification::new(NotificationType::SystemNotice, "promo")
                .to_custom([31, 32, 33, 31], [32])
                .with_id("custom-1"),
        ))
        .await
        .unwrap();
    let report = outcome.report.unwrap();
    assert_eq!(report.recipients, 2);
    assert_eq!(report.delivered, 2);

    assert_eq!(next_frame(&mut rx_a).await["message_id"], "custom-1");
    assert_eq!(next_frame(&mut rx_c).await["message_id"], "custom-1");
    assert!(timeout(Duration::from_millis(200), rx_b.recv()).await.is_err());
    assert!(rx_a.try_recv().is_err());

    let page = f.core.query_records(&RecordQuery::for_message("custom-1")).await.unwrap();
    let mut users: Vec<i64> = page.items.iter().map(|r| r.user_id).collect();
    users.sort_unstable();
    assert_eq!(users, vec![31, 33]);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_ledger_outage_does_not_block_delivery() {
    let f = fixture().await;
    let (_conn, mut rx) = connect(&f.core, 40).await;
    f.ledger.set_available(false);

    let outcome = f
        .core
        .submit(urgent(
            Notification::new(NotificationType::OrderPaid, "paid")
                .to_users([40])
                .with_id("ledger-down"),
        ))
        .await
        .unwrap();
    assert_eq!(outcome.report.unwrap().delivered, 1);
    assert_eq!(next_frame(&mut rx).await["message_id"], "ledger-down");
    assert!(f.core.stats().await.failed_ledger_writes >= 1);

    assert!(matches!(
        f.core.mark_received("ledger-down", 40, None).await,
        Err(NotifyError::LedgerUnavailable(_))
    ));

    f.ledger.set_available(true);
    f.core.shutdown().await;
}

#[tokio::test]
async fn test_offline_store_outage_keeps_online_delivery() {
    let f = fixture().await;
    f.directory.insert(50, "online", false);
    f.directory.insert(51, "away", false);
    let (_conn, mut rx) = connect(&f.core, 50).await;
    f.offline.set_available(false);

    let outcome = f
        .core
        .submit(urgent(
            Notification::new(NotificationType::OrderPaid, "paid")
                .to_users([50, 51])
                .with_id("offline-down"),
        ))
        .await
        .unwrap();
    let report = outcome.report.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.buffered, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(next_frame(&mut rx).await["message_id"], "offline-down");

    let away = f
        .core
        .query_records(&RecordQuery::for_message("offline-down"))
        .await
        .unwrap()
        .items
        .into_iter()
        .find(|r| r.user_id == 51)
        .unwrap();
    assert_eq!(away.delivery_status, DeliveryStatus::Failed);

    f.offline.set_available(true);
    assert_eq!(f.core.offline_count(51).await.unwrap(), 0);
    f.core.shutdown().await;
}

#[tokio::test]
async fn test_required_indexes_created_at_startup() {
    let f = fixture().await;
    let names = f.ledger.index_names();
    for spec in REQUIRED_INDEXES {
        assert!(names.contains(&spec.name), "missing index {}", spec.name);
    }
    f.core.shutdown().await;
}
