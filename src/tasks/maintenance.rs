use crate::middleware::ConnectionGuard;
use crate::service::NotificationCore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant};

/// 启动核心自带的维护任务（在线状态清扫、统计日志），由核心在关闭时等待
/// Spawn the core's own maintenance loops (presence sweep and stats log); the core
/// waits for them on shutdown.
pub fn spawn_core_tasks(core: &Arc<NotificationCore>) {
    let presence = &core.settings().presence;
    let sweep_every = Duration::from_secs(presence.sweep_interval_secs.max(1));
    let stats_every = Duration::from_secs(presence.stats_interval_secs.max(1));

    let sweep = spawn_presence_sweep(core.clone(), sweep_every, core.shutdown_signal());
    core.track_task(sweep);
    let stats = spawn_stats_reporter(core.clone(), stats_every, core.shutdown_signal());
    core.track_task(stats);
}

fn spawn_presence_sweep(
    core: Arc<NotificationCore>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Presence sweep every {:?}", every);
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match core.sweep_presence().await {
                        Ok(report) if report.downgraded > 0 => {
                            tracing::info!(touched = report.touched, downgraded = report.downgraded, "presence sweep repaired rows");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("presence sweep failed: {}", e),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
    })
}

fn spawn_stats_reporter(
    core: Arc<NotificationCore>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = core.stats().await;
                    tracing::info!(
                        active_connections = stats.hub.active_connections,
                        online_users = stats.hub.unique_users,
                        inbound = stats.hub.inbound_messages,
                        outbound = stats.hub.total_messages,
                        failed_deliveries = stats.hub.failed_deliveries,
                        failed_ledger_writes = stats.failed_ledger_writes,
                        queue_depth = stats.dispatcher.queue_depth,
                        "📊 Notification stats"
                    );
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
    })
}

/// 定期清理连接守卫的过期记录 / Periodically prune the connection guard's history
pub fn spawn_guard_cleanup(guard: ConnectionGuard, core: &Arc<NotificationCore>) {
    let every = Duration::from_secs(core.settings().limits.window_secs.max(1));
    let mut shutdown_rx = core.shutdown_signal();
    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = guard.cleanup_expired();
                    if removed > 0 {
                        tracing::debug!(removed, "connection guard history pruned");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
    });
    core.track_task(handle);
}
