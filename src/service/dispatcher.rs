use crate::comm::settings::DispatcherSettings;
use crate::domain::{Notification, Priority};
use crate::error::NotifyError;
use crate::service::fanout::{FanOut, FanOutReport};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use utoipa::ToSchema;

struct Task {
    notification: Arc<Notification>,
    done: Option<oneshot::Sender<FanOutReport>>,
}

/// 提交结果 / Submission outcome
///
/// `completed=false` 只表示调用方不再等待，不代表未投递。
/// `completed=false` only means the caller stopped waiting, not that nothing was delivered.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub completed: bool,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<FanOutReport>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct DispatcherStats {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub workers: usize,
    pub processed: u64,
    pub ephemeral: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    ephemeral: AtomicU64,
}

/// 有界任务队列 + 工作线程池
/// Bounded task queue plus a worker pool.
///
/// 队列满时普通优先级返回 `QueueFull`；`Urgent` 改由临时任务直接扇出。
/// On a full queue normal priorities get `QueueFull`; `Urgent` fans out on an ephemeral task.
pub struct Dispatcher {
    sender: RwLock<Option<flume::Sender<Task>>>,
    // 保留一个接收端：没有工作线程时队列仍可接收任务
    receiver: flume::Receiver<Task>,
    fanout: Arc<FanOut>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    capacity: usize,
    submit_wait: Duration,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn start(fanout: Arc<FanOut>, settings: &DispatcherSettings) -> Self {
        let capacity = settings.queue_capacity.max(1);
        let worker_count = settings.worker_count();
        let (tx, rx) = flume::bounded::<Task>(capacity);
        let counters = Arc::new(Counters::default());

        let workers = (0..worker_count)
            .map(|id| {
                let rx = rx.clone();
                let fanout = fanout.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    while let Ok(task) = rx.recv_async().await {
                        execute(&fanout, task, &counters).await;
                    }
                    tracing::debug!(worker = id, "dispatcher worker stopped");
                })
            })
            .collect();

        tracing::info!(workers = worker_count, capacity, "✅ Dispatcher started");
        Self {
            sender: RwLock::new(Some(tx)),
            receiver: rx,
            fanout,
            workers: Mutex::new(workers),
            worker_count,
            capacity,
            submit_wait: settings.submit_wait(),
            counters,
        }
    }

    /// 提交通知。普通优先级入队即返回；`Urgent` 最多等待 `submit_wait` 直到扇出完成。
    /// Submit a notification. Normal priorities return once queued; `Urgent` waits up to
    /// `submit_wait` for the fan-out to finish.
    pub async fn submit(&self, notification: Notification) -> Result<SubmitOutcome, NotifyError> {
        self.submit_until(notification, Instant::now() + self.submit_wait)
            .await
    }

    /// 同 `submit`，`Urgent` 的等待截止到 `deadline`
    /// Like `submit`, with the urgent wait ending at `deadline`.
    pub async fn submit_until(&self, notification: Notification, deadline: Instant) -> Result<SubmitOutcome, NotifyError> {
        let sender = self.sender.read().clone().ok_or(NotifyError::Closed)?;
        let urgent = notification.priority == Priority::Urgent;
        let message_id = notification.message_id.clone();
        let (done_tx, done_rx) = if urgent {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let task = Task {
            notification: Arc::new(notification),
            done: done_tx,
        };

        match sender.try_send(task) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(task)) if urgent => {
                self.counters.ephemeral.fetch_add(1, Ordering::Relaxed);
                tracing::info!(message_id = %message_id, "queue full, urgent notification bypasses queue");
                let fanout = self.fanout.clone();
                let counters = self.counters.clone();
                tokio::spawn(async move {
                    execute(&fanout, task, &counters).await;
                });
            }
            Err(flume::TrySendError::Full(_)) => {
                tracing::warn!(message_id = %message_id, "dispatcher queue full");
                return Err(NotifyError::QueueFull);
            }
            Err(flume::TrySendError::Disconnected(_)) => return Err(NotifyError::Closed),
        }

        let Some(done_rx) = done_rx else {
            return Ok(SubmitOutcome {
                accepted: true,
                completed: false,
                message_id,
                report: None,
            });
        };

        match tokio::time::timeout_at(deadline, done_rx).await {
            Ok(Ok(report)) => Ok(SubmitOutcome {
                accepted: true,
                completed: true,
                message_id,
                report: Some(report),
            }),
            _ => {
                tracing::debug!(message_id = %message_id, "caller stopped waiting for urgent fan-out");
                Ok(SubmitOutcome {
                    accepted: true,
                    completed: false,
                    message_id,
                    report: None,
                })
            }
        }
    }

    pub fn submit_wait(&self) -> Duration {
        self.submit_wait
    }

    pub fn queue_depth(&self) -> usize {
        self.receiver.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queue_depth: self.queue_depth(),
            queue_capacity: self.capacity,
            workers: self.worker_count,
            processed: self.counters.processed.load(Ordering::Relaxed),
            ephemeral: self.counters.ephemeral.load(Ordering::Relaxed),
        }
    }

    /// 关闭队列并等待工作线程排空剩余任务
    /// Close the queue and wait for workers to drain what is left.
    pub async fn shutdown(&self, timeout: Duration) {
        let Some(sender) = self.sender.write().take() else {
            return;
        };
        let remaining = sender.len();
        drop(sender);
        tracing::info!(remaining, "🛑 Dispatcher draining");

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let drain = futures_util::future::join_all(workers);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!("dispatcher workers did not finish within {:?}", timeout);
        }
    }
}

async fn execute(fanout: &FanOut, task: Task, counters: &Counters) {
    let report = fanout.run(&task.notification).await;
    counters.processed.fetch_add(1, Ordering::Relaxed);
    if let Some(done) = task.done {
        let _ = done.send(report);
    }
}
