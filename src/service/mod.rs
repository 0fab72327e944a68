//! 通知核心服务 / Notification core services

pub mod dispatcher;
pub mod fanout;
pub mod ledger;
pub mod notification_core;
pub mod offline;
pub mod presence;
pub mod roster;

pub use notification_core::{CoreStats, CoreStores, NotificationCore, MAX_CONTENT_BYTES};
pub use dispatcher::{Dispatcher, DispatcherStats, SubmitOutcome};
pub use fanout::{FanOut, FanOutReport, RetryPolicy};
pub use ledger::DeliveryLedger;
pub use offline::OfflineBuffer;
pub use presence::{PresenceTracker, SweepReport};
pub use roster::{AdminRoster, RosterSnapshot};
