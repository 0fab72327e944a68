pub mod frame;
pub mod notification;
pub mod query;
pub mod record;

pub use frame::{Frame, InboundFrame, WireFrame};
pub use notification::{generate_message_id, Notification, NotificationType, Priority, SendNotificationRequest, Target};
pub use query::{MessageCounts, MessageStats, Page, PageParams, PageRequest, RecordQuery};
pub use record::{
    AckKind, ConnectionMeta, DeliveryRecord, DeliveryStatus, LogEvent, NotificationLog, OfflineEntry, OnlineStatus,
    PushChannel, PushRecord, PushStatus,
};
