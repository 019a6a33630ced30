//! Page side of the Casa offline shell: registers the worker, watches for a
//! waiting update and drives the update prompt.

pub mod monitor;
pub mod notification;
pub mod platform;

pub use monitor::{MonitorConfig, PageHost, PendingUpdate, UpdateMonitor, UpdateTrigger};
pub use notification::{NotificationAction, NotificationView, UpdateNotification};
pub use platform::{NoServiceWorker, WorkerPlatform};
