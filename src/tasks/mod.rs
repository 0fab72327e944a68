//! 后台维护任务 / Background maintenance tasks

pub mod maintenance;

pub use maintenance::{spawn_core_tasks, spawn_guard_cleanup};
