pub mod app_bootstrap;
pub mod command_registry;

pub use app_bootstrap::{build_stores, AppBootstrap, ServerOverrides};
pub use command_registry::{build_app, print_version, server_overrides};
