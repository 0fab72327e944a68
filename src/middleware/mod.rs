pub mod connection_guard;

pub use connection_guard::{
    client_ip, user_agent, ConnectionGuard, ConnectionGuardMiddleware, ConnectionPermit, GuardRejection,
};
