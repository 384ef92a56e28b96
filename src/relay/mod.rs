pub mod auth;
pub mod broker;
pub mod collab;
pub mod delivery;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;
pub mod payload;
pub mod reliability;
pub mod router;
pub mod server;
pub mod session;
pub mod stomp;
pub mod store;
