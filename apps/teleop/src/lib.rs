pub mod auth;
pub mod clock;
pub mod command;
pub mod config;
pub mod events;
pub mod input;
pub mod metrics;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod terminal;
pub mod video;
