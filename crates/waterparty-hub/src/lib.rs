//! Connection hub: client registry, rooms, fan-out, and per-client pumps.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod pump;
pub mod service;

pub use client::{ClientHandle, EnqueueError, Mailbox};
pub use config::HubConfig;
pub use dispatch::{Delivery, Dispatcher, EventBackend};
pub use error::HubError;
pub use hub::{BroadcastReport, Hub};
pub use pump::{serve_client, PumpExit, WireFrame};
pub use service::{HubCommand, HubHandle, HubService};
