pub mod config;
pub mod controller;
pub mod error;
pub mod event_bus;
pub mod naming;
mod provisioning;
pub mod query;
mod relay;

pub use config::*;
pub use controller::*;
pub use error::*;
pub use event_bus::*;
pub use naming::*;
pub use query::*;
