//! CLI command implementations

mod config;
mod info;
mod record;
mod save;
mod service;

pub use config::{config, ConfigArgs};
pub use info::info;
pub use record::{record, RecordArgs};
pub use save::{save, SaveArgs};
pub use service::{capture_service, ServiceArgs};
