//! # pdubridge
//!
//! Communication and state-sync engine for network power distribution units.
//! GWGJ units dial in over TCP and push framed telemetry; Changsui units are
//! polled over HTTP. Both end up in one device registry whose changes are
//! republished as entity-level events, and outlet commands are routed back to
//! whichever transport owns the device.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use pdubridge::{Config, Manager};
//!
//! # async fn run() -> pdubridge::Result<()> {
//! let manager = Manager::start(Config::load()?).await?;
//! let events = manager.events();
//! futures_util::pin_mut!(events);
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod changsui;
pub mod config;
pub mod device;
pub mod energy;
pub mod error;
pub mod logging;
pub mod manager;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod scraper;
pub mod server;
pub mod session;
pub mod store;
pub mod sync;

pub use config::{ChangsuiConfig, Config, ServerConfig};
pub use device::{ConnectionState, Device, DeviceKind, Outlet, Telemetry};
pub use error::{PduError, Result};
pub use manager::{Diagnostics, Manager};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use sync::{EntityKey, EntityValue, PlatformEvent};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
