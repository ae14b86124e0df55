//! Gateway engine: frontends, system proxy integration and supervision.
//!
//! The engine owns the lifecycle of the whole gateway. It establishes
//! the SSH tunnel, loads routing rules, serves the HTTP and SOCKS5
//! frontends, optionally brings up the TUN data plane, and points the OS
//! proxy settings at itself. Shutdown runs in reverse with bounded
//! drains, triggered by an external signal or the first component
//! failure.

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod profiles;
mod relay;
pub mod socks5;
pub mod sysproxy;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use http::HttpProxy;
pub use profiles::{AppSettings, ConfigData, Profile, ProfileStore};
pub use socks5::Socks5Proxy;
pub use sysproxy::{NoopSystemProxy, OsSystemProxy, SystemProxy};
