//! Crowd navigation core: zone lookup, crowd-density classification and
//! congestion-aware routing, plus the sync loop and HTTP surface around them.

pub mod advisory;
pub mod config;
pub mod density;
pub mod error;
pub mod geometry;
pub mod locator;
pub mod routing;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;

pub use error::{CoreError, Result};
