// tr-common: cross-cutting infrastructure shared by the dispatcher core -
// structured logging setup, environment-driven configuration, and the
// error taxonomy used at contract boundaries.

pub mod config;
pub mod error;
pub mod logging;

pub use config::DispatcherConfig;
pub use error::{DispatchError, Result};
