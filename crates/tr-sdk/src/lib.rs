// tr-sdk: foundation layer for the task-run dispatcher.
// This crate has ZERO dependencies on the other workspace crates and provides
// the small leaf utilities and traits shared across them.

pub mod build_constants;
pub mod string_util;
pub mod trace;

// Re-export commonly used items at crate root
pub use build_constants::{DispatcherPackage, Source};
pub use string_util::StringUtil;
pub use trace::TraceWriter;
