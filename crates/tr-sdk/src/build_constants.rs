//! Build constants for the dispatcher package, resolved at compile time
//! from environment variables with sensible defaults.

/// Source control information.
pub struct Source;

impl Source {
    /// The commit hash from which this binary was built.
    /// Set via the `DISPATCHER_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("DISPATCHER_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Dispatcher package metadata.
#[derive(Debug, Clone)]
pub struct DispatcherPackage;

impl DispatcherPackage {
    /// The semantic version of the dispatcher.
    /// Pulled from `CARGO_PKG_VERSION` which is set by Cargo from `Cargo.toml`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// The package / distribution name.
    /// Set via the `DISPATCHER_PACKAGE_NAME` env var at compile time, or "N/A".
    pub const PACKAGE_NAME: &'static str = match option_env!("DISPATCHER_PACKAGE_NAME") {
        Some(n) => n,
        None => "N/A",
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!DispatcherPackage::VERSION.is_empty());
    }

    #[test]
    fn commit_hash_has_default() {
        // Will be "N/A" unless overridden at compile time
        assert!(!Source::COMMIT_HASH.is_empty());
    }

    #[test]
    fn package_name_has_default() {
        assert!(!DispatcherPackage::PACKAGE_NAME.is_empty());
    }
}
