pub mod banner;
pub mod commands;
pub mod console;
pub mod session;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Version of the node software.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
