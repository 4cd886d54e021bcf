//! The `utils` module provides definitions shared across the `msgrelay`
//! application: the tagged error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{ErrorKind, RelayError, RelayResult};

#[cfg(test)]
mod tests;
