//! Transport implementations, one per family of native stack.

pub mod bus;
#[cfg(feature = "bluest")]
pub mod delegate;
pub mod fake;
pub mod native;
