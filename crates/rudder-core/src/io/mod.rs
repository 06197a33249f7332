//! Connection I/O helpers.

mod splice;

pub use splice::{splice, SpliceStats};
