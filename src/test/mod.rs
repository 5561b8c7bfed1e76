//! Shared helpers for the unit tests.


pub use builder::*;
