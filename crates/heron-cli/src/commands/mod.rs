//! CLI command implementations.

pub mod bgerror;
pub mod info;
pub mod threads;
pub mod wait;
