//! pyship library exports.
//!
//! The binary is a thin CLI over these modules; integration tests drive them
//! directly.

pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod image;
pub mod launch;
pub mod preflight;
pub mod process;
pub mod requirements;
pub mod stage;
pub mod timing;

pub use error::BuildError;
