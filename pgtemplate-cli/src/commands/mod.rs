//! Command implementations for the pgtemplate CLI

pub mod serve;
pub mod sweep;

pub use serve::run_serve;
pub use sweep::run_sweep;
