mod base;
pub mod reddit;

pub use base::{PostSource, SourceError};
