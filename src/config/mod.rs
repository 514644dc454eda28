//! Configuration parsing and types.
//!
//! - `types` - Top-level [`MeshConfig`] composed of each component's section
//! - `duration` - Human-readable duration strings and their serde adapter
//! - `parser` - YAML config loading and validation

mod duration;
mod parser;
mod types;

pub use duration::*;
pub use parser::*;
pub use types::*;
