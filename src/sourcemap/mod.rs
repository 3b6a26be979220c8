//! V3 source map support
//!
//! Parsing, forward and reverse position lookup, and retrieval over the
//! schemes runtimes hand out source map URLs in.

pub mod fetch;
pub mod map;
pub mod vlq;

pub use map::{SourceMap, SourceMapEntry};
