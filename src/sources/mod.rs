//! Sources and coordinate systems
//!
//! Three coordinate systems meet here: runtime scripts (by script id),
//! authored documents (by path or URL) and DAP source references. The
//! container correlates them through source maps.

pub mod container;
pub mod path_resolver;
pub mod skipper;
pub mod source;

use std::sync::Arc;

pub use container::{CompiledSibling, SourceContainer};
pub use path_resolver::{PathResolverConfig, SourcePathResolver};
pub use skipper::ScriptSkipper;
pub use source::{ContentProvider, Source, SourceKind};

/// 1-based position in a source document, the coordinate used on the DAP
/// boundary
#[derive(Clone, Debug)]
pub struct UiLocation {
    pub source: Arc<Source>,
    pub line: u32,
    pub column: u32,
}

impl UiLocation {
    pub fn new(source: Arc<Source>, line: u32, column: u32) -> Self {
        Self {
            source,
            line,
            column,
        }
    }
}

/// 0-based position inside a runtime script, the coordinate used on the
/// CDP boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLocation {
    pub script_id: String,
    pub line: u32,
    pub column: u32,
}
