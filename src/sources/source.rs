//! Addressable code documents

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::json;

use crate::cdp::CdpSession;
use crate::common::{Error, Result};
use crate::dap;

/// What flavor of document this is
#[derive(Debug)]
pub enum SourceKind {
    /// Loaded by the runtime; may accumulate several script incarnations
    /// over reloads
    Runtime { script_ids: Mutex<Vec<String>> },
    /// Derived from a source map
    Authored,
}

/// Where the document's text comes from when the client asks for it
pub enum ContentProvider {
    /// Text known up front (e.g. embedded sourcesContent)
    Fixed(String),
    /// Fetched from the runtime on demand
    Script(CdpSession),
    /// Read from the local filesystem
    File(PathBuf),
    /// Fetched over the network
    Url(String),
}

/// An addressable code document
///
/// Every registered source is reachable from its URL, its absolute path
/// (when it has one) and its source reference.
pub struct Source {
    reference: i64,
    url: String,
    absolute_path: Option<PathBuf>,
    kind: SourceKind,
    content: ContentProvider,
}

impl Source {
    pub fn new(
        reference: i64,
        url: String,
        absolute_path: Option<PathBuf>,
        kind: SourceKind,
        content: ContentProvider,
    ) -> Self {
        Self {
            reference,
            url,
            absolute_path,
            kind,
            content,
        }
    }

    /// Stable reference, unique for the adapter's lifetime
    pub fn reference(&self) -> i64 {
        self.reference
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn absolute_path(&self) -> Option<&Path> {
        self.absolute_path.as_deref()
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Whether this source was derived from a source map
    pub fn is_authored(&self) -> bool {
        matches!(self.kind, SourceKind::Authored)
    }

    /// Record another runtime incarnation of this document
    pub fn add_script_id(&self, script_id: &str) {
        if let SourceKind::Runtime { script_ids } = &self.kind {
            let mut ids = script_ids.lock().unwrap();
            if !ids.iter().any(|id| id == script_id) {
                ids.push(script_id.to_string());
            }
        }
    }

    /// Script ids currently backing this document
    pub fn script_ids(&self) -> Vec<String> {
        match &self.kind {
            SourceKind::Runtime { script_ids } => script_ids.lock().unwrap().clone(),
            SourceKind::Authored => Vec::new(),
        }
    }

    /// Drop a script id on execution context teardown
    pub fn remove_script_id(&self, script_id: &str) {
        if let SourceKind::Runtime { script_ids } = &self.kind {
            script_ids.lock().unwrap().retain(|id| id != script_id);
        }
    }

    /// Fetch the document text
    pub async fn content(&self) -> Result<String> {
        match &self.content {
            ContentProvider::Fixed(text) => Ok(text.clone()),
            ContentProvider::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::SourceNotFound(format!("{}: {e}", path.display()))),
            ContentProvider::Url(url) => crate::sourcemap::fetch::fetch(url)
                .await
                .map_err(|e| Error::SourceNotFound(e.to_string())),
            ContentProvider::Script(session) => {
                let script_id = self
                    .script_ids()
                    .pop()
                    .ok_or_else(|| Error::SourceNotFound(self.url.clone()))?;
                let result: crate::cdp::protocol::GetScriptSourceResult = session
                    .command(
                        "Debugger.getScriptSource",
                        json!({ "scriptId": script_id }),
                    )
                    .await
                    .ok_or_else(|| Error::SourceNotFound(self.url.clone()))?;
                Ok(result.script_source)
            }
        }
    }

    /// Short display name: the last path or URL segment
    pub fn name(&self) -> String {
        if let Some(path) = &self.absolute_path {
            if let Some(name) = path.file_name() {
                return name.to_string_lossy().into_owned();
            }
        }
        self.url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.url)
            .to_string()
    }

    /// DAP representation: a path when the client can open the file
    /// directly, a source reference otherwise
    pub fn to_dap(&self) -> dap::Source {
        match &self.absolute_path {
            Some(path) => dap::Source {
                name: Some(self.name()),
                path: Some(path.to_string_lossy().into_owned()),
                source_reference: None,
                presentation_hint: None,
            },
            None => dap::Source {
                name: Some(self.name()),
                path: None,
                source_reference: Some(self.reference),
                presentation_hint: None,
            },
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("reference", &self.reference)
            .field("url", &self.url)
            .field("absolute_path", &self.absolute_path)
            .field("kind", &self.kind)
            .finish()
    }
}
