//! Breakpoint prediction from workspace source maps
//!
//! Before the runtime has loaded anything, local `.js.map` files already
//! say where authored lines land in compiled output. One scan per session
//! indexes every authored path; breakpoints then install at the predicted
//! compiled locations so they bind before the first statement runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;
use walkdir::WalkDir;

use crate::sourcemap::SourceMap;
use crate::sources::SourcePathResolver;

/// A compiled position an authored position is predicted to land at
#[derive(Debug, Clone)]
pub struct PredictedLocation {
    pub compiled_url: String,
    /// 0-based
    pub line: u32,
    /// 0-based
    pub column: u32,
}

struct MapRef {
    map: Arc<SourceMap>,
    compiled_url: String,
    source_url: String,
}

pub struct BreakpointPredictor {
    root_path: PathBuf,
    resolver: Arc<SourcePathResolver>,
    index: OnceCell<HashMap<PathBuf, Vec<MapRef>>>,
}

impl BreakpointPredictor {
    pub fn new(root_path: PathBuf, resolver: Arc<SourcePathResolver>) -> Arc<Self> {
        Arc::new(Self {
            root_path,
            resolver,
            index: OnceCell::new(),
        })
    }

    /// Run the workspace scan if it has not run yet
    ///
    /// The launcher awaits this before starting the program.
    pub async fn prepare(&self) {
        self.index().await;
    }

    async fn index(&self) -> &HashMap<PathBuf, Vec<MapRef>> {
        self.index
            .get_or_init(|| {
                let root = self.root_path.clone();
                let resolver = self.resolver.clone();
                async move {
                    tokio::task::spawn_blocking(move || scan(&root, &resolver))
                        .await
                        .unwrap_or_default()
                }
            })
            .await
    }

    /// Compiled locations predicted for an authored position, 0-based
    pub async fn predicted_resolved_locations(
        &self,
        absolute_path: &Path,
        line: u32,
        column: u32,
    ) -> Vec<PredictedLocation> {
        let index = self.index().await;
        let Some(refs) = index.get(absolute_path) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for map_ref in refs {
            if let Some(entry) = map_ref.map.find_reverse_entry(&map_ref.source_url, line, column)
            {
                out.push(PredictedLocation {
                    compiled_url: map_ref.compiled_url.clone(),
                    line: entry.generated_line,
                    column: entry.generated_column,
                });
            }
        }
        out
    }
}

/// Walk the workspace for `.js.map` files and index authored paths
///
/// Unreadable or malformed maps are skipped; prediction is best-effort.
fn scan(root: &Path, resolver: &SourcePathResolver) -> HashMap<PathBuf, Vec<MapRef>> {
    let mut index: HashMap<PathBuf, Vec<MapRef>> = HashMap::new();
    let mut maps_seen = 0usize;

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !path.to_string_lossy().ends_with(".js.map") {
            continue;
        }

        let Ok(body) = std::fs::read_to_string(path) else {
            continue;
        };
        let Ok(map_url) = url::Url::from_file_path(path) else {
            continue;
        };
        let map = match SourceMap::parse(&body, map_url.as_str()) {
            Ok(map) => map,
            Err(e) => {
                tracing::debug!(path = %path.display(), "skipping unparsable map: {e}");
                continue;
            }
        };
        maps_seen += 1;

        // The compiled file sits next to its map, minus the ".map" suffix
        let compiled_path = path.with_extension("");
        let Some(compiled_url) = resolver.absolute_path_to_url(&compiled_path) else {
            continue;
        };

        for source_url in map.sources() {
            let Some(source_path) = resolver.url_to_absolute_path(source_url) else {
                continue;
            };
            index.entry(source_path).or_default().push(MapRef {
                map: map.clone(),
                compiled_url: compiled_url.clone(),
                source_url: source_url.clone(),
            });
        }
    }

    tracing::debug!(
        maps = maps_seen,
        sources = index.len(),
        "breakpoint prediction index built"
    );
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::PathResolverConfig;
    use crate::sourcemap::vlq;

    fn write_fixture(dir: &Path) {
        // bundle.js line 3 col 0 <- app.ts line 7 col 2
        let mut mappings = String::from(";;;");
        for field in [0i64, 0, 7, 2] {
            vlq::encode(field, &mut mappings);
        }
        let map = serde_json::json!({
            "version": 3,
            "sources": ["../src/app.ts"],
            "names": [],
            "mappings": mappings,
        });
        std::fs::create_dir_all(dir.join("dist")).unwrap();
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("dist/bundle.js"), "// compiled").unwrap();
        std::fs::write(dir.join("dist/bundle.js.map"), map.to_string()).unwrap();
        std::fs::write(dir.join("src/app.ts"), "// authored").unwrap();
        // A malformed map must not break the scan
        std::fs::write(dir.join("dist/broken.js.map"), "not json").unwrap();
    }

    #[tokio::test]
    async fn predicts_compiled_locations_from_local_maps() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());

        let resolver = Arc::new(SourcePathResolver::new(PathResolverConfig::default()));
        let predictor = BreakpointPredictor::new(dir.path().to_path_buf(), resolver);
        predictor.prepare().await;

        let canonical = dir.path().canonicalize().unwrap_or_else(|_| dir.path().to_path_buf());
        let authored = canonical.join("src/app.ts");
        // The index is keyed by the paths the maps resolve to; try both
        // spellings since temp dirs may involve symlinks.
        let mut predicted = predictor
            .predicted_resolved_locations(&authored, 7, 0)
            .await;
        if predicted.is_empty() {
            predicted = predictor
                .predicted_resolved_locations(&dir.path().join("src/app.ts"), 7, 0)
                .await;
        }

        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted[0].line, 3);
        assert_eq!(predicted[0].column, 0);
        assert!(predicted[0].compiled_url.ends_with("dist/bundle.js"));
    }

    #[tokio::test]
    async fn unknown_paths_predict_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(SourcePathResolver::new(PathResolverConfig::default()));
        let predictor = BreakpointPredictor::new(dir.path().to_path_buf(), resolver);

        let predicted = predictor
            .predicted_resolved_locations(Path::new("/nowhere/x.ts"), 1, 0)
            .await;
        assert!(predicted.is_empty());
    }
}
