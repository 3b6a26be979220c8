//! Registry of sources and cross-source location translation
//!
//! The container is the single writer for source registration; threads and
//! the breakpoint manager only read. Translation through source maps is
//! idempotent and side-effect free.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::adapter::AdapterContext;
use crate::cdp::CdpSession;
use crate::dap;
use crate::sourcemap::SourceMap;

use super::path_resolver::SourcePathResolver;
use super::source::{ContentProvider, Source, SourceKind};
use super::{RawLocation, UiLocation};

/// A compiled script reachable from an authored source
#[derive(Clone)]
pub struct CompiledSibling {
    pub compiled: Arc<Source>,
    pub map: Arc<SourceMap>,
}

#[derive(Default)]
struct Inner {
    by_reference: HashMap<i64, Arc<Source>>,
    by_url: HashMap<String, Arc<Source>>,
    by_path: HashMap<PathBuf, Arc<Source>>,
    /// compiled reference -> authored sources its map produced
    authored_of: HashMap<i64, Vec<Arc<Source>>>,
    /// authored reference -> compiled scripts that can reach it
    compiled_of: HashMap<i64, Vec<CompiledSibling>>,
    /// compiled reference -> its parsed map
    maps: HashMap<i64, Arc<SourceMap>>,
}

pub struct SourceContainer {
    context: Arc<AdapterContext>,
    resolver: Arc<SourcePathResolver>,
    inner: Mutex<Inner>,
}

impl SourceContainer {
    pub fn new(context: Arc<AdapterContext>, resolver: Arc<SourcePathResolver>) -> Arc<Self> {
        Arc::new(Self {
            context,
            resolver,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn resolver(&self) -> &SourcePathResolver {
        &self.resolver
    }

    /// Register the source behind a parsed script
    ///
    /// A URL seen before gains another script incarnation instead of a new
    /// source. Returns the source and whether it is newly registered.
    pub fn add_runtime_source(
        &self,
        url: &str,
        script_id: &str,
        session: &CdpSession,
    ) -> (Arc<Source>, bool) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.by_url.get(url) {
            existing.add_script_id(script_id);
            return (existing.clone(), false);
        }

        let absolute_path = self.resolver.url_to_absolute_path(url);
        let source = Arc::new(Source::new(
            self.context.next_source_reference(),
            url.to_string(),
            absolute_path,
            SourceKind::Runtime {
                script_ids: Mutex::new(vec![script_id.to_string()]),
            },
            ContentProvider::Script(session.clone()),
        ));
        register(&mut inner, &source);
        (source, true)
    }

    /// Register the authored sources a compiled script's map produces and
    /// record the sibling relation both ways
    ///
    /// Returns the authored sources that are new to the container.
    pub fn attach_source_map(
        &self,
        compiled: &Arc<Source>,
        map: Arc<SourceMap>,
    ) -> Vec<Arc<Source>> {
        let mut inner = self.inner.lock().unwrap();
        inner.maps.insert(compiled.reference(), map.clone());

        let mut fresh = Vec::new();
        let mut authored_sources = Vec::new();

        for source_url in map.sources() {
            let authored = match inner.by_url.get(source_url) {
                Some(existing) => existing.clone(),
                None => {
                    let absolute_path = self.resolver.url_to_absolute_path(source_url);
                    let content = authored_content(
                        &self.resolver,
                        &map,
                        source_url,
                        absolute_path.as_deref(),
                    );
                    let source = Arc::new(Source::new(
                        self.context.next_source_reference(),
                        source_url.clone(),
                        absolute_path,
                        SourceKind::Authored,
                        content,
                    ));
                    register(&mut inner, &source);
                    fresh.push(source.clone());
                    source
                }
            };

            let siblings = inner.compiled_of.entry(authored.reference()).or_default();
            if !siblings
                .iter()
                .any(|s| s.compiled.reference() == compiled.reference())
            {
                siblings.push(CompiledSibling {
                    compiled: compiled.clone(),
                    map: map.clone(),
                });
            }
            authored_sources.push(authored);
        }

        inner
            .authored_of
            .insert(compiled.reference(), authored_sources);
        fresh
    }

    pub fn source_by_reference(&self, reference: i64) -> Option<Arc<Source>> {
        self.inner.lock().unwrap().by_reference.get(&reference).cloned()
    }

    pub fn source_by_url(&self, url: &str) -> Option<Arc<Source>> {
        self.inner.lock().unwrap().by_url.get(url).cloned()
    }

    pub fn source_by_path(&self, path: &std::path::Path) -> Option<Arc<Source>> {
        self.inner.lock().unwrap().by_path.get(path).cloned()
    }

    /// Resolve a DAP source descriptor: reference first, then path, then
    /// treating the path as a URL
    pub fn source_for_dap(&self, source: &dap::Source) -> Option<Arc<Source>> {
        if let Some(reference) = source.source_reference.filter(|&r| r > 0) {
            if let Some(found) = self.source_by_reference(reference) {
                return Some(found);
            }
        }
        if let Some(path) = &source.path {
            if let Some(found) = self.source_by_path(std::path::Path::new(path)) {
                return Some(found);
            }
            if let Some(found) = self.source_by_url(path) {
                return Some(found);
            }
        }
        None
    }

    /// The parsed source map of a compiled source
    pub fn map_of(&self, compiled: &Arc<Source>) -> Option<Arc<SourceMap>> {
        self.inner.lock().unwrap().maps.get(&compiled.reference()).cloned()
    }

    /// Compiled scripts reachable from an authored source
    pub fn compiled_siblings(&self, authored: &Arc<Source>) -> Vec<CompiledSibling> {
        self.inner
            .lock()
            .unwrap()
            .compiled_of
            .get(&authored.reference())
            .cloned()
            .unwrap_or_default()
    }

    /// Authored sources produced by a compiled source's map
    pub fn authored_siblings(&self, compiled: &Arc<Source>) -> Vec<Arc<Source>> {
        self.inner
            .lock()
            .unwrap()
            .authored_of
            .get(&compiled.reference())
            .cloned()
            .unwrap_or_default()
    }

    /// Every equivalent UI location reachable from `location` through the
    /// currently-known source maps
    ///
    /// Authored locations translate onto each compiled sibling; compiled
    /// locations translate onto their authored sources. `prefer` filters
    /// the result to one source.
    pub fn current_sibling_ui_locations(
        &self,
        location: &UiLocation,
        prefer: Option<&Arc<Source>>,
    ) -> Vec<UiLocation> {
        let mut out = Vec::new();

        if location.source.is_authored() {
            for sibling in self.compiled_siblings(&location.source) {
                let entry = sibling.map.find_reverse_entry(
                    location.source.url(),
                    location.line.saturating_sub(1),
                    location.column.saturating_sub(1),
                );
                if let Some(entry) = entry {
                    out.push(UiLocation::new(
                        sibling.compiled.clone(),
                        entry.generated_line + 1,
                        entry.generated_column + 1,
                    ));
                }
            }
        } else if let Some(map) = self.map_of(&location.source) {
            let entry = map.find_entry(
                location.line.saturating_sub(1),
                location.column.saturating_sub(1),
            );
            if let Some(entry) = entry {
                if let Some(source_url) = map.entry_source_url(entry) {
                    if let Some(authored) = self.source_by_url(source_url) {
                        out.push(UiLocation::new(
                            authored,
                            entry.source_line + 1,
                            entry.source_column + 1,
                        ));
                    }
                }
            }
        }

        if let Some(prefer) = prefer {
            out.retain(|l| Arc::ptr_eq(&l.source, prefer));
        }
        out
    }

    /// The location shown to the user: authored when a map resolves it,
    /// the compiled location otherwise
    pub fn preferred_ui_location(&self, location: UiLocation) -> UiLocation {
        if location.source.is_authored() {
            return location;
        }
        self.current_sibling_ui_locations(&location, None)
            .into_iter()
            .find(|l| l.source.is_authored())
            .unwrap_or(location)
    }

    /// Raw runtime locations for a compiled UI location, one per script
    /// incarnation
    pub fn raw_locations(&self, location: &UiLocation) -> Vec<RawLocation> {
        location
            .source
            .script_ids()
            .into_iter()
            .map(|script_id| RawLocation {
                script_id,
                line: location.line.saturating_sub(1),
                column: location.column.saturating_sub(1),
            })
            .collect()
    }
}

fn register(inner: &mut Inner, source: &Arc<Source>) {
    inner.by_reference.insert(source.reference(), source.clone());
    inner.by_url.insert(source.url().to_string(), source.clone());
    if let Some(path) = source.absolute_path() {
        inner.by_path.insert(path.to_path_buf(), source.clone());
    }
}

/// Pick where authored text comes from: embedded content when the map
/// carries it, disk when the workspace file is trustworthy, the network
/// otherwise
fn authored_content(
    resolver: &SourcePathResolver,
    map: &Arc<SourceMap>,
    source_url: &str,
    absolute_path: Option<&std::path::Path>,
) -> ContentProvider {
    if let Some(content) = map.source_content(source_url) {
        return ContentProvider::Fixed(content.to_string());
    }
    match absolute_path {
        Some(path) if !resolver.should_check_content_hash() => {
            ContentProvider::File(path.to_path_buf())
        }
        _ => ContentProvider::Url(source_url.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::path_resolver::PathResolverConfig;
    use serde_json::json;

    fn test_container() -> Arc<SourceContainer> {
        let resolver = Arc::new(SourcePathResolver::new(PathResolverConfig {
            web_root: Some(PathBuf::from("/workspace/site")),
            base_url: Some("http://localhost:8080/".to_string()),
            ..Default::default()
        }));
        SourceContainer::new(Arc::new(AdapterContext::new()), resolver)
    }

    fn dummy_session() -> CdpSession {
        let (near, _far) = tokio::io::duplex(64);
        crate::cdp::CdpConnection::from_pipe(near).root_session()
    }

    fn bundle_map(mappings: &str) -> Arc<SourceMap> {
        let json = json!({
            "version": 3,
            "sources": ["http://localhost:8080/src/app.ts"],
            "names": [],
            "mappings": mappings,
        });
        SourceMap::parse(&json.to_string(), "http://localhost:8080/bundle.js.map").unwrap()
    }

    #[tokio::test]
    async fn sources_are_reachable_from_every_index() {
        let container = test_container();
        let session = dummy_session();

        let (source, fresh) =
            container.add_runtime_source("http://localhost:8080/js/app.js", "11", &session);
        assert!(fresh);

        assert!(Arc::ptr_eq(
            &container.source_by_reference(source.reference()).unwrap(),
            &source
        ));
        assert!(Arc::ptr_eq(
            &container.source_by_url("http://localhost:8080/js/app.js").unwrap(),
            &source
        ));
        assert!(Arc::ptr_eq(
            &container
                .source_by_path(std::path::Path::new("/workspace/site/js/app.js"))
                .unwrap(),
            &source
        ));
    }

    #[tokio::test]
    async fn reparsed_scripts_reuse_the_source() {
        let container = test_container();
        let session = dummy_session();

        let (first, _) = container.add_runtime_source("http://x/app.js", "1", &session);
        let (second, fresh) = container.add_runtime_source("http://x/app.js", "2", &session);
        assert!(!fresh);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.script_ids(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn sibling_translation_round_trips_through_the_map() {
        let container = test_container();
        let session = dummy_session();

        // Generated (0, 8) corresponds to authored (4, 0)
        let mut mappings = String::new();
        for field in [8i64, 0, 4, 0] {
            crate::sourcemap::vlq::encode(field, &mut mappings);
        }

        let (compiled, _) =
            container.add_runtime_source("http://localhost:8080/bundle.js", "42", &session);
        let fresh = container.attach_source_map(&compiled, bundle_map(&mappings));
        assert_eq!(fresh.len(), 1);
        let authored = &fresh[0];
        assert_eq!(
            authored.absolute_path(),
            Some(std::path::Path::new("/workspace/site/src/app.ts"))
        );

        // Authored -> compiled
        let locations = container.current_sibling_ui_locations(
            &UiLocation::new(authored.clone(), 5, 1),
            None,
        );
        assert_eq!(locations.len(), 1);
        assert!(Arc::ptr_eq(&locations[0].source, &compiled));
        assert_eq!((locations[0].line, locations[0].column), (1, 9));

        // Compiled -> authored
        let back = container.current_sibling_ui_locations(
            &UiLocation::new(compiled.clone(), 1, 9),
            None,
        );
        assert_eq!(back.len(), 1);
        assert!(Arc::ptr_eq(&back[0].source, authored));
        assert_eq!((back[0].line, back[0].column), (5, 1));

        // Translation is idempotent: asking again yields the same answer
        let again = container.current_sibling_ui_locations(
            &UiLocation::new(authored.clone(), 5, 1),
            None,
        );
        assert_eq!(again.len(), 1);
        assert_eq!((again[0].line, again[0].column), (1, 9));
    }

    #[tokio::test]
    async fn prefer_source_filters_results() {
        let container = test_container();
        let session = dummy_session();

        let (compiled, _) =
            container.add_runtime_source("http://localhost:8080/bundle.js", "42", &session);
        let mut mappings = String::new();
        for field in [0i64, 0, 0, 0] {
            crate::sourcemap::vlq::encode(field, &mut mappings);
        }
        let fresh = container.attach_source_map(&compiled, bundle_map(&mappings));
        let authored = fresh[0].clone();

        let other = container
            .add_runtime_source("http://localhost:8080/other.js", "7", &session)
            .0;
        let locations = container.current_sibling_ui_locations(
            &UiLocation::new(authored, 1, 1),
            Some(&other),
        );
        assert!(locations.is_empty());
    }
}
