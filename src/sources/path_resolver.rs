//! Bidirectional authored-path to URL mapping
//!
//! Launch configurations describe how the served site maps onto the
//! workspace: a web root directory, the base URL it is served at, and
//! override rules for bundler-synthesized URLs.

use std::path::{Path, PathBuf};

use url::Url;

/// Resolver configuration, extracted from launch or attach arguments
#[derive(Debug, Default, Clone)]
pub struct PathResolverConfig {
    /// Workspace root
    pub root_path: Option<PathBuf>,
    /// Directory served at `base_url`
    pub web_root: Option<PathBuf>,
    /// URL the web root is served at
    pub base_url: Option<String>,
    /// Source map path override rules; patterns may end in `*` and
    /// replacements may contain `{webRoot}`
    pub path_overrides: Vec<(String, String)>,
    /// Whether the runtime is on another machine, where the network may
    /// rewrite content
    pub remote: bool,
}

/// Built-in webpack prefix rules, applied after user overrides
const DEFAULT_OVERRIDES: &[(&str, &str)] = &[
    ("webpack:///./~/", "{webRoot}/node_modules/"),
    ("webpack:///./", "{webRoot}/"),
    ("webpack:///src/", "{webRoot}/"),
    ("webpack:///", "/"),
];

pub struct SourcePathResolver {
    web_root: Option<PathBuf>,
    base_url: Option<Url>,
    rules: Vec<(String, String)>,
    remote: bool,
}

impl SourcePathResolver {
    pub fn new(config: PathResolverConfig) -> Self {
        let mut rules: Vec<(String, String)> = config
            .path_overrides
            .iter()
            .map(|(pattern, replacement)| {
                (
                    pattern.trim_end_matches('*').to_string(),
                    replacement.trim_end_matches('*').to_string(),
                )
            })
            .collect();
        rules.extend(
            DEFAULT_OVERRIDES
                .iter()
                .map(|(p, r)| (p.to_string(), r.to_string())),
        );

        Self {
            web_root: config.web_root,
            base_url: config.base_url.as_deref().and_then(|u| Url::parse(u).ok()),
            rules,
            remote: config.remote,
        }
    }

    /// Map a workspace path onto the URL it is served at
    ///
    /// Paths under the web root map into the base URL; everything else
    /// becomes a `file://` URL.
    pub fn absolute_path_to_url(&self, path: &Path) -> Option<String> {
        if let (Some(web_root), Some(base_url)) = (&self.web_root, &self.base_url) {
            if let Ok(relative) = path.strip_prefix(web_root) {
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                return base_url.join(&relative).ok().map(|u| u.to_string());
            }
        }
        Url::from_file_path(path).ok().map(|u| u.to_string())
    }

    /// Map a script URL back onto a workspace path
    pub fn url_to_absolute_path(&self, url: &str) -> Option<PathBuf> {
        if url.starts_with("file://") {
            return Url::parse(url).ok().and_then(|u| u.to_file_path().ok());
        }

        for (prefix, replacement) in &self.rules {
            if let Some(rest) = url.strip_prefix(prefix.as_str()) {
                let base = self.expand_web_root(replacement)?;
                return Some(join_url_tail(&base, rest));
            }
        }

        let base_url = self.base_url.as_ref()?;
        let web_root = self.web_root.as_ref()?;
        let parsed = Url::parse(url).ok()?;
        if parsed.origin() != base_url.origin() {
            return None;
        }

        let mut tail = parsed
            .path()
            .strip_prefix(base_url.path())
            .unwrap_or_else(|| parsed.path())
            .trim_start_matches('/');
        if tail.is_empty() {
            tail = "index.html";
        }
        Some(join_url_tail(web_root, tail))
    }

    /// Whether installed script content should be verified by hash: remote
    /// runtimes may have content rewritten in flight
    pub fn should_check_content_hash(&self) -> bool {
        self.remote
    }

    fn expand_web_root(&self, replacement: &str) -> Option<PathBuf> {
        if let Some(rest) = replacement.strip_prefix("{webRoot}") {
            let web_root = self.web_root.as_ref()?;
            return Some(join_url_tail(web_root, rest.trim_start_matches('/')));
        }
        Some(PathBuf::from(replacement))
    }
}

/// Join a URL-style `/`-separated tail onto a filesystem base
fn join_url_tail(base: &Path, tail: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for part in tail.split('/') {
        if !part.is_empty() && part != "." {
            out.push(part);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SourcePathResolver {
        SourcePathResolver::new(PathResolverConfig {
            root_path: Some(PathBuf::from("/workspace")),
            web_root: Some(PathBuf::from("/workspace/site")),
            base_url: Some("http://localhost:8080/".to_string()),
            path_overrides: Vec::new(),
            remote: false,
        })
    }

    #[test]
    fn paths_under_web_root_round_trip() {
        let resolver = resolver();
        let path = Path::new("/workspace/site/js/app.js");

        let url = resolver.absolute_path_to_url(path).unwrap();
        assert_eq!(url, "http://localhost:8080/js/app.js");
        assert_eq!(resolver.url_to_absolute_path(&url).unwrap(), path);
    }

    #[test]
    fn paths_outside_web_root_become_file_urls() {
        let resolver = resolver();
        let path = Path::new("/elsewhere/tool.js");

        let url = resolver.absolute_path_to_url(path).unwrap();
        assert_eq!(url, "file:///elsewhere/tool.js");
        assert_eq!(resolver.url_to_absolute_path(&url).unwrap(), path);
    }

    #[test]
    fn webpack_prefixes_map_into_web_root() {
        let resolver = resolver();

        assert_eq!(
            resolver.url_to_absolute_path("webpack:///./~/lodash/index.js"),
            Some(PathBuf::from("/workspace/site/node_modules/lodash/index.js"))
        );
        assert_eq!(
            resolver.url_to_absolute_path("webpack:///./app/main.ts"),
            Some(PathBuf::from("/workspace/site/app/main.ts"))
        );
        assert_eq!(
            resolver.url_to_absolute_path("webpack:///src/main.ts"),
            Some(PathBuf::from("/workspace/site/main.ts"))
        );
        assert_eq!(
            resolver.url_to_absolute_path("webpack:///usr/lib/x.js"),
            Some(PathBuf::from("/usr/lib/x.js"))
        );
    }

    #[test]
    fn user_overrides_run_before_defaults() {
        let resolver = SourcePathResolver::new(PathResolverConfig {
            web_root: Some(PathBuf::from("/workspace/site")),
            base_url: Some("http://localhost:8080/".to_string()),
            path_overrides: vec![(
                "webpack:///./*".to_string(),
                "{webRoot}/generated/*".to_string(),
            )],
            ..Default::default()
        });

        assert_eq!(
            resolver.url_to_absolute_path("webpack:///./main.ts"),
            Some(PathBuf::from("/workspace/site/generated/main.ts"))
        );
    }

    #[test]
    fn bare_site_root_is_index_html() {
        let resolver = resolver();
        assert_eq!(
            resolver.url_to_absolute_path("http://localhost:8080/"),
            Some(PathBuf::from("/workspace/site/index.html"))
        );
    }

    #[test]
    fn foreign_origins_do_not_resolve() {
        let resolver = resolver();
        assert!(resolver
            .url_to_absolute_path("http://cdn.example.com/lib.js")
            .is_none());
    }

    #[test]
    fn remote_runtimes_check_content_hashes() {
        let local = resolver();
        assert!(!local.should_check_content_hash());

        let remote = SourcePathResolver::new(PathResolverConfig {
            remote: true,
            ..Default::default()
        });
        assert!(remote.should_check_content_hash());
    }
}
