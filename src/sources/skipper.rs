//! Deciding which scripts are user code
//!
//! Skip patterns come from the launch configuration as globs over script
//! URLs. Matching scripts are blackboxed in the runtime and their frames
//! rendered subtle in stack traces.

use regex::Regex;

pub struct ScriptSkipper {
    patterns: Vec<Regex>,
    raw: Vec<String>,
}

impl ScriptSkipper {
    /// Compile skip globs; invalid patterns are dropped with a warning
    pub fn new(globs: &[String]) -> Self {
        let mut patterns = Vec::new();
        let mut raw = Vec::new();
        for glob in globs {
            let regex = glob_to_regex(glob);
            match Regex::new(&format!("(?i)^{regex}$")) {
                Ok(compiled) => {
                    patterns.push(compiled);
                    raw.push(regex);
                }
                Err(e) => tracing::warn!(pattern = %glob, "invalid skip pattern: {e}"),
            }
        }
        Self { patterns, raw }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether frames from this script should be treated as library code
    pub fn is_skipped(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(url))
    }

    /// Pattern strings for Debugger.setBlackboxPatterns
    pub fn cdp_patterns(&self) -> Vec<String> {
        self.raw.clone()
    }
}

/// Convert a skip glob into a regex: `**` crosses path separators, `*`
/// stays within one segment, `?` is any single character
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::new();
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following separator so "a/**/b" matches "a/b"
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_node_modules_glob() {
        let skipper = ScriptSkipper::new(&["**/node_modules/**".to_string()]);
        assert!(skipper.is_skipped("http://localhost/node_modules/react/index.js"));
        assert!(skipper.is_skipped("file:///w/node_modules/x.js"));
        assert!(!skipper.is_skipped("http://localhost/src/app.js"));
    }

    #[test]
    fn single_star_stays_in_segment() {
        let skipper = ScriptSkipper::new(&["http://localhost/vendor/*.js".to_string()]);
        assert!(skipper.is_skipped("http://localhost/vendor/lib.js"));
        assert!(!skipper.is_skipped("http://localhost/vendor/deep/lib.js"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let skipper = ScriptSkipper::new(&["**/Vendor/**".to_string()]);
        assert!(skipper.is_skipped("http://localhost/vendor/lib.js"));
    }

    #[test]
    fn empty_skipper_skips_nothing() {
        let skipper = ScriptSkipper::new(&[]);
        assert!(skipper.is_empty());
        assert!(!skipper.is_skipped("http://localhost/anything.js"));
    }
}
