//! V3 source map parsing and position lookup
//!
//! Mappings are kept sorted by generated position. Reverse lookup indices
//! are built lazily, one per authored source, sorted by source position.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use url::Url;

use crate::common::{Error, Result};

use super::vlq::VlqDecoder;

/// One decoded mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapEntry {
    pub generated_line: u32,
    pub generated_column: u32,
    pub source_index: Option<usize>,
    pub source_line: u32,
    pub source_column: u32,
    pub name_index: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    mappings: String,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    sources_content: Option<Vec<Option<String>>>,
    #[serde(default)]
    sections: Option<Vec<RawSection>>,
}

#[derive(Deserialize)]
struct RawSection {
    offset: RawOffset,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    map: Option<RawSourceMap>,
}

#[derive(Deserialize)]
struct RawOffset {
    line: u32,
    column: u32,
}

/// A parsed V3 source map
pub struct SourceMap {
    url: String,
    sources: Vec<String>,
    names: Vec<String>,
    sources_content: Vec<Option<String>>,
    entries: Vec<SourceMapEntry>,
    /// Per-source reverse indices, built on first use
    reverse: Mutex<HashMap<usize, Arc<Vec<usize>>>>,
}

impl SourceMap {
    /// Parse a source map body fetched from `map_url`
    ///
    /// Handles both plain and sectioned (indexed) maps. Sections referring
    /// to an external `url` are rejected.
    pub fn parse(body: &str, map_url: &str) -> Result<Arc<SourceMap>> {
        let body = strip_xssi(body);
        let raw: RawSourceMap =
            serde_json::from_str(body).map_err(|e| Error::SourceMapParse(e.to_string()))?;

        if let Some(version) = raw.version {
            if version != 3 {
                return Err(Error::SourceMapParse(format!(
                    "unsupported source map version {version}"
                )));
            }
        }

        let mut sources = Vec::new();
        let mut names = Vec::new();
        let mut sources_content = Vec::new();
        let mut entries = Vec::new();

        match raw.sections {
            Some(sections) => {
                for section in sections {
                    if section.url.is_some() {
                        return Err(Error::SourceMapParse(
                            "sections with a url field are not supported".to_string(),
                        ));
                    }
                    let Some(map) = section.map else {
                        continue;
                    };
                    let source_base = sources.len();
                    let name_base = names.len();
                    append_raw_map(
                        map,
                        map_url,
                        &mut sources,
                        &mut names,
                        &mut sources_content,
                        &mut entries,
                        source_base,
                        name_base,
                        section.offset.line,
                        section.offset.column,
                    )?;
                }
            }
            None => {
                append_raw_map(
                    raw,
                    map_url,
                    &mut sources,
                    &mut names,
                    &mut sources_content,
                    &mut entries,
                    0,
                    0,
                    0,
                    0,
                )?;
            }
        }

        entries.sort_by_key(|e| (e.generated_line, e.generated_column));

        Ok(Arc::new(SourceMap {
            url: map_url.to_string(),
            sources,
            names,
            sources_content,
            entries,
            reverse: Mutex::new(HashMap::new()),
        }))
    }

    /// The URL this map was fetched from
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolved URLs of the authored sources
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Embedded content for an authored source, if the map carries it
    pub fn source_content(&self, source_url: &str) -> Option<&str> {
        let index = self.source_index(source_url)?;
        self.sources_content.get(index)?.as_deref()
    }

    /// Name table entry for a mapping
    pub fn name(&self, entry: &SourceMapEntry) -> Option<&str> {
        entry
            .name_index
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    /// Resolved URL of the source a mapping points into
    pub fn entry_source_url(&self, entry: &SourceMapEntry) -> Option<&str> {
        entry.source_index.map(|i| self.sources[i].as_str())
    }

    /// All mappings, sorted by generated position
    pub fn entries(&self) -> &[SourceMapEntry] {
        &self.entries
    }

    /// Forward lookup: the mapping with the greatest generated position
    /// `<= (line, column)`, 0-based
    pub fn find_entry(&self, line: u32, column: u32) -> Option<&SourceMapEntry> {
        let idx = self
            .entries
            .partition_point(|e| (e.generated_line, e.generated_column) <= (line, column));
        if idx == 0 {
            return None;
        }
        Some(&self.entries[idx - 1])
    }

    /// Reverse lookup: the mapping for `source_url` with the smallest
    /// source position `>= (line, column)`; if none, the last mapping on
    /// the same source line
    pub fn find_reverse_entry(
        &self,
        source_url: &str,
        line: u32,
        column: u32,
    ) -> Option<&SourceMapEntry> {
        let source_index = self.source_index(source_url)?;
        let index = self.reverse_index(source_index);

        let at = index.partition_point(|&i| {
            let e = &self.entries[i];
            (e.source_line, e.source_column) < (line, column)
        });
        if let Some(&i) = index.get(at) {
            return Some(&self.entries[i]);
        }

        // Nothing at or after the query: fall back to the last mapping on
        // the queried source line.
        index
            .iter()
            .rev()
            .map(|&i| &self.entries[i])
            .find(|e| e.source_line == line)
    }

    fn source_index(&self, source_url: &str) -> Option<usize> {
        self.sources.iter().position(|s| s == source_url)
    }

    fn reverse_index(&self, source_index: usize) -> Arc<Vec<usize>> {
        let mut cache = self.reverse.lock().unwrap();
        cache
            .entry(source_index)
            .or_insert_with(|| {
                let mut index: Vec<usize> = (0..self.entries.len())
                    .filter(|&i| self.entries[i].source_index == Some(source_index))
                    .collect();
                index.sort_by_key(|&i| {
                    let e = &self.entries[i];
                    (e.source_line, e.source_column)
                });
                Arc::new(index)
            })
            .clone()
    }
}

/// Strip the `)]}'` XSSI defense prefix through the next newline
fn strip_xssi(body: &str) -> &str {
    if !body.starts_with(")]}") {
        return body;
    }
    match body.find('\n') {
        Some(pos) => &body[pos + 1..],
        None => "",
    }
}

#[allow(clippy::too_many_arguments)]
fn append_raw_map(
    raw: RawSourceMap,
    map_url: &str,
    sources: &mut Vec<String>,
    names: &mut Vec<String>,
    sources_content: &mut Vec<Option<String>>,
    entries: &mut Vec<SourceMapEntry>,
    source_base: usize,
    name_base: usize,
    line_offset: u32,
    column_offset: u32,
) -> Result<()> {
    let source_root = raw.source_root.as_deref();
    for source in &raw.sources {
        sources.push(resolve_source_url(map_url, source_root, source));
    }
    names.extend(raw.names);

    let mut content = raw.sources_content.unwrap_or_default();
    content.resize(raw.sources.len(), None);
    sources_content.extend(content);

    decode_mappings(
        &raw.mappings,
        entries,
        source_base,
        name_base,
        raw.sources.len(),
        line_offset,
        column_offset,
    )
}

fn decode_mappings(
    mappings: &str,
    entries: &mut Vec<SourceMapEntry>,
    source_base: usize,
    name_base: usize,
    source_count: usize,
    line_offset: u32,
    column_offset: u32,
) -> Result<()> {
    let mut source_index: i64 = 0;
    let mut source_line: i64 = 0;
    let mut source_column: i64 = 0;
    let mut name_index: i64 = 0;

    for (line_number, line) in mappings.split(';').enumerate() {
        let mut generated_column: i64 = 0;

        for segment in line.split(',') {
            if segment.is_empty() {
                continue;
            }
            let mut decoder = VlqDecoder::new(segment);

            generated_column += decoder.decode()?;
            if generated_column < 0 {
                return Err(Error::SourceMapParse("negative generated column".to_string()));
            }

            let mut entry = SourceMapEntry {
                generated_line: line_number as u32 + line_offset,
                generated_column: generated_column as u32,
                source_index: None,
                source_line: 0,
                source_column: 0,
                name_index: None,
            };
            if line_number == 0 {
                entry.generated_column += column_offset;
            }

            if !decoder.is_empty() {
                source_index += decoder.decode()?;
                source_line += decoder.decode()?;
                source_column += decoder.decode()?;
                if source_index < 0
                    || source_index as usize >= source_count
                    || source_line < 0
                    || source_column < 0
                {
                    return Err(Error::SourceMapParse(
                        "mapping references out-of-range source".to_string(),
                    ));
                }
                entry.source_index = Some(source_index as usize + source_base);
                entry.source_line = source_line as u32;
                entry.source_column = source_column as u32;

                if !decoder.is_empty() {
                    name_index += decoder.decode()?;
                    if name_index >= 0 {
                        entry.name_index = Some(name_index as usize + name_base);
                    }
                }
            }

            entries.push(entry);
        }
    }

    Ok(())
}

/// Resolve a `sources[]` entry against the map URL and sourceRoot
fn resolve_source_url(map_url: &str, source_root: Option<&str>, source: &str) -> String {
    // Already absolute
    if Url::parse(source).is_ok() {
        return source.to_string();
    }

    let prefixed = match source_root {
        Some(root) if !root.is_empty() => {
            if root.ends_with('/') {
                format!("{root}{source}")
            } else {
                format!("{root}/{source}")
            }
        }
        _ => source.to_string(),
    };

    if Url::parse(&prefixed).is_ok() {
        return prefixed;
    }
    if let Ok(base) = Url::parse(map_url) {
        if let Ok(resolved) = base.join(&prefixed) {
            return resolved.to_string();
        }
    }
    prefixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sourcemap::vlq;

    /// Build a mappings string from per-line segments of decoded fields
    fn build_mappings(lines: &[Vec<Vec<i64>>]) -> String {
        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            for (j, segment) in line.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                for &field in segment {
                    vlq::encode(field, &mut out);
                }
            }
        }
        out
    }

    fn simple_map() -> Arc<SourceMap> {
        // bundle.js line 0: columns 0 and 8 map to app.ts (0,0) and (2,4);
        // line 1 column 0 maps to util.ts (0,0).
        let mappings = build_mappings(&[
            vec![vec![0, 0, 0, 0], vec![8, 0, 2, 4]],
            vec![vec![0, 1, -2, -4]],
        ]);
        let json = serde_json::json!({
            "version": 3,
            "sources": ["app.ts", "util.ts"],
            "names": [],
            "mappings": mappings,
        });
        SourceMap::parse(&json.to_string(), "http://localhost/bundle.js.map").unwrap()
    }

    #[test]
    fn entries_are_sorted_after_parse() {
        let map = simple_map();
        let positions: Vec<_> = map
            .entries()
            .iter()
            .map(|e| (e.generated_line, e.generated_column))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn forward_lookup_is_upper_bound_minus_one() {
        let map = simple_map();

        let entry = map.find_entry(0, 0).unwrap();
        assert_eq!((entry.source_line, entry.source_column), (0, 0));

        // Between two mappings: the earlier one wins
        let entry = map.find_entry(0, 7).unwrap();
        assert_eq!((entry.source_line, entry.source_column), (0, 0));

        let entry = map.find_entry(0, 100).unwrap();
        assert_eq!((entry.source_line, entry.source_column), (2, 4));
    }

    #[test]
    fn forward_lookup_before_first_mapping_is_none() {
        let mappings = build_mappings(&[vec![vec![5, 0, 0, 0]]]);
        let json = serde_json::json!({
            "version": 3,
            "sources": ["a.ts"],
            "names": [],
            "mappings": mappings,
        });
        let map = SourceMap::parse(&json.to_string(), "http://x/m.map").unwrap();
        assert!(map.find_entry(0, 2).is_none());
    }

    #[test]
    fn reverse_lookup_finds_smallest_at_or_after() {
        let map = simple_map();
        let url = map.sources()[0].clone();

        // Exact hit
        let entry = map.find_reverse_entry(&url, 2, 4).unwrap();
        assert_eq!((entry.generated_line, entry.generated_column), (0, 8));

        // Before the first mapping of that source: next one wins
        let entry = map.find_reverse_entry(&url, 1, 0).unwrap();
        assert_eq!((entry.generated_line, entry.generated_column), (0, 8));

        // Past everything: last mapping on the same source line
        let entry = map.find_reverse_entry(&url, 2, 90).unwrap();
        assert_eq!((entry.generated_line, entry.generated_column), (0, 8));

        // Past everything on a line with no mappings at all
        assert!(map.find_reverse_entry(&url, 7, 0).is_none());

        assert!(map.find_reverse_entry("unknown.ts", 0, 0).is_none());
    }

    #[test]
    fn resolves_source_urls_against_map_url() {
        let json = serde_json::json!({
            "version": 3,
            "sources": ["../src/app.ts", "webpack:///./x.ts"],
            "names": [],
            "mappings": "AAAA",
        });
        let map = SourceMap::parse(&json.to_string(), "http://localhost/dist/bundle.js.map")
            .unwrap();
        assert_eq!(map.sources()[0], "http://localhost/src/app.ts");
        assert_eq!(map.sources()[1], "webpack:///./x.ts");
    }

    #[test]
    fn strips_xssi_prefix() {
        let body = ")]}'\n{\"version\":3,\"sources\":[],\"names\":[],\"mappings\":\"\"}";
        assert!(SourceMap::parse(body, "http://x/map").is_ok());
    }

    #[test]
    fn sectioned_maps_offset_positions() {
        let inner = serde_json::json!({
            "version": 3,
            "sources": ["part.ts"],
            "names": [],
            "mappings": build_mappings(&[vec![vec![0, 0, 0, 0]]]),
        });
        let json = serde_json::json!({
            "version": 3,
            "sections": [
                { "offset": { "line": 0, "column": 0 }, "map": inner },
                { "offset": { "line": 10, "column": 2 }, "map": inner },
            ],
        });
        let map = SourceMap::parse(&json.to_string(), "http://x/combined.map").unwrap();
        assert_eq!(map.entries().len(), 2);
        assert_eq!(map.entries()[1].generated_line, 10);
        assert_eq!(map.entries()[1].generated_column, 2);
        // Each section contributes its own source table slice
        assert_eq!(map.sources().len(), 2);
    }

    #[test]
    fn rejects_sections_with_url() {
        let json = serde_json::json!({
            "version": 3,
            "sections": [ { "offset": { "line": 0, "column": 0 }, "url": "other.map" } ],
        });
        assert!(SourceMap::parse(&json.to_string(), "http://x/combined.map").is_err());
    }
}
