//! Source Map Registry: translates between generated (bundle) positions and
//! original (authored) positions for every script the runtime has parsed.
//!
//! Lines are 1-based and columns 0-based on both sides of this API, matching
//! the runtime after its own 0-based line numbers are shifted by one.

pub mod fetch;
pub mod table;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::config::SourceMapAlias;
use crate::errors::BridgeResult;

pub use fetch::{HttpSourceMapFetcher, SourceMapFetcher};
pub use table::MappingTable;

/// Source reported when no registered map covers a position.
pub const UNKNOWN_SOURCE: &str = "__source__";
/// Source Metro emits for the prelude when the map already describes it.
pub const PRELUDE_SOURCE: &str = "__prelude__";

/// Registry handle shared by the session and the breakpoint tasks.
pub type SharedRegistry = Arc<RwLock<SourceMapRegistry>>;

#[derive(Clone, Debug)]
pub struct SourceMapEntry {
    pub generated_url: String,
    pub script_id: String,
    pub table: Arc<MappingTable>,
    pub line_offset: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source_url: String,
    pub line: u32,
    pub column: u32,
    /// Generated URL of the entry that matched; `None` for the sentinel.
    pub script_url: Option<String>,
}

impl OriginalPosition {
    fn unknown(line: u32, column: u32) -> Self {
        Self {
            source_url: UNKNOWN_SOURCE.to_string(),
            line,
            column,
            script_url: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.source_url != UNKNOWN_SOURCE
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedPosition {
    pub source_url: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Default)]
pub struct SourceMapRegistry {
    entries: Vec<SourceMapEntry>,
    known_paths: HashSet<String>,
    prelude_line_count: u32,
    aliases: Vec<SourceMapAlias>,
}

impl SourceMapRegistry {
    pub fn new(prelude_line_count: u32, aliases: Vec<SourceMapAlias>) -> Self {
        Self {
            entries: Vec::new(),
            known_paths: HashSet::new(),
            prelude_line_count,
            aliases,
        }
    }

    pub fn register(
        &mut self,
        map_data: &[u8],
        generated_url: &str,
        script_id: &str,
        is_main_bundle: bool,
    ) -> BridgeResult<Arc<MappingTable>> {
        let table = Arc::new(MappingTable::parse(map_data)?);

        let line_offset = if is_main_bundle
            && self.prelude_line_count > 0
            && !table.contains_source(PRELUDE_SOURCE)
        {
            self.prelude_line_count as i32
        } else {
            0
        };

        self.known_paths
            .extend(table.sources().iter().cloned());

        info!(
            target: "source-maps",
            script_id,
            url = generated_url,
            sources = table.sources().len(),
            line_offset,
            "registered source map"
        );

        self.entries.push(SourceMapEntry {
            generated_url: generated_url.to_string(),
            script_id: script_id.to_string(),
            table: table.clone(),
            line_offset,
        });
        Ok(table)
    }

    /// Resolves a generated position; unmatched fields keep the sentinel
    /// values. Every matching entry is consulted in registration order, so
    /// the newest entry wins where several resolve.
    pub fn to_original(&self, script_id_or_url: &str, line: u32, column: u32) -> OriginalPosition {
        let mut position = OriginalPosition::unknown(line, column);

        for entry in &self.entries {
            if entry.script_id != script_id_or_url
                && !same_script_url(&entry.generated_url, script_id_or_url)
            {
                continue;
            }
            position.script_url = Some(entry.generated_url.clone());

            let map_line = line as i64 - entry.line_offset as i64;
            if map_line < 1 {
                continue;
            }
            let resolved = entry
                .table
                .original_position_for(map_line as u32 - 1, column);
            if let Some(source) = resolved.source {
                position.source_url = self.dealias(source);
            }
            if let Some(src_line) = resolved.line {
                position.line = src_line + 1;
            }
            if let Some(src_col) = resolved.column {
                position.column = src_col;
            }
        }

        position
    }

    /// Nearest generated position at or after the original position, or
    /// `None` when no loaded map covers `original_path`.
    pub fn to_generated(
        &self,
        original_path: &str,
        line: u32,
        column: u32,
    ) -> Option<GeneratedPosition> {
        let query = self.resolve_alias(original_path);
        let line0 = line.checked_sub(1)?;

        let mut found = None;
        for entry in &self.entries {
            if let Some((gen_line, gen_col)) =
                entry.table.generated_position_for(&query, line0, column)
            {
                let shifted = gen_line as i64 + 1 + entry.line_offset as i64;
                found = Some(GeneratedPosition {
                    source_url: entry.generated_url.clone(),
                    line: shifted.max(1) as u32,
                    column: gen_col,
                });
            }
        }

        if found.is_none() {
            debug!(target: "source-maps", path = original_path, line, "no generated position");
        }
        found
    }

    /// Original sources (client-side paths) described by a script's maps.
    pub fn sources_for_script(&self, script_id: &str) -> Vec<String> {
        let mut sources: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.script_id == script_id)
            .flat_map(|entry| entry.table.sources().iter())
            .map(|source| self.dealias(source))
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.known_paths.clear();
    }

    pub fn entries(&self) -> &[SourceMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn known_paths(&self) -> &HashSet<String> {
        &self.known_paths
    }

    /// Translates a client path to the form the maps use. The aliased form is
    /// only used when some loaded map actually mentions it.
    fn resolve_alias(&self, path: &str) -> String {
        for alias in &self.aliases {
            if let Some(rest) = strip_dir_prefix(path, &alias.path) {
                let aliased = format!("{}{}", alias.alias, rest);
                if self.known_paths.contains(&aliased) {
                    return aliased;
                }
            }
        }
        path.to_string()
    }

    fn dealias(&self, source: &str) -> String {
        for alias in &self.aliases {
            if let Some(rest) = strip_dir_prefix(source, &alias.alias) {
                return format!("{}{}", alias.path, rest);
            }
        }
        source.to_string()
    }
}

/// `path` minus `dir` when `dir` is a whole-component prefix of `path`.
fn strip_dir_prefix<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(dir)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Compares script URLs ignoring host and port; the runtime may report a
/// device-visible address while the bridge saw loopback.
fn same_script_url(recorded: &str, query: &str) -> bool {
    if recorded == query {
        return true;
    }
    match (Url::parse(recorded), Url::parse(query)) {
        (Ok(a), Ok(b)) => {
            a.has_host()
                && b.has_host()
                && a.scheme() == b.scheme()
                && a.path() == b.path()
                && a.query() == b.query()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::table::fixtures::APP_MAP;
    use super::*;
    use pretty_assertions::assert_eq;

    const BUNDLE_URL: &str = "http://localhost:8081/index.bundle?platform=ios&dev=true";

    fn registry_with_app(prelude: u32, main: bool) -> SourceMapRegistry {
        let mut registry = SourceMapRegistry::new(prelude, Vec::new());
        registry
            .register(APP_MAP.as_bytes(), BUNDLE_URL, "7", main)
            .unwrap();
        registry
    }

    #[test]
    fn unknown_script_returns_sentinel() {
        let registry = registry_with_app(0, true);
        let position = registry.to_original("99", 12, 4);
        assert_eq!(position, OriginalPosition::unknown(12, 4));
        assert!(!position.is_resolved());
    }

    #[test]
    fn resolves_by_script_id_and_by_url_on_other_host() {
        let registry = registry_with_app(0, true);

        let by_id = registry.to_original("7", 2, 10);
        assert_eq!(by_id.source_url, "src/app.js");
        assert_eq!((by_id.line, by_id.column), (10, 8));
        assert_eq!(by_id.script_url.as_deref(), Some(BUNDLE_URL));

        let by_url = registry.to_original(
            "http://10.0.2.2:8081/index.bundle?platform=ios&dev=true",
            2,
            10,
        );
        assert_eq!(by_url.source_url, "src/app.js");
        assert_eq!(by_url.line, 10);
    }

    #[test]
    fn unresolved_fields_keep_sentinel_values() {
        let registry = registry_with_app(0, true);
        let position = registry.to_original("7", 5, 3);
        assert_eq!(position.source_url, UNKNOWN_SOURCE);
        assert_eq!((position.line, position.column), (5, 3));
        assert_eq!(position.script_url.as_deref(), Some(BUNDLE_URL));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut registry = registry_with_app(0, true);
        assert!(registry.to_original("7", 2, 0).is_resolved());
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.known_paths().is_empty());
        assert_eq!(registry.to_original("7", 2, 0), OriginalPosition::unknown(2, 0));
    }

    #[test]
    fn prelude_offset_applies_only_to_main_bundle() {
        let registry = registry_with_app(3, true);
        assert_eq!(registry.entries()[0].line_offset, 3);
        let original = registry.to_original("7", 5, 10);
        assert_eq!((original.source_url.as_str(), original.line), ("src/app.js", 10));
        let generated = registry.to_generated("src/app.js", 10, 0).unwrap();
        assert_eq!((generated.line, generated.column), (5, 0));
        // inside the prelude itself
        assert!(!registry.to_original("7", 2, 0).is_resolved());

        let secondary = registry_with_app(3, false);
        assert_eq!(secondary.entries()[0].line_offset, 0);
    }

    #[test]
    fn prelude_described_by_map_needs_no_offset() {
        let map = r#"{"version":3,"sources":["__prelude__","src/app.js"],"names":[],"mappings":"AAAA;ACAA"}"#;
        let mut registry = SourceMapRegistry::new(4, Vec::new());
        registry.register(map.as_bytes(), BUNDLE_URL, "1", true).unwrap();
        assert_eq!(registry.entries()[0].line_offset, 0);
    }

    #[test]
    fn round_trip_stays_within_a_line() {
        let registry = registry_with_app(0, true);
        for (line, column) in [(1, 0), (10, 2), (10, 8), (11, 0), (13, 4)] {
            let generated = registry.to_generated("src/app.js", line, column).unwrap();
            let back = registry.to_original(&generated.source_url, generated.line, generated.column);
            assert_eq!(back.source_url, "src/app.js");
            assert!(
                (back.line as i64 - line as i64).abs() <= 1,
                "{line}:{column} came back as {}:{}",
                back.line,
                back.column
            );
        }
    }

    #[test]
    fn aliases_apply_in_both_directions() {
        let map = r#"{"version":3,"sources":["/app/src/app.js"],"names":[],"mappings":"AAAA;AASE"}"#;
        let aliases = vec![SourceMapAlias {
            alias: "/app".into(),
            path: "/home/dev/project".into(),
        }];
        let mut registry = SourceMapRegistry::new(0, aliases);
        registry.register(map.as_bytes(), BUNDLE_URL, "1", false).unwrap();

        let generated = registry
            .to_generated("/home/dev/project/src/app.js", 10, 0)
            .unwrap();
        assert_eq!(generated.line, 2);

        let original = registry.to_original("1", 2, 0);
        assert_eq!(original.source_url, "/home/dev/project/src/app.js");
        assert_eq!(
            registry.sources_for_script("1"),
            vec!["/home/dev/project/src/app.js".to_string()]
        );
        // prefix must end on a path component
        assert!(registry.to_generated("/home/dev/project-b/src/app.js", 10, 0).is_none());
    }

    #[test]
    fn unaliased_path_used_when_alias_never_seen() {
        let map = r#"{"version":3,"sources":["/home/dev/project/src/app.js"],"names":[],"mappings":"AAAA"}"#;
        let aliases = vec![SourceMapAlias {
            alias: "/app".into(),
            path: "/home/dev/project".into(),
        }];
        let mut registry = SourceMapRegistry::new(0, aliases);
        registry.register(map.as_bytes(), BUNDLE_URL, "1", false).unwrap();
        assert!(registry
            .to_generated("/home/dev/project/src/app.js", 1, 0)
            .is_some());
    }

    #[test]
    fn newest_entry_wins_for_duplicate_urls() {
        let old = r#"{"version":3,"sources":["src/old.js"],"names":[],"mappings":"AAAA"}"#;
        let mut registry = SourceMapRegistry::new(0, Vec::new());
        registry.register(old.as_bytes(), BUNDLE_URL, "1", false).unwrap();
        registry.register(APP_MAP.as_bytes(), BUNDLE_URL, "2", false).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.to_original(BUNDLE_URL, 1, 0).source_url, "src/app.js");
    }
}
