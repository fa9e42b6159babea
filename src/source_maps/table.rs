//! Decoded mapping table with a forward (generated) and reverse (original) index.
//!
//! All lines here are 0-based; the registry converts at its boundary.

use std::collections::HashMap;

use sourcemap::SourceMap;

use crate::errors::{BridgeError, BridgeResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mapping {
    gen_line: u32,
    gen_col: u32,
    source: Option<u32>,
    src_line: u32,
    src_col: u32,
}

/// What a generated position resolved to. Fields the map does not describe
/// stay `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedOriginal<'a> {
    pub source: Option<&'a str>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

#[derive(Debug)]
pub struct MappingTable {
    sources: Vec<String>,
    by_generated: Vec<Mapping>,
    by_original: Vec<Mapping>,
}

impl MappingTable {
    pub fn parse(data: &[u8]) -> BridgeResult<Self> {
        let map = SourceMap::from_slice(data).map_err(|err| BridgeError::SourceMap(err.to_string()))?;

        let sources: Vec<String> = map.sources().map(str::to_string).collect();
        let index: HashMap<&str, u32> = sources
            .iter()
            .enumerate()
            .map(|(idx, source)| (source.as_str(), idx as u32))
            .collect();

        let mut by_generated: Vec<Mapping> = map
            .tokens()
            .map(|token| {
                let source = token.get_source().and_then(|name| index.get(name).copied());
                Mapping {
                    gen_line: token.get_dst_line(),
                    gen_col: token.get_dst_col(),
                    source,
                    src_line: token.get_src_line(),
                    src_col: token.get_src_col(),
                }
            })
            .collect();
        by_generated.sort_by_key(|m| (m.gen_line, m.gen_col));

        let mut by_original: Vec<Mapping> = by_generated
            .iter()
            .filter(|m| m.source.is_some())
            .copied()
            .collect();
        by_original.sort_by_key(|m| (m.source, m.src_line, m.src_col, m.gen_line, m.gen_col));

        Ok(Self {
            sources,
            by_generated,
            by_original,
        })
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn contains_source(&self, source: &str) -> bool {
        self.sources.iter().any(|s| s == source)
    }

    pub fn mapping_count(&self) -> usize {
        self.by_generated.len()
    }

    /// Closest mapping at or before `(line, column)` on the same generated line.
    pub fn original_position_for(&self, line: u32, column: u32) -> ResolvedOriginal<'_> {
        let idx = self
            .by_generated
            .partition_point(|m| (m.gen_line, m.gen_col) <= (line, column));
        let Some(mapping) = idx.checked_sub(1).map(|i| self.by_generated[i]) else {
            return ResolvedOriginal::default();
        };
        if mapping.gen_line != line {
            return ResolvedOriginal::default();
        }
        match mapping.source {
            Some(source) => ResolvedOriginal {
                source: self.sources.get(source as usize).map(String::as_str),
                line: Some(mapping.src_line),
                column: Some(mapping.src_col),
            },
            None => ResolvedOriginal::default(),
        }
    }

    /// First generated position whose original position is at or after
    /// `(line, column)` in `source`. Ties on the original position go to the
    /// earliest generated position.
    pub fn generated_position_for(&self, source: &str, line: u32, column: u32) -> Option<(u32, u32)> {
        let source = self.sources.iter().position(|s| s == source)? as u32;
        let idx = self
            .by_original
            .partition_point(|m| (m.source, m.src_line, m.src_col) < (Some(source), line, column));
        let mapping = self.by_original.get(idx)?;
        (mapping.source == Some(source)).then_some((mapping.gen_line, mapping.gen_col))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// `bundle.js` built from `src/app.js` and `src/util.js` (0-based lines):
    ///
    /// generated 0: col 0 -> app.js 0:0
    /// generated 1: col 0 -> app.js 9:2, col 10 -> app.js 9:8
    /// generated 2: col 0 -> app.js 9:2 (second emission), col 4 -> app.js 10:0
    /// generated 3: col 0 -> util.js 2:0, col 6 -> app.js 12:4
    /// generated 4: col 0 -> unmapped segment
    pub const APP_MAP: &str = r#"{"version":3,"file":"bundle.js","sources":["src/app.js","src/util.js"],"names":[],"mappings":"AAAA;AASE,UAAM;AAAN,IACF;ACRA,MDUI;A"}"#;
}
