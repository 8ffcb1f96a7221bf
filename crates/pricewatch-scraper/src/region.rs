//! Region token resolution.
//!
//! Source sites label storefronts inconsistently (`"uk"`, `"sa_en"`,
//! `"Saudi Arabia - English"`, `"africa"`). [`RegionResolver`] maps those
//! tokens to one canonical code from the region catalogue, or reports
//! [`Resolution::Unresolved`].

use std::collections::{BTreeMap, HashMap, HashSet};

use pricewatch_core::{RegionRecord, RegionsFile};

/// Tokens a prefix heuristic would get wrong. Catalogue overrides take
/// precedence over these.
const BUILTIN_OVERRIDES: &[(&str, &str)] = &[
    ("uk", "GB"),
    ("africa", "XF"),
    ("la", "XL"),
    ("cis_en", "CIS"),
    ("cis_ru", "CIS"),
    ("mena_ar", "MENA"),
    ("mena_en", "MENA"),
];

const SEPARATORS: &[char] = &['_', '-'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Unresolved,
}

impl Resolution {
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Resolution::Resolved(code) => Some(code),
            Resolution::Unresolved => None,
        }
    }

    #[must_use]
    pub fn into_code(self) -> Option<String> {
        match self {
            Resolution::Resolved(code) => Some(code),
            Resolution::Unresolved => None,
        }
    }
}

/// Which lookup step produced a resolution; surfaced by `regions resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Override,
    Code,
    Alias,
    PrefixHeuristic,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionSource::Override => write!(f, "override"),
            ResolutionSource::Code => write!(f, "code"),
            ResolutionSource::Alias => write!(f, "alias"),
            ResolutionSource::PrefixHeuristic => write!(f, "prefix heuristic"),
        }
    }
}

/// Read-only lookup tables built once from the region catalogue.
#[derive(Debug, Clone, Default)]
pub struct RegionDirectory {
    records: Vec<RegionRecord>,
    codes: HashSet<String>,
    aliases: HashMap<String, String>,
    overrides: HashMap<String, String>,
}

impl RegionDirectory {
    /// Build the directory from catalogue records and extra overrides.
    ///
    /// Built-in overrides are merged under `overrides`. Any override whose
    /// target is not a catalogue code is dropped, so an override can never
    /// yield a code outside the canonical set.
    #[must_use]
    pub fn new(records: Vec<RegionRecord>, overrides: &BTreeMap<String, String>) -> Self {
        let codes: HashSet<String> = records
            .iter()
            .map(|r| r.code.trim().to_ascii_uppercase())
            .collect();

        let mut aliases = HashMap::new();
        for record in &records {
            let code = record.code.trim().to_ascii_uppercase();
            aliases.insert(record.name.trim().to_lowercase(), code.clone());
            for alias in &record.aliases {
                let key = alias.trim().to_lowercase();
                if let Some(existing) = aliases.get(&key) {
                    if *existing != code {
                        tracing::warn!(
                            alias = %key,
                            first = %existing,
                            second = %code,
                            "region alias maps to two codes; keeping the first"
                        );
                    }
                    continue;
                }
                aliases.insert(key, code.clone());
            }
        }

        let mut merged: HashMap<String, String> = BUILTIN_OVERRIDES
            .iter()
            .map(|(token, code)| ((*token).to_string(), (*code).to_string()))
            .collect();
        for (token, code) in overrides {
            merged.insert(token.trim().to_lowercase(), code.trim().to_ascii_uppercase());
        }
        merged.retain(|token, code| {
            let known = codes.contains(code);
            if !known {
                tracing::debug!(token = %token, code = %code, "dropping override to unknown region code");
            }
            known
        });

        Self {
            records,
            codes,
            aliases,
            overrides: merged,
        }
    }

    #[must_use]
    pub fn from_file(file: RegionsFile) -> Self {
        Self::new(file.regions, &file.overrides)
    }

    #[must_use]
    pub fn records(&self) -> &[RegionRecord] {
        &self.records
    }

    #[must_use]
    pub fn is_code(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Maps raw region tokens to canonical codes.
///
/// Lookup order: override table, canonical code, alias, then (unless
/// `strict`) the uppercased prefix before the first `_` or `-`.
#[derive(Debug, Clone)]
pub struct RegionResolver {
    directory: RegionDirectory,
    strict: bool,
}

impl RegionResolver {
    #[must_use]
    pub fn new(directory: RegionDirectory) -> Self {
        Self {
            directory,
            strict: false,
        }
    }

    /// Skip the prefix heuristic; tokens not covered by the tables are
    /// reported as unresolved.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn directory(&self) -> &RegionDirectory {
        &self.directory
    }

    #[must_use]
    pub fn resolve(&self, token: &str) -> Resolution {
        match self.explain(token) {
            Some((code, _)) => Resolution::Resolved(code),
            None => Resolution::Unresolved,
        }
    }

    /// Resolve `token` and report which step matched.
    #[must_use]
    pub fn explain(&self, token: &str) -> Option<(String, ResolutionSource)> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lower = trimmed.to_lowercase();

        if let Some(code) = self.directory.overrides.get(&lower) {
            return Some((code.clone(), ResolutionSource::Override));
        }

        let upper = trimmed.to_ascii_uppercase();
        if self.directory.codes.contains(&upper) {
            return Some((upper, ResolutionSource::Code));
        }

        if let Some(code) = self.directory.aliases.get(&lower) {
            return Some((code.clone(), ResolutionSource::Alias));
        }

        if self.strict {
            return None;
        }

        let (prefix, _) = trimmed.split_once(SEPARATORS)?;
        let prefix = prefix.trim().to_ascii_uppercase();
        if self.directory.codes.contains(&prefix) {
            tracing::warn!(
                token = %trimmed,
                code = %prefix,
                "region resolved by prefix heuristic; add an alias if this is wrong"
            );
            return Some((prefix, ResolutionSource::PrefixHeuristic));
        }

        None
    }
}
