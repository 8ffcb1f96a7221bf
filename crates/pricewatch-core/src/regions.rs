//! Region catalogue: canonical region codes and the aliases that map to them.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    /// Canonical 2–4 letter identifier, e.g. `"GB"` or the aggregate `"XF"`.
    pub code: String,
    pub name: String,
    /// Other codes, display names and localized strings that mean this region.
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegionsFile {
    /// Token → canonical code entries consulted before any other lookup.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    pub regions: Vec<RegionRecord>,
}

/// Load and validate the region catalogue from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
pub fn load_regions(path: &Path) -> Result<RegionsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::CatalogueIo {
        path: path.display().to_string(),
        source: e,
    })?;

    let regions_file: RegionsFile =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::CatalogueParse {
            path: path.display().to_string(),
            source: e,
        })?;

    validate_regions(&regions_file)?;

    Ok(regions_file)
}

fn validate_regions(regions_file: &RegionsFile) -> Result<(), ConfigError> {
    let mut seen_codes = HashSet::new();

    for region in &regions_file.regions {
        let code = region.code.trim();
        if !(2..=4).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::Validation(format!(
                "region code '{}' must be 2-4 ASCII letters",
                region.code
            )));
        }

        if !seen_codes.insert(code.to_ascii_uppercase()) {
            return Err(ConfigError::Validation(format!(
                "duplicate region code: '{}'",
                region.code
            )));
        }

        if region.aliases.iter().any(|a| a.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "region '{}' has an empty alias",
                region.code
            )));
        }
    }

    for (token, code) in &regions_file.overrides {
        if token.trim().is_empty() {
            return Err(ConfigError::Validation(
                "region override token must be non-empty".to_string(),
            ));
        }
        if !seen_codes.contains(&code.trim().to_ascii_uppercase()) {
            return Err(ConfigError::Validation(format!(
                "region override '{token}' points at unknown code '{code}'"
            )));
        }
    }

    Ok(())
}
