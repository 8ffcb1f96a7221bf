//! Product catalogue: the pricing pages to scrape and how to read them.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rendering {
    #[default]
    Static,
    Dynamic,
}

impl std::fmt::Display for Rendering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rendering::Static => write!(f, "static"),
            Rendering::Dynamic => write!(f, "dynamic"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchMechanism {
    #[default]
    None,
    Dropdown,
    Button,
    UrlParam,
    Proxy,
}

impl SwitchMechanism {
    /// Whether switching regions requires clicking through the rendered page.
    #[must_use]
    pub fn is_in_page(self) -> bool {
        matches!(self, SwitchMechanism::Dropdown | SwitchMechanism::Button)
    }
}

impl std::fmt::Display for SwitchMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchMechanism::None => write!(f, "none"),
            SwitchMechanism::Dropdown => write!(f, "dropdown"),
            SwitchMechanism::Button => write!(f, "button"),
            SwitchMechanism::UrlParam => write!(f, "url-param"),
            SwitchMechanism::Proxy => write!(f, "proxy"),
        }
    }
}

/// Candidate CSS selectors per field, tried in order.
///
/// Each field accepts either a single selector string or a list in YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub price: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub currency: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub period: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub plan_name: Vec<String>,
    /// Container(s) holding the pricing card; narrows the pattern fallback.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub section: Vec<String>,
}

impl SelectorSet {
    /// A set containing only a price selector.
    #[must_use]
    pub fn price_only(selector: impl Into<String>) -> Self {
        Self {
            price: vec![selector.into()],
            ..Self::default()
        }
    }

    /// Put newly found selectors ahead of the existing candidates, field by
    /// field. Fields `found` leaves empty are untouched; duplicates are
    /// dropped. Returns whether anything changed.
    pub fn prepend(&mut self, found: &SelectorSet) -> bool {
        let before = self.clone();
        for (mine, theirs) in [
            (&mut self.price, &found.price),
            (&mut self.currency, &found.currency),
            (&mut self.period, &found.period),
            (&mut self.plan_name, &found.plan_name),
            (&mut self.section, &found.section),
        ] {
            if theirs.is_empty() {
                continue;
            }
            let mut merged = theirs.clone();
            merged.extend(mine.drain(..).filter(|s| !theirs.contains(s)));
            *mine = merged;
        }
        *self != before
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSwitch {
    #[serde(default)]
    pub mechanism: SwitchMechanism,
    /// Locator of the region switcher control, for in-page mechanisms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    /// URL (absolute, relative, or a `?`/`&` query fragment) containing
    /// `{REGION}` or `{{REGION}}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub rendering: Rendering,
    /// Plan whose price is tracked, e.g. `"Plus"`. Used as the plan-name
    /// default and as the hint for locating the pricing section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub selectors: SelectorSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_switch: Option<RegionSwitch>,
}

impl ProductConfig {
    /// Minimal product definition, used by the one-off URL command and tests.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, selectors: SelectorSet) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            rendering: Rendering::Static,
            plan: None,
            selectors,
            region_switch: None,
        }
    }

    #[must_use]
    pub fn mechanism(&self) -> SwitchMechanism {
        self.region_switch
            .as_ref()
            .map_or(SwitchMechanism::None, |rs| rs.mechanism)
    }

    /// Region tokens to scrape; empty means one scrape without geo-targeting.
    #[must_use]
    pub fn region_tokens(&self) -> &[String] {
        self.region_switch
            .as_ref()
            .map_or(&[][..], |rs| rs.regions.as_slice())
    }

    /// No price selector yet; selector discovery has to run first.
    #[must_use]
    pub fn needs_discovery(&self) -> bool {
        self.selectors.price.is_empty()
    }

    /// Generate a filesystem-safe slug from the product name.
    #[must_use]
    pub fn slug(&self) -> String {
        self.name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProductsFile {
    pub products: Vec<ProductConfig>,
}

impl ProductsFile {
    /// Product by name, ignoring case.
    pub fn product_mut(&mut self, name: &str) -> Option<&mut ProductConfig> {
        self.products
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    }
    .into_iter()
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty())
    .collect())
}

/// Load and validate the product catalogue from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
pub fn load_products(path: &Path) -> Result<ProductsFile, ConfigError> {
    let products_file = read_products(path)?;
    validate_catalogue(&products_file, validate_product)?;
    Ok(products_file)
}

/// Load the catalogue for selector discovery: products may still lack a
/// price selector, everything else is validated as usual.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
pub fn load_products_for_discovery(path: &Path) -> Result<ProductsFile, ConfigError> {
    let products_file = read_products(path)?;
    validate_catalogue(&products_file, validate_product_page)?;
    Ok(products_file)
}

fn read_products(path: &Path) -> Result<ProductsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::CatalogueIo {
        path: path.display().to_string(),
        source: e,
    })?;

    serde_yaml::from_str(&content).map_err(|e| ConfigError::CatalogueParse {
        path: path.display().to_string(),
        source: e,
    })
}

/// Write the catalogue back as YAML, replacing `path` only once the new
/// content is fully on disk. Comments in the old file are not kept.
///
/// # Errors
///
/// Returns [`ConfigError::CatalogueSerialize`] or [`ConfigError::CatalogueIo`].
pub fn save_products(path: &Path, products_file: &ProductsFile) -> Result<(), ConfigError> {
    let yaml = serde_yaml::to_string(products_file).map_err(|e| ConfigError::CatalogueSerialize {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = std::path::PathBuf::from(staging);
    std::fs::write(&staging, yaml)
        .and_then(|()| std::fs::rename(&staging, path))
        .map_err(|e| ConfigError::CatalogueIo {
            path: path.display().to_string(),
            source: e,
        })
}

/// Store discovered selectors for `product_name` in the catalogue at `path`.
///
/// Found selectors go ahead of the configured ones. The file is only
/// rewritten when something changed. Returns the updated product.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] if no product has that name or the
/// result is still not scrapable, plus any load or save error.
pub fn update_product_selectors(
    path: &Path,
    product_name: &str,
    found: &SelectorSet,
) -> Result<ProductConfig, ConfigError> {
    let mut products_file = load_products_for_discovery(path)?;
    let product = products_file.product_mut(product_name).ok_or_else(|| {
        ConfigError::Validation(format!("no product named '{product_name}' in the catalogue"))
    })?;

    let changed = product.selectors.prepend(found);
    validate_product(product)?;
    let updated = product.clone();

    if changed {
        save_products(path, &products_file)?;
    }
    Ok(updated)
}

fn validate_catalogue(
    products_file: &ProductsFile,
    validate: fn(&ProductConfig) -> Result<(), ConfigError>,
) -> Result<(), ConfigError> {
    let mut seen_names = HashSet::new();

    for product in &products_file.products {
        validate(product)?;

        if !seen_names.insert(product.name.to_lowercase()) {
            return Err(ConfigError::Validation(format!(
                "duplicate product name: '{}'",
                product.name
            )));
        }
    }

    Ok(())
}

/// Validate a single product definition.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] describing the first problem found.
pub fn validate_product(product: &ProductConfig) -> Result<(), ConfigError> {
    validate_product_page(product)?;

    if product.needs_discovery() {
        return Err(ConfigError::Validation(format!(
            "product '{}' has no price selector (run discover-selectors to find one)",
            product.name
        )));
    }

    Ok(())
}

fn validate_product_page(product: &ProductConfig) -> Result<(), ConfigError> {
    if product.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "product name must be non-empty".to_string(),
        ));
    }

    if !(product.url.starts_with("http://") || product.url.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "product '{}' has invalid url '{}'; must start with http:// or https://",
            product.name, product.url
        )));
    }

    if let Some(rs) = &product.region_switch {
        if rs.mechanism == SwitchMechanism::UrlParam && rs.url_template.is_none() {
            return Err(ConfigError::Validation(format!(
                "product '{}' uses url-param region switching but has no url_template",
                product.name
            )));
        }

        if rs.mechanism.is_in_page() && rs.selector.is_none() {
            return Err(ConfigError::Validation(format!(
                "product '{}' uses {} region switching but has no switcher selector",
                product.name, rs.mechanism
            )));
        }

        if rs.regions.iter().any(|r| r.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "product '{}' lists an empty region token",
                product.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "catalog_test.rs"]
mod tests;
