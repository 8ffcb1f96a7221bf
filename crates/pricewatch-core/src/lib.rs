pub mod app_config;
pub mod catalog;
pub mod config;
pub mod observation;
pub mod regions;

pub use app_config::{AppConfig, Environment, ProxySettings};
pub use catalog::{
    load_products, load_products_for_discovery, save_products, update_product_selectors,
    ProductConfig, ProductsFile, RegionSwitch, Rendering, SelectorSet, SwitchMechanism,
};
pub use config::{load_app_config, load_app_config_from_env};
pub use observation::{ExtractionTier, FetchTier, ObservationTarget, PriceObservation};
pub use regions::{load_regions, RegionRecord, RegionsFile};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },

    #[error("failed to read catalogue file {path}: {source}")]
    CatalogueIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalogue file {path}: {source}")]
    CatalogueParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to serialize catalogue for {path}: {source}")]
    CatalogueSerialize {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("catalogue validation failed: {0}")]
    Validation(String),
}
