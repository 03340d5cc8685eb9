//! Store configuration.
//!
//! A store is described by a small TOML file:
//!
//! ```toml
//! root = "/var/lib/layerstore"
//! driver = "vfs"
//! driver_options = ["key=value"]
//! ```
//!
//! Layer metadata lives under `<root>/image/<driver>/layerdb` and the driver
//! keeps its backing stores under `<root>/<driver>`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_driver() -> String {
    "vfs".to_string()
}

/// Layer store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Root directory for all store state.
    pub root: PathBuf,

    /// Graph driver name.
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Driver specific `key=value` options.
    #[serde(default)]
    pub driver_options: Vec<String>,
}

impl StoreConfig {
    /// A default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            driver: default_driver(),
            driver_options: Vec::new(),
        }
    }

    /// Parse a configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(Error::metadata(path))?;
        Self::from_toml(&content)
    }

    /// Directory holding layer and mount metadata.
    pub fn layerdb_root(&self) -> PathBuf {
        self.root.join("image").join(&self.driver).join("layerdb")
    }

    /// Directory the graph driver keeps its backing stores in.
    pub fn driver_root(&self) -> PathBuf {
        self.root.join(&self.driver)
    }

    /// Driver options split into key and value.
    pub fn parsed_driver_options(&self) -> Result<Vec<(String, String)>> {
        self.driver_options
            .iter()
            .map(|opt| match opt.split_once('=') {
                Some((key, value)) => Ok((key.trim().to_string(), value.trim().to_string())),
                None => Err(Error::InvalidDriverOption(opt.clone())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = StoreConfig::from_toml(r#"root = "/var/lib/layerstore""#).unwrap();
        assert_eq!(config, StoreConfig::new("/var/lib/layerstore"));
        assert_eq!(
            config.layerdb_root(),
            PathBuf::from("/var/lib/layerstore/image/vfs/layerdb")
        );
        assert_eq!(config.driver_root(), PathBuf::from("/var/lib/layerstore/vfs"));
    }

    #[test]
    fn test_parse_options() {
        let config = StoreConfig::from_toml(
            r#"
root = "/srv/layers"
driver = "vfs"
driver_options = ["copy = true"]
"#,
        )
        .unwrap();
        assert_eq!(
            config.parsed_driver_options().unwrap(),
            vec![("copy".to_string(), "true".to_string())]
        );

        let bad = StoreConfig {
            driver_options: vec!["novalue".to_string()],
            ..config
        };
        assert!(matches!(
            bad.parsed_driver_options(),
            Err(Error::InvalidDriverOption(opt)) if opt == "novalue"
        ));
    }

    #[test]
    fn test_missing_root() {
        assert!(matches!(
            StoreConfig::from_toml(r#"driver = "vfs""#),
            Err(Error::Config(_))
        ));
    }
}
