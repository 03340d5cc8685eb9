//! Error types for the layer store.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, Error>`.
//!
//! # Error Categories
//!
//! - **Not found**: [`LayerDoesNotExist`], [`MountDoesNotExist`]
//! - **Caller logic**: [`MountNameConflict`], [`MaxDepthExceeded`],
//!   [`LayerNotRetained`], [`NotMounted`], [`InvalidMountName`], [`InvalidDigest`],
//!   [`InvalidDriverOption`]
//! - **Backend failures**: [`Driver`], [`Metadata`], [`TarSplit`], [`Io`]
//!
//! Reference-count corruption is not represented here: it indicates the
//! in-memory graph is already inconsistent and panics instead.
//!
//! [`LayerDoesNotExist`]: Error::LayerDoesNotExist
//! [`MountDoesNotExist`]: Error::MountDoesNotExist
//! [`MountNameConflict`]: Error::MountNameConflict
//! [`MaxDepthExceeded`]: Error::MaxDepthExceeded
//! [`LayerNotRetained`]: Error::LayerNotRetained
//! [`NotMounted`]: Error::NotMounted
//! [`InvalidMountName`]: Error::InvalidMountName
//! [`InvalidDigest`]: Error::InvalidDigest
//! [`InvalidDriverOption`]: Error::InvalidDriverOption
//! [`Driver`]: Error::Driver
//! [`Metadata`]: Error::Metadata
//! [`TarSplit`]: Error::TarSplit
//! [`Io`]: Error::Io

use std::path::PathBuf;

/// Result type alias for layer store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for layer store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested read-only layer is not registered.
    #[error("layer does not exist")]
    LayerDoesNotExist,

    /// The requested read-write layer is not registered.
    #[error("mount does not exist")]
    MountDoesNotExist,

    /// A read-write layer with this name already exists.
    #[error("mount already exists with name")]
    MountNameConflict,

    /// Registering the layer would exceed the maximum chain depth.
    #[error("max depth exceeded")]
    MaxDepthExceeded,

    /// The handle being released is not held against this layer.
    #[error("layer not retained")]
    LayerNotRetained,

    /// Unmount was called on a handle with no active mount.
    #[error("layer is not mounted")]
    NotMounted,

    /// Mount names are used as directory names and must be a single component.
    #[error("invalid mount name {0:?}")]
    InvalidMountName(String),

    /// A digest string could not be parsed.
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    /// The configured graph driver is not available.
    #[error("unknown graph driver {0:?}")]
    UnknownDriver(String),

    /// A driver option is not of the form `key=value`.
    #[error("invalid driver option {0:?}")]
    InvalidDriverOption(String),

    /// The graph driver failed.
    #[error("graph driver: {0:#}")]
    Driver(anyhow::Error),

    /// Reading or writing a metadata record failed.
    #[error("metadata {}: {source}", path.display())]
    Metadata {
        /// The record that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Tar-split metadata was malformed or did not match the layer content.
    #[error("tar-split: {0}")]
    TarSplit(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Wrap a metadata I/O failure with the path of the record involved.
    pub(crate) fn metadata(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Metadata { path, source }
    }

    /// Convert an I/O error produced while streaming tar data, unwrapping
    /// tar-split failures that were tunnelled through `io::Error`.
    pub(crate) fn from_stream(err: std::io::Error) -> Error {
        if err.get_ref().is_some_and(|e| e.is::<crate::tar_split::TarSplitError>()) {
            let inner = err.into_inner().map(|e| e.to_string()).unwrap_or_default();
            Error::TarSplit(inner)
        } else {
            Error::Io(err)
        }
    }
}
