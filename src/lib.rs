//! A content-addressed, copy-on-write layer store for container images.
//!
//! Read-only layers are registered from tar diffs and identified by their
//! [`ChainId`]; read-write layers are named and stacked on top of them. The
//! filesystem work is delegated to a [`GraphDriver`], and the original tar
//! framing of every layer is kept so its diff can be exported byte for byte.

pub mod config;
pub mod digest;
pub mod driver;
pub mod error;
pub mod layer;
pub mod locker;
pub mod metadata;
pub mod mounted;
pub mod pipe;
pub mod store;
pub mod tar_split;
pub mod util;


pub use config::StoreConfig;
pub use digest::{ChainId, DiffId, Digest};
pub use driver::{CreateOpts, GraphDriver, VfsDriver};
pub use error::{Error, Result};
pub use layer::{Layer, LayerInfo, Metadata, TarStream, MAX_LAYER_DEPTH};
pub use mounted::{CreateRwLayerOpts, MountInit, RwLayer};
pub use store::LayerStore;
