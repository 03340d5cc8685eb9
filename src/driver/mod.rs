//! Graph drivers: the copy-on-write filesystem backends layers live in.
//!
//! The store only ever talks to a driver through [`GraphDriver`], addressing
//! backing stores by opaque cache IDs. Optional capabilities are discovered at
//! runtime through the `as_*` accessors, which default to `None`.

use std::{
    collections::HashMap,
    fmt,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use log::error;

use crate::{
    config::StoreConfig,
    error::Error,
    tar_split::{FileGetter, PathFileGetter},
};

pub mod vfs;

pub use vfs::VfsDriver;

/// Options for creating a backing store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOpts {
    /// Security label applied when the store is mounted.
    pub mount_label: String,
    /// Driver specific storage options.
    pub storage_opt: HashMap<String, String>,
}

/// A copy-on-write filesystem backend.
///
/// `remove` must succeed for IDs that do not exist, so that interrupted
/// deletions can be retried.
pub trait GraphDriver: Send + Sync {
    /// Short driver name, e.g. `vfs`.
    fn name(&self) -> &str;

    /// Create a read-only backing store, optionally on top of `parent`.
    fn create(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()>;

    /// Create a writable backing store, optionally on top of `parent`.
    fn create_read_write(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()>;

    /// Make the store available and return its root directory.
    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf>;

    /// Release a path obtained by [`get`](Self::get).
    fn put(&self, id: &str) -> Result<()>;

    fn remove(&self, id: &str) -> Result<()>;

    fn exists(&self, id: &str) -> bool;

    /// Extract a tar diff into `id`, returning the number of content bytes applied.
    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64>;

    /// Size of the changes `id` holds relative to `parent`.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64>;

    /// Low level details about a backing store.
    fn get_metadata(&self, id: &str) -> Result<HashMap<String, String>>;

    /// Human readable key/value status lines.
    fn status(&self) -> Vec<(String, String)>;

    /// Release driver wide resources.
    fn cleanup(&self) -> Result<()>;

    /// Every backing store the driver currently holds.
    fn cache_ids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Native access to layer content for tar reassembly.
    fn as_diff_getter(&self) -> Option<&dyn DiffGetter> {
        None
    }

    /// Support for re-attaching to stores mounted before a restart.
    fn as_live_restore(&self) -> Option<&dyn LiveRestore> {
        None
    }
}

impl fmt::Debug for dyn GraphDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphDriver")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Drivers that can serve layer content without a full mount.
pub trait DiffGetter {
    fn diff_getter(&self, id: &str) -> Result<Box<dyn FileGetter + '_>>;
}

/// Drivers that can adopt a store left mounted by a previous process.
pub trait LiveRestore {
    fn restore(&self, id: &str) -> Result<()>;
}

/// Serves files out of a mounted store, putting it back when dropped.
pub struct NaiveDiffGetter<'a> {
    driver: &'a dyn GraphDriver,
    id: String,
    files: PathFileGetter,
}

impl<'a> NaiveDiffGetter<'a> {
    pub fn new(driver: &'a dyn GraphDriver, id: &str) -> Result<Self> {
        let path = driver.get(id, "")?;
        Ok(NaiveDiffGetter {
            driver,
            id: id.to_string(),
            files: PathFileGetter::new(path),
        })
    }
}

impl FileGetter for NaiveDiffGetter<'_> {
    fn get(&mut self, name: &[u8]) -> io::Result<Box<dyn Read + '_>> {
        self.files.get(name)
    }
}

impl Drop for NaiveDiffGetter<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.driver.put(&self.id) {
            error!("Failed to put {} after reading its content: {err:#}", self.id);
        }
    }
}

/// File access for reassembling the diff of `id`, natively when the driver supports it.
pub fn diff_getter<'a>(driver: &'a dyn GraphDriver, id: &str) -> Result<Box<dyn FileGetter + 'a>> {
    match driver.as_diff_getter() {
        Some(native) => native.diff_getter(id),
        None => Ok(Box::new(NaiveDiffGetter::new(driver, id)?)),
    }
}

/// Instantiate the driver named in `config`.
pub fn from_config(config: &StoreConfig) -> crate::error::Result<Arc<dyn GraphDriver>> {
    let options = config.parsed_driver_options()?;
    match config.driver.as_str() {
        vfs::NAME => {
            let driver = VfsDriver::new(config.driver_root(), &options)
                .with_context(|| format!("initializing {} driver", vfs::NAME))
                .map_err(Error::Driver)?;
            Ok(Arc::new(driver))
        }
        other => Err(Error::UnknownDriver(other.to_string())),
    }
}

/// Sum of the sizes of all regular files below `path`.
pub(crate) fn tree_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += tree_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
