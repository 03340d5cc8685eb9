//! Read-write layers: named writable layers on top of a read-only chain.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use log::error;

use crate::{
    digest::ChainId,
    error::{Error, Result},
    layer::LayerInfo,
    store::StoreInner,
};

/// Callback that seeds the init layer of a new read-write layer.
pub type MountInit = Box<dyn FnOnce(&Path) -> anyhow::Result<()> + Send>;

/// Options for [`LayerStore::create_rw_layer`](crate::LayerStore::create_rw_layer).
#[derive(Default)]
pub struct CreateRwLayerOpts {
    pub mount_label: String,
    pub storage_opt: HashMap<String, String>,
    /// When set, an init layer is created between the parent and the
    /// writable layer, and this runs against its root.
    pub init_func: Option<MountInit>,
}

impl fmt::Debug for CreateRwLayerOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateRwLayerOpts")
            .field("mount_label", &self.mount_label)
            .field("storage_opt", &self.storage_opt)
            .field("init_func", &self.init_func.is_some())
            .finish()
    }
}

/// A registered read-write layer.
///
/// `references` maps each live handle to the number of times that handle
/// currently has the layer mounted.
#[derive(Debug)]
pub(crate) struct MountedLayer {
    pub(crate) name: String,
    pub(crate) mount_id: String,
    pub(crate) init_id: Option<String>,
    pub(crate) parent: Option<Arc<LayerInfo>>,
    pub(crate) references: HashMap<u64, usize>,
}

impl MountedLayer {
    /// The store the writable layer is created on top of.
    pub(crate) fn lower_id(&self) -> Option<&str> {
        self.init_id
            .as_deref()
            .or_else(|| self.parent.as_deref().map(LayerInfo::cache_id))
    }
}

/// Mount names end up as directory names.
pub(crate) fn validate_mount_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(Error::InvalidMountName(name.to_string()));
    }
    Ok(())
}

/// A reference to a read-write layer.
///
/// Stays valid until passed to
/// [`LayerStore::release_rw_layer`](crate::LayerStore::release_rw_layer).
pub struct RwLayer {
    pub(crate) handle: u64,
    pub(crate) name: String,
    pub(crate) store: Arc<StoreInner>,
}

impl fmt::Debug for RwLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLayer")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .finish()
    }
}

impl RwLayer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` against the mounted layer this handle refers to.
    fn with_mount<T>(&self, f: impl FnOnce(&mut MountedLayer) -> Result<T>) -> Result<T> {
        let mut mounts = self.store.lock_mounts();
        let mount = mounts.get_mut(&self.name).ok_or(Error::MountDoesNotExist)?;
        if !mount.references.contains_key(&self.handle) {
            return Err(Error::LayerNotRetained);
        }
        f(mount)
    }

    pub fn mount_id(&self) -> Result<String> {
        self.with_mount(|m| Ok(m.mount_id.clone()))
    }

    pub fn parent(&self) -> Result<Option<ChainId>> {
        self.with_mount(|m| Ok(m.parent.as_ref().map(|p| p.chain_id().clone())))
    }

    /// Mount the layer and return the path of its root.
    ///
    /// Mounts nest: each call must be matched by an [`unmount`](Self::unmount).
    pub fn mount(&self, mount_label: &str) -> Result<PathBuf> {
        let mount_id = self.mount_id()?;
        let path = self
            .store
            .driver
            .get(&mount_id, mount_label)
            .with_context(|| format!("mounting {}", self.name))
            .map_err(Error::Driver)?;
        let counted = self.with_mount(|m| {
            *m.references.entry(self.handle).or_default() += 1;
            Ok(())
        });
        if let Err(err) = counted {
            // released while we were mounting
            if let Err(put_err) = self.store.driver.put(&mount_id) {
                error!("Failed to put {mount_id} of {}: {put_err:#}", self.name);
            }
            return Err(err);
        }
        Ok(path)
    }

    /// Undo one [`mount`](Self::mount) made through this handle.
    pub fn unmount(&self) -> Result<()> {
        let mount_id = self.with_mount(|m| {
            let count = m.references.get_mut(&self.handle).ok_or(Error::LayerNotRetained)?;
            if *count == 0 {
                return Err(Error::NotMounted);
            }
            *count -= 1;
            Ok(m.mount_id.clone())
        })?;
        if let Err(err) = self.store.driver.put(&mount_id) {
            let recounted = self.with_mount(|m| {
                *m.references.entry(self.handle).or_default() += 1;
                Ok(())
            });
            if let Err(count_err) = recounted {
                error!("Failed to restore mount count of {}: {count_err}", self.name);
            }
            return Err(Error::Driver(err.context(format!("unmounting {}", self.name))));
        }
        Ok(())
    }

    /// Driver specific details of the writable backing store.
    pub fn metadata(&self) -> Result<HashMap<String, String>> {
        let mount_id = self.mount_id()?;
        self.store
            .driver
            .get_metadata(&mount_id)
            .map_err(Error::Driver)
    }

    /// Size of the changes made in the writable layer.
    pub fn size(&self) -> Result<u64> {
        let (mount_id, lower) =
            self.with_mount(|m| Ok((m.mount_id.clone(), m.lower_id().map(str::to_string))))?;
        self.store
            .driver
            .diff_size(&mount_id, lower.as_deref())
            .map_err(Error::Driver)
    }

    /// Number of active mounts made through this handle.
    pub fn mount_count(&self) -> Result<usize> {
        self.with_mount(|m| Ok(m.references[&self.handle]))
    }
}
