//! The layer store: registration, reference counting and deletion of
//! read-only layers, and the lifecycle of read-write layers built on them.
//!
//! Two mutexes guard the in-memory state: one for the read-only layer graph
//! and one for the read-write layers. When both are needed they are taken in
//! that order. A name-keyed [`Locker`] serializes the multi-step operations on
//! a single read-write layer.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    io::{self, Read},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::Context;
use log::{debug, error, warn};
use oci_spec::image::Descriptor;

use crate::{
    config::StoreConfig,
    digest::{ChainId, DiffId, DigestReader},
    driver::{self, CreateOpts, GraphDriver},
    error::{Error, Result},
    layer::{self, Layer, LayerGraph, LayerInfo, Metadata, TarStream, MAX_LAYER_DEPTH},
    locker::Locker,
    metadata::{FileMetadataStore, Transaction},
    mounted::{validate_mount_name, CreateRwLayerOpts, MountedLayer, RwLayer},
    tar_split::{InputTarStream, JsonPacker},
    util::generate_random_id,
};

pub(crate) struct StoreInner {
    pub(crate) metadata: FileMetadataStore,
    pub(crate) driver: Arc<dyn GraphDriver>,
    layers: Mutex<LayerGraph>,
    mounts: Mutex<HashMap<String, MountedLayer>>,
    locker: Locker,
    next_handle: AtomicU64,
}

/// Content-addressed store of read-only layers and the read-write layers
/// stacked on them.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct LayerStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for LayerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStore")
            .field("root", &self.inner.metadata.root())
            .field("driver", &self.inner.driver.name())
            .finish()
    }
}

impl StoreInner {
    pub(crate) fn lock_layers(&self) -> MutexGuard<'_, LayerGraph> {
        self.layers.lock().expect("layer graph lock poisoned")
    }

    pub(crate) fn lock_mounts(&self) -> MutexGuard<'_, HashMap<String, MountedLayer>> {
        self.mounts.lock().expect("mounts lock poisoned")
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop one reference to `chain_id`, deleting every layer of the chain
    /// that ends up unreferenced. Returns the deleted layers, child first.
    fn release_layer(&self, graph: &mut LayerGraph, chain_id: &ChainId) -> Result<Vec<Metadata>> {
        let mut removed = Vec::new();
        let mut current = chain_id.clone();
        loop {
            let node = graph
                .layers
                .get_mut(&current)
                .unwrap_or_else(|| panic!("layer {current} missing from graph"));
            if node.reference_count == 0 {
                panic!("layer {current} not retained");
            }
            node.reference_count -= 1;
            if node.reference_count != 0 {
                return Ok(removed);
            }
            if !node.references.is_empty() {
                panic!("cannot delete referenced layer {current}");
            }

            // gone from the graph even if the deletion below fails
            let node = graph.layers.remove(&current).expect("layer vanished");
            match self.delete_layer(&node.info) {
                Ok(meta) => removed.push(meta),
                Err(err) => {
                    if let Some(parent) = node.info.parent() {
                        error!(
                            "Failed to delete layer {current}; parent {} keeps its reference \
                             until restart or cleanup",
                            parent.chain_id()
                        );
                    }
                    return Err(err);
                }
            }

            match &node.info.parent {
                Some(parent) => current = parent.chain_id().clone(),
                None => return Ok(removed),
            }
        }
    }

    fn delete_layer(&self, info: &LayerInfo) -> Result<Metadata> {
        // moved aside first so an interrupted deletion is found by cleanup
        let dir = self.metadata.rename_for_removal(info.chain_id())?;
        self.driver
            .remove(info.cache_id())
            .with_context(|| format!("removing layer {}", info.cache_id()))
            .map_err(Error::Driver)?;
        fs::remove_dir_all(&dir).map_err(Error::metadata(&dir))?;
        debug!("Deleted layer {} ({})", info.chain_id(), info.cache_id());
        Ok(Metadata::for_layer(info))
    }

    fn new_layer_handle(self: &Arc<Self>, graph: &mut LayerGraph, info: Arc<LayerInfo>) -> Layer {
        let handle = self.next_handle();
        graph.add_handle(info.chain_id(), handle);
        Layer {
            handle,
            info,
            store: Arc::clone(self),
        }
    }

    fn new_rw_handle(self: &Arc<Self>, mount: &mut MountedLayer) -> RwLayer {
        let handle = self.next_handle();
        mount.references.insert(handle, 0);
        RwLayer {
            handle,
            name: mount.name.clone(),
            store: Arc::clone(self),
        }
    }

    /// Stream `diff` into the backing store `cache_id`, recording its
    /// tar-split metadata in `tx`.
    fn apply_tar(
        &self,
        tx: &Transaction,
        diff: &mut dyn Read,
        parent: Option<&str>,
        cache_id: &str,
    ) -> Result<(DiffId, u64)> {
        let mut tar_split = tx.tar_split_writer(true)?;
        let mut digested = DigestReader::new(diff);
        let size = {
            let mut stream = InputTarStream::new(&mut digested, JsonPacker::new(&mut tar_split));
            let applied = self.driver.apply_diff(cache_id, parent, &mut stream);
            // the driver may stop at the end-of-archive marker; the rest
            // still belongs in the tar-split record and the digest
            let drained = io::copy(&mut stream, &mut io::sink());
            let size = applied
                .with_context(|| format!("applying diff to {cache_id}"))
                .map_err(Error::Driver)?;
            drained.map_err(Error::from_stream)?;
            size
        };
        tar_split.finish()?;

        let diff_id = DiffId::from(digested.digest());
        debug!("Applied tar {diff_id} to {cache_id}, size: {size}");
        Ok((diff_id, size))
    }
}

/// Releases a parent reference taken by an operation that did not complete.
struct ParentGuard<'a> {
    store: &'a StoreInner,
    chain_id: Option<ChainId>,
    /// The parent had no references before this one was taken.
    was_unreferenced: bool,
}

impl<'a> ParentGuard<'a> {
    /// Take a reference to `parent`, given back on drop unless disarmed.
    fn acquire(
        store: &'a StoreInner,
        parent: Option<&ChainId>,
    ) -> Result<(Option<Arc<LayerInfo>>, Self)> {
        let mut guard = ParentGuard {
            store,
            chain_id: None,
            was_unreferenced: false,
        };
        let Some(chain_id) = parent else {
            return Ok((None, guard));
        };
        let mut graph = store.lock_layers();
        let info = graph.acquire(chain_id).ok_or(Error::LayerDoesNotExist)?;
        guard.was_unreferenced = graph.layers[chain_id].reference_count == 1;
        guard.chain_id = Some(chain_id.clone());
        drop(graph);
        Ok((Some(info), guard))
    }

    fn disarm(&mut self) {
        self.chain_id = None;
    }
}

impl Drop for ParentGuard<'_> {
    fn drop(&mut self) {
        let Some(chain_id) = self.chain_id.take() else {
            return;
        };
        let mut graph = self.store.lock_layers();
        if self.was_unreferenced {
            // nobody held it, so nothing is deleted
            if let Some(node) = graph.layers.get_mut(&chain_id) {
                node.reference_count = node.reference_count.saturating_sub(1);
            }
        } else if let Err(err) = self.store.release_layer(&mut graph, &chain_id) {
            error!("Failed to release parent layer {chain_id}: {err}");
        }
    }
}

/// Undoes the side effects of a registration that did not complete.
struct RegisterRollback<'a> {
    store: &'a StoreInner,
    cache_id: String,
    tx: Option<Transaction>,
    armed: bool,
}

impl Drop for RegisterRollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Cleaning up cache layer {} after error", self.cache_id);
            if let Err(err) = self.store.driver.remove(&self.cache_id) {
                error!("Error cleaning up cache layer {}: {err:#}", self.cache_id);
            }
            if let Some(tx) = self.tx.take() {
                if let Err(err) = tx.cancel() {
                    error!("Error canceling metadata transaction for {}: {err}", self.cache_id);
                }
            }
        }
        self.store.lock_layers().pending.remove(&self.cache_id);
    }
}

/// Undoes the side effects of a read-write layer creation that did not complete.
struct MountRollback<'a> {
    store: &'a StoreInner,
    name: String,
    mount_id: String,
    init_id: String,
    armed: bool,
}

impl Drop for MountRollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            for id in [&self.mount_id, &self.init_id] {
                if let Err(err) = self.store.driver.remove(id) {
                    error!("Error cleaning up {id} for mount {}: {err:#}", self.name);
                }
            }
            if let Err(err) = self.store.metadata.remove_mount(&self.name) {
                error!("Error cleaning up metadata of mount {}: {err}", self.name);
            }
        }
        let mut graph = self.store.lock_layers();
        graph.pending.remove(&self.mount_id);
        graph.pending.remove(&self.init_id);
    }
}

fn load_layer(
    metadata: &FileMetadataStore,
    graph: &mut LayerGraph,
    chain_id: &ChainId,
) -> Result<Arc<LayerInfo>> {
    if let Some(node) = graph.layers.get(chain_id) {
        return Ok(Arc::clone(&node.info));
    }
    let diff_id = metadata.get_diff_id(chain_id)?;
    let diff_size = metadata.get_size(chain_id)?;
    let cache_id = metadata.get_cache_id(chain_id)?;
    let parent = match metadata.get_parent(chain_id)? {
        Some(parent) => Some(load_layer(metadata, graph, &parent)?),
        None => None,
    };
    let descriptor = metadata.get_descriptor(chain_id)?;

    let info = Arc::new(LayerInfo {
        chain_id: chain_id.clone(),
        diff_id,
        cache_id,
        diff_size,
        parent,
        descriptor,
    });
    graph.insert(Arc::clone(&info), 0);
    Ok(info)
}

fn load_mount(
    metadata: &FileMetadataStore,
    graph: &mut LayerGraph,
    name: &str,
) -> Result<MountedLayer> {
    let mount_id = metadata.get_mount_id(name)?;
    let init_id = metadata.get_init_id(name)?;
    let parent = match metadata.get_mount_parent(name)? {
        Some(chain_id) => {
            let info = load_layer(metadata, graph, &chain_id)?;
            graph.acquire(&chain_id);
            Some(info)
        }
        None => None,
    };
    Ok(MountedLayer {
        name: name.to_string(),
        mount_id,
        init_id,
        parent,
        references: HashMap::new(),
    })
}

impl LayerStore {
    /// Open the store whose metadata lives in `root`, on top of `driver`.
    ///
    /// Every persisted layer and read-write layer is loaded. Reference
    /// counts are rebuilt from the parent links: one per child layer and one
    /// per read-write layer. Records that cannot be loaded are skipped.
    pub fn open(root: impl AsRef<Path>, driver: Arc<dyn GraphDriver>) -> Result<Self> {
        let metadata = FileMetadataStore::new(root.as_ref())?;
        let (ids, mount_names) = metadata.list()?;

        let mut graph = LayerGraph::default();
        for id in &ids {
            match load_layer(&metadata, &mut graph, id) {
                Ok(info) => {
                    if let Some(parent) = info.parent() {
                        graph.acquire(parent.chain_id());
                    }
                }
                Err(err) => warn!("Failed to load layer {id}: {err}"),
            }
        }

        let mut mounts = HashMap::new();
        for name in mount_names {
            match load_mount(&metadata, &mut graph, &name) {
                Ok(mount) => {
                    mounts.insert(name, mount);
                }
                Err(err) => warn!("Failed to load mount {name}: {err}"),
            }
        }
        debug!(
            "Loaded {} layers and {} mounts from {}",
            graph.layers.len(),
            mounts.len(),
            root.as_ref().display()
        );

        Ok(LayerStore {
            inner: Arc::new(StoreInner {
                metadata,
                driver,
                layers: Mutex::new(graph),
                mounts: Mutex::new(mounts),
                locker: Locker::new(),
                next_handle: AtomicU64::new(1),
            }),
        })
    }

    /// Open the store described by `config`, creating the configured driver.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let driver = driver::from_config(config)?;
        Self::open(config.layerdb_root(), driver)
    }

    /// Register a layer from its uncompressed tar diff.
    ///
    /// Registering content that already exists under the same parent
    /// returns a new reference to the existing layer.
    pub fn register(&self, diff: impl Read, parent: Option<&ChainId>) -> Result<Layer> {
        self.register_with_descriptor(diff, parent, None)
    }

    /// Like [`register`](Self::register), also recording the descriptor the
    /// layer was distributed as.
    pub fn register_with_descriptor(
        &self,
        mut diff: impl Read,
        parent: Option<&ChainId>,
        descriptor: Option<Descriptor>,
    ) -> Result<Layer> {
        let inner = &self.inner;

        let (parent, mut parent_guard) = ParentGuard::acquire(inner, parent)?;
        if let Some(parent) = &parent {
            if parent.depth() >= MAX_LAYER_DEPTH {
                return Err(Error::MaxDepthExceeded);
            }
        }
        let parent_cache = parent.as_ref().map(|p| p.cache_id());

        let cache_id = generate_random_id();
        inner.lock_layers().pending.insert(cache_id.clone());
        let mut rollback = RegisterRollback {
            store: inner,
            cache_id: cache_id.clone(),
            tx: None,
            armed: true,
        };

        inner
            .driver
            .create(&cache_id, parent_cache, &CreateOpts::default())
            .with_context(|| format!("creating layer {cache_id}"))
            .map_err(Error::Driver)?;

        let tx = rollback.tx.insert(inner.metadata.start_transaction()?);
        let (diff_id, diff_size) = inner.apply_tar(tx, &mut diff, parent_cache, &cache_id)?;

        let chain_id = ChainId::for_layer(parent.as_ref().map(|p| p.chain_id()), &diff_id);
        tx.set_diff_id(&diff_id)?;
        tx.set_size(diff_size)?;
        tx.set_cache_id(&cache_id)?;
        if let Some(parent) = &parent {
            tx.set_parent(parent.chain_id())?;
        }
        if let Some(descriptor) = &descriptor {
            tx.set_descriptor(descriptor)?;
        }

        let mut graph = inner.lock_layers();
        if let Some(existing) = graph.acquire(&chain_id) {
            // the duplicate's store, transaction and parent reference are
            // undone by the guards
            debug!("Layer {chain_id} already exists, discarding {cache_id}");
            return Ok(inner.new_layer_handle(&mut graph, existing));
        }

        if let Some(tx) = rollback.tx.take() {
            tx.commit(&chain_id)?;
        }
        let info = Arc::new(LayerInfo {
            chain_id,
            diff_id,
            cache_id,
            diff_size,
            parent,
            descriptor,
        });
        graph.insert(Arc::clone(&info), 1);
        rollback.armed = false;
        parent_guard.disarm();
        Ok(inner.new_layer_handle(&mut graph, info))
    }

    /// Take a new reference to a registered layer.
    pub fn get(&self, chain_id: &ChainId) -> Result<Layer> {
        let mut graph = self.inner.lock_layers();
        let info = graph.acquire(chain_id).ok_or(Error::LayerDoesNotExist)?;
        Ok(self.inner.new_layer_handle(&mut graph, info))
    }

    /// Export the diff of `chain_id` without taking a reference.
    ///
    /// Meant for processes that own no reference to the layer; the stream
    /// fails if the layer is deleted while it is being read.
    pub fn tar_stream(&self, chain_id: &ChainId) -> Result<TarStream> {
        let info = {
            let graph = self.inner.lock_layers();
            let node = graph.layers.get(chain_id).ok_or(Error::LayerDoesNotExist)?;
            Arc::clone(&node.info)
        };
        layer::open_tar_stream(&self.inner, &info)
    }

    /// Give back a reference, deleting every layer of the chain that is no
    /// longer referenced. Returns the deleted layers, child first.
    pub fn release(&self, layer: Layer) -> Result<Vec<Metadata>> {
        let mut graph = self.inner.lock_layers();
        let Some(node) = graph.layers.get_mut(layer.chain_id()) else {
            return Ok(Vec::new());
        };
        if !Arc::ptr_eq(&layer.store, &self.inner) || !node.references.remove(&layer.handle) {
            return Err(Error::LayerNotRetained);
        }
        self.inner.release_layer(&mut graph, layer.chain_id())
    }

    /// Snapshot of every registered layer.
    pub fn map(&self) -> BTreeMap<ChainId, Arc<LayerInfo>> {
        let graph = self.inner.lock_layers();
        graph
            .layers
            .iter()
            .map(|(id, node)| (id.clone(), Arc::clone(&node.info)))
            .collect()
    }

    /// Snapshot of the reference count of every registered layer.
    pub fn reference_counts(&self) -> BTreeMap<ChainId, usize> {
        let graph = self.inner.lock_layers();
        graph
            .layers
            .iter()
            .map(|(id, node)| (id.clone(), node.reference_count))
            .collect()
    }

    /// Create a read-write layer called `name` on top of `parent`.
    pub fn create_rw_layer(
        &self,
        name: &str,
        parent: Option<&ChainId>,
        opts: CreateRwLayerOpts,
    ) -> Result<RwLayer> {
        validate_mount_name(name)?;
        let inner = &self.inner;
        let _name_lock = inner.locker.lock(name);

        if inner.lock_mounts().contains_key(name) {
            return Err(Error::MountNameConflict);
        }

        let (parent, mut parent_guard) = ParentGuard::acquire(inner, parent)?;
        let mut lower = parent.as_ref().map(|p| p.cache_id().to_string());

        let mount_id = generate_random_id();
        // fixed name some drivers rely on
        let init_id = format!("{mount_id}-init");
        {
            let mut graph = inner.lock_layers();
            graph.pending.insert(mount_id.clone());
            graph.pending.insert(init_id.clone());
        }
        let mut rollback = MountRollback {
            store: inner,
            name: name.to_string(),
            mount_id: mount_id.clone(),
            init_id: init_id.clone(),
            armed: true,
        };

        let mut has_init = false;
        if let Some(init_func) = opts.init_func {
            let create_opts = CreateOpts {
                mount_label: opts.mount_label.clone(),
                storage_opt: opts.storage_opt.clone(),
            };
            self.init_mount(&init_id, lower.as_deref(), &create_opts, init_func)?;
            lower = Some(init_id.clone());
            has_init = true;
        }

        let create_opts = CreateOpts {
            mount_label: String::new(),
            storage_opt: opts.storage_opt,
        };
        inner
            .driver
            .create_read_write(&mount_id, lower.as_deref(), &create_opts)
            .with_context(|| format!("creating read-write layer {name}"))
            .map_err(Error::Driver)?;

        inner.metadata.set_mount_id(name, &mount_id)?;
        if has_init {
            inner.metadata.set_init_id(name, &init_id)?;
        }
        if let Some(parent) = &parent {
            inner.metadata.set_mount_parent(name, parent.chain_id())?;
        }

        let mut mount = MountedLayer {
            name: name.to_string(),
            mount_id,
            init_id: has_init.then_some(init_id),
            parent,
            references: HashMap::new(),
        };
        let handle = inner.new_rw_handle(&mut mount);
        inner.lock_mounts().insert(name.to_string(), mount);

        rollback.armed = false;
        parent_guard.disarm();
        debug!("Created read-write layer {name}");
        Ok(handle)
    }

    fn init_mount(
        &self,
        init_id: &str,
        parent: Option<&str>,
        opts: &CreateOpts,
        init_func: crate::mounted::MountInit,
    ) -> Result<()> {
        let driver = &self.inner.driver;
        driver
            .create_read_write(init_id, parent, opts)
            .with_context(|| format!("creating init layer {init_id}"))
            .map_err(Error::Driver)?;
        let path = driver.get(init_id, "").map_err(Error::Driver)?;

        if let Err(err) = init_func(&path) {
            if let Err(put_err) = driver.put(init_id) {
                error!("Failed to put init layer {init_id}: {put_err:#}");
            }
            return Err(Error::Driver(err.context(format!("initializing {init_id}"))));
        }
        driver.put(init_id).map_err(Error::Driver)
    }

    /// Take a new reference to the read-write layer `name`.
    pub fn get_rw_layer(&self, name: &str) -> Result<RwLayer> {
        let _name_lock = self.inner.locker.lock(name);
        let mut mounts = self.inner.lock_mounts();
        let mount = mounts.get_mut(name).ok_or(Error::MountDoesNotExist)?;
        Ok(self.inner.new_rw_handle(mount))
    }

    /// The driver ID of the writable store of `name`.
    pub fn get_mount_id(&self, name: &str) -> Result<String> {
        let mounts = self.inner.lock_mounts();
        let mount = mounts.get(name).ok_or(Error::MountDoesNotExist)?;
        debug!("Mount ID of {name}: {}", mount.mount_id);
        Ok(mount.mount_id.clone())
    }

    /// Give back a read-write layer reference.
    ///
    /// Once no references remain the writable and init stores and the
    /// metadata are removed, and the parent chain is released. If removing a
    /// store fails the reference is kept, so the call can be retried with the
    /// same handle.
    pub fn release_rw_layer(&self, layer: &RwLayer) -> Result<Vec<Metadata>> {
        let inner = &self.inner;
        let name = layer.name();
        let _name_lock = inner.locker.lock(name);

        let (mount_count, mount_id, init_id) = {
            let mut mounts = inner.lock_mounts();
            let Some(mount) = mounts.get_mut(name) else {
                return Ok(Vec::new());
            };
            if !Arc::ptr_eq(&layer.store, inner) {
                return Err(Error::LayerNotRetained);
            }
            let mount_count = mount
                .references
                .remove(&layer.handle)
                .ok_or(Error::LayerNotRetained)?;
            if !mount.references.is_empty() {
                return Ok(Vec::new());
            }
            (mount_count, mount.mount_id.clone(), mount.init_id.clone())
        };

        let retake = |err: Error| {
            error!("Error releasing read-write layer {name}: {err}");
            if let Some(mount) = inner.lock_mounts().get_mut(name) {
                mount.references.insert(layer.handle, mount_count);
            }
            err
        };

        inner
            .driver
            .remove(&mount_id)
            .with_context(|| format!("removing read-write layer {name}"))
            .map_err(|e| retake(Error::Driver(e)))?;
        if let Some(init_id) = &init_id {
            inner
                .driver
                .remove(init_id)
                .with_context(|| format!("removing init layer of {name}"))
                .map_err(|e| retake(Error::Driver(e)))?;
        }
        inner.metadata.remove_mount(name).map_err(retake)?;

        let mount = inner.lock_mounts().remove(name);
        debug!("Released read-write layer {name}");
        let mut graph = inner.lock_layers();
        match mount.and_then(|m| m.parent) {
            Some(parent) => inner.release_layer(&mut graph, parent.chain_id()),
            None => Ok(Vec::new()),
        }
    }

    /// Re-attach a read-write layer whose store was left mounted by a
    /// previous process. Does nothing for drivers without live restore.
    pub fn live_restore(&self, layer: &RwLayer) -> Result<()> {
        let Some(restorer) = self.inner.driver.as_live_restore() else {
            return Ok(());
        };
        let mount_id = layer.mount_id()?;
        restorer
            .restore(&mount_id)
            .with_context(|| format!("restoring {}", layer.name()))
            .map_err(Error::Driver)?;
        let mut mounts = self.inner.lock_mounts();
        if let Some(count) = mounts
            .get_mut(layer.name())
            .and_then(|m| m.references.get_mut(&layer.handle))
        {
            *count = (*count).max(1);
        }
        Ok(())
    }

    /// Finish interrupted layer deletions and remove driver stores that no
    /// layer or read-write layer refers to, then let the driver clean up.
    ///
    /// Failures on individual stores are logged and skipped.
    pub fn cleanup(&self) -> Result<()> {
        let inner = &self.inner;

        match inner.metadata.orphans() {
            Ok(orphans) => {
                if !orphans.is_empty() {
                    debug!("Found {} orphan layers", orphans.len());
                }
                for orphan in orphans {
                    debug!(
                        "Removing orphan layer {} (cache id {})",
                        orphan.chain_id, orphan.cache_id
                    );
                    if let Err(err) = inner.driver.remove(&orphan.cache_id) {
                        error!("Cannot remove orphan layer {}: {err:#}", orphan.cache_id);
                        continue;
                    }
                    if let Err(err) = inner.metadata.remove(&orphan.chain_id, &orphan.cache_id) {
                        error!("Cannot remove orphan layer metadata {}: {err}", orphan.chain_id);
                    }
                }
            }
            Err(err) => error!("Cannot get orphan layers: {err}"),
        }

        // listed before the snapshot, so stores created after it are never seen
        match inner.driver.cache_ids() {
            Ok(cache_ids) => {
                let referenced: HashSet<String> = {
                    let graph = inner.lock_layers();
                    let mounts = inner.lock_mounts();
                    graph
                        .layers
                        .values()
                        .map(|node| node.info.cache_id().to_string())
                        .chain(graph.pending.iter().cloned())
                        .chain(mounts.values().flat_map(|m| {
                            std::iter::once(m.mount_id.clone()).chain(m.init_id.clone())
                        }))
                        .collect()
                };
                for id in cache_ids.iter().filter(|id| !referenced.contains(*id)) {
                    debug!("Removing unreferenced driver store {id}");
                    if let Err(err) = inner.driver.remove(id) {
                        error!("Cannot remove unreferenced driver store {id}: {err:#}");
                    }
                }
            }
            Err(err) => error!("Cannot list driver stores: {err:#}"),
        }

        inner
            .driver
            .cleanup()
            .context("driver cleanup")
            .map_err(Error::Driver)
    }

    pub fn driver_status(&self) -> Vec<(String, String)> {
        self.inner.driver.status()
    }

    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    /// Names of all read-write layers.
    pub fn mount_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock_mounts().keys().cloned().collect();
        names.sort();
        names
    }
}
