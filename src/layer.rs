//! Read-only layers: the graph nodes and the handles callers hold.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    io::{self, BufRead, ErrorKind, Read, Write},
    sync::Arc,
    thread,
};

use log::debug;
use oci_spec::image::Descriptor;

use crate::{
    digest::{ChainId, DiffId, Digester},
    driver::{self, GraphDriver},
    error::{Error, Result},
    pipe::{pipe, PipeReader},
    store::StoreInner,
    tar_split::{write_output_tar_stream, JsonUnpacker},
};

/// Longest permitted chain of read-only layers.
pub const MAX_LAYER_DEPTH: usize = 125;

/// Immutable description of a registered read-only layer.
#[derive(Debug)]
pub struct LayerInfo {
    pub(crate) chain_id: ChainId,
    pub(crate) diff_id: DiffId,
    pub(crate) cache_id: String,
    pub(crate) diff_size: u64,
    pub(crate) parent: Option<Arc<LayerInfo>>,
    pub(crate) descriptor: Option<Descriptor>,
}

impl LayerInfo {
    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn diff_id(&self) -> &DiffId {
        &self.diff_id
    }

    /// The driver's handle for this layer's backing store.
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    /// Size of this layer's own diff.
    pub fn diff_size(&self) -> u64 {
        self.diff_size
    }

    /// Size of this layer and all its ancestors.
    pub fn size(&self) -> u64 {
        let mut size = self.diff_size;
        let mut parent = self.parent.as_deref();
        while let Some(layer) = parent {
            size += layer.diff_size;
            parent = layer.parent.as_deref();
        }
        size
    }

    /// Number of layers in the chain ending here, counting this one.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut parent = self.parent.as_deref();
        while let Some(layer) = parent {
            depth += 1;
            parent = layer.parent.as_deref();
        }
        depth
    }

    pub fn parent(&self) -> Option<&LayerInfo> {
        self.parent.as_deref()
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }
}

/// A node of the layer graph.
///
/// `reference_count` counts live handles plus one per child layer or
/// read-write layer built on top of this one. `references` holds the IDs of
/// the live handles.
#[derive(Debug)]
pub(crate) struct RoLayer {
    pub(crate) info: Arc<LayerInfo>,
    pub(crate) reference_count: usize,
    pub(crate) references: HashSet<u64>,
}

/// All registered read-only layers, guarded as a unit by the store.
#[derive(Debug, Default)]
pub(crate) struct LayerGraph {
    pub(crate) layers: HashMap<ChainId, RoLayer>,
    /// Cache and mount IDs of backing stores being built.
    pub(crate) pending: HashSet<String>,
}

impl LayerGraph {
    /// Take a reference to `chain_id`, if registered.
    pub(crate) fn acquire(&mut self, chain_id: &ChainId) -> Option<Arc<LayerInfo>> {
        let node = self.layers.get_mut(chain_id)?;
        node.reference_count += 1;
        Some(Arc::clone(&node.info))
    }

    pub(crate) fn insert(&mut self, info: Arc<LayerInfo>, reference_count: usize) {
        let chain_id = info.chain_id.clone();
        let node = RoLayer {
            info,
            reference_count,
            references: HashSet::new(),
        };
        self.layers.insert(chain_id, node);
    }

    /// Record `handle` against an already counted reference.
    pub(crate) fn add_handle(&mut self, chain_id: &ChainId, handle: u64) {
        self.layers
            .get_mut(chain_id)
            .unwrap_or_else(|| panic!("layer {chain_id} missing from graph"))
            .references
            .insert(handle);
    }
}

/// Accounting record for a layer that was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub chain_id: ChainId,
    pub diff_id: DiffId,
    /// Cumulative size including ancestors.
    pub size: u64,
    pub diff_size: u64,
}

impl Metadata {
    pub(crate) fn for_layer(info: &LayerInfo) -> Self {
        Metadata {
            chain_id: info.chain_id.clone(),
            diff_id: info.diff_id.clone(),
            size: info.size(),
            diff_size: info.diff_size,
        }
    }
}

/// A counted reference to a read-only layer.
///
/// Keeps the layer (and its ancestors) alive until passed to
/// [`LayerStore::release`](crate::LayerStore::release). Dropping a handle
/// without releasing it leaks the reference.
pub struct Layer {
    pub(crate) handle: u64,
    pub(crate) info: Arc<LayerInfo>,
    pub(crate) store: Arc<StoreInner>,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("handle", &self.handle)
            .field("chain_id", &self.info.chain_id)
            .field("diff_id", &self.info.diff_id)
            .finish()
    }
}

impl Layer {
    pub fn chain_id(&self) -> &ChainId {
        &self.info.chain_id
    }

    pub fn diff_id(&self) -> &DiffId {
        &self.info.diff_id
    }

    /// Cumulative size of the layer and its ancestors.
    pub fn size(&self) -> u64 {
        self.info.size()
    }

    pub fn diff_size(&self) -> u64 {
        self.info.diff_size
    }

    pub fn parent(&self) -> Option<&ChainId> {
        self.info.parent.as_ref().map(|p| &p.chain_id)
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.info.descriptor.as_ref()
    }

    pub fn info(&self) -> &LayerInfo {
        &self.info
    }

    /// Driver specific details of the backing store.
    pub fn metadata(&self) -> Result<HashMap<String, String>> {
        self.store
            .driver
            .get_metadata(&self.info.cache_id)
            .map_err(Error::Driver)
    }

    /// Export the layer's diff as the exact tar stream it was registered from.
    ///
    /// The stream is assembled on a separate thread. Assembly failures, and
    /// content that does not hash to the layer's diff ID, surface as read
    /// errors.
    pub fn tar_stream(&self) -> Result<TarStream> {
        open_tar_stream(&self.store, &self.info)
    }
}

/// Start assembling the diff of `info` on a separate thread.
pub(crate) fn open_tar_stream(store: &StoreInner, info: &LayerInfo) -> Result<TarStream> {
    let tar_split = store.metadata.tar_split_reader(&info.chain_id)?;
    let driver = Arc::clone(&store.driver);
    let cache_id = info.cache_id.clone();
    let (reader, mut writer) = pipe();

    thread::Builder::new()
        .name(format!("tar-{}", &cache_id[..12.min(cache_id.len())]))
        .spawn(move || match assemble_tar_to(&*driver, &cache_id, tar_split, &mut writer) {
            Ok(size) => debug!("Assembled {size} bytes of tar data for {cache_id}"),
            Err(err) => writer.close_with_error(err),
        })?;

    Ok(TarStream {
        inner: reader,
        digester: Digester::new(),
        expected: info.diff_id.clone(),
    })
}

/// Rebuild the tar stream of `cache_id` from its tar-split record.
pub(crate) fn assemble_tar_to(
    driver: &dyn GraphDriver,
    cache_id: &str,
    tar_split: impl BufRead,
    writer: &mut dyn Write,
) -> io::Result<u64> {
    debug!("Assembling tar data for {cache_id}");
    let mut getter = driver::diff_getter(driver, cache_id)
        .map_err(|err| io::Error::other(format!("{err:#}")))?;
    let mut unpacker = JsonUnpacker::new(tar_split);
    write_output_tar_stream(&mut *getter, &mut unpacker, writer)
}

/// Reader over an exported layer diff, verified against the diff ID at EOF.
pub struct TarStream {
    inner: PipeReader,
    digester: Digester,
    expected: DiffId,
}

impl fmt::Debug for TarStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TarStream")
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl Read for TarStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            let actual = self.digester.clone().finish();
            if &actual != self.expected.digest() {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("layer content digest {actual} does not match {}", self.expected),
                ));
            }
        }
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::digest::Digest;

    fn info(name: &str, diff_size: u64, parent: Option<Arc<LayerInfo>>) -> Arc<LayerInfo> {
        let diff_id: DiffId = Digest::from_bytes(name.as_bytes()).into();
        Arc::new(LayerInfo {
            chain_id: ChainId::for_layer(parent.as_ref().map(|p| &p.chain_id), &diff_id),
            diff_id,
            cache_id: format!("cache-{name}"),
            diff_size,
            parent,
            descriptor: None,
        })
    }

    #[test]
    fn test_size_and_depth() {
        let root = info("root", 10, None);
        let mid = info("mid", 20, Some(Arc::clone(&root)));
        let leaf = info("leaf", 5, Some(Arc::clone(&mid)));

        assert_eq!(root.depth(), 1);
        assert_eq!(leaf.depth(), 3);
        assert_eq!(leaf.size(), 35);
        assert_eq!(leaf.diff_size(), 5);
        assert_eq!(leaf.parent().map(|p| p.chain_id()), Some(mid.chain_id()));

        let meta = Metadata::for_layer(&leaf);
        assert_eq!(meta.size, 35);
        assert_eq!(meta.diff_size, 5);
    }

    #[test]
    fn test_graph_acquire() {
        let mut graph = LayerGraph::default();
        let root = info("root", 1, None);
        graph.insert(Arc::clone(&root), 1);

        assert!(graph.acquire(&info("other", 1, None).chain_id).is_none());
        let got = graph.acquire(&root.chain_id).unwrap();
        assert!(Arc::ptr_eq(&got, &root));
        graph.add_handle(&root.chain_id, 7);

        let node = &graph.layers[&root.chain_id];
        assert_eq!(node.reference_count, 2);
        assert!(node.references.contains(&7));
    }
}
