//! On-disk layer and mount records.
//!
//! Layout under the layer-db root:
//!
//! ```text
//! sha256/<hex>/{diff,size,cache-id,parent,descriptor.json,tar-split.json.gz}
//! sha256/<hex>-<random>-removing/     layer being deleted (orphan if it survives)
//! mounts/<name>/{mount-id,init-id,parent}
//! tmp/write-set-*/                    uncommitted transactions
//! ```
//!
//! A layer record is written into a private directory under `tmp/` and only
//! becomes visible when the transaction is committed, which renames the
//! directory into place under its chain ID.

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use flate2::{bufread::GzDecoder, write::GzEncoder, Compression};
use log::{debug, warn};
use oci_spec::image::Descriptor;
use tempfile::{NamedTempFile, TempDir};

use crate::{
    digest::{is_sha256_hex, ChainId, DiffId},
    error::{Error, Result},
    util::{rename_noreplace, sync_dir, write_file_synced, NotFoundFilter},
};

const LAYERS_DIR: &str = "sha256";
const MOUNTS_DIR: &str = "mounts";
const TMP_DIR: &str = "tmp";
const REMOVING_SUFFIX: &str = "-removing";

const DIFF_FILE: &str = "diff";
const SIZE_FILE: &str = "size";
const CACHE_ID_FILE: &str = "cache-id";
const PARENT_FILE: &str = "parent";
const DESCRIPTOR_FILE: &str = "descriptor.json";
const TAR_SPLIT_FILE: &str = "tar-split.json.gz";

const MOUNT_ID_FILE: &str = "mount-id";
const INIT_ID_FILE: &str = "init-id";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A layer deletion that did not complete: metadata renamed aside but still on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub chain_id: ChainId,
    pub cache_id: String,
}

/// Metadata records stored as plain files in a directory tree.
#[derive(Debug)]
pub struct FileMetadataStore {
    root: PathBuf,
}

fn read_trimmed(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).map_err(Error::metadata(path))?;
    Ok(content.trim().to_string())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    let content = fs::read_to_string(path)
        .filter_not_found()
        .map_err(Error::metadata(path))?;
    Ok(content
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

impl FileMetadataStore {
    /// Open (creating if needed) a metadata store rooted at `root`.
    ///
    /// Transactions left behind by a previous process are discarded.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [LAYERS_DIR, MOUNTS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(Error::metadata(&path))?;
        }
        let tmp = root.join(TMP_DIR);
        if fs::remove_dir_all(&tmp).filter_not_found().map_err(Error::metadata(&tmp))?.is_some() {
            debug!("Discarded stale metadata transactions in {}", tmp.display());
        }
        fs::create_dir_all(&tmp).map_err(Error::metadata(&tmp))?;
        Ok(FileMetadataStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layers_dir(&self) -> PathBuf {
        self.root.join(LAYERS_DIR)
    }

    fn layer_dir(&self, chain_id: &ChainId) -> PathBuf {
        self.layers_dir().join(chain_id.encoded())
    }

    fn mount_dir(&self, name: &str) -> PathBuf {
        self.root.join(MOUNTS_DIR).join(name)
    }

    /// Begin writing a new layer record.
    pub fn start_transaction(&self) -> Result<Transaction> {
        let tmp = self.root.join(TMP_DIR);
        let dir = tempfile::Builder::new()
            .prefix("write-set-")
            .tempdir_in(&tmp)
            .map_err(Error::metadata(&tmp))?;
        Ok(Transaction {
            dir: Some(dir),
            layers_dir: self.layers_dir(),
        })
    }

    pub fn get_diff_id(&self, chain_id: &ChainId) -> Result<DiffId> {
        DiffId::parse(&read_trimmed(&self.layer_dir(chain_id).join(DIFF_FILE))?)
    }

    pub fn get_size(&self, chain_id: &ChainId) -> Result<u64> {
        let path = self.layer_dir(chain_id).join(SIZE_FILE);
        read_trimmed(&path)?.parse().map_err(|e| Error::Metadata {
            source: io::Error::new(ErrorKind::InvalidData, e),
            path,
        })
    }

    pub fn get_cache_id(&self, chain_id: &ChainId) -> Result<String> {
        let path = self.layer_dir(chain_id).join(CACHE_ID_FILE);
        let cache_id = read_trimmed(&path)?;
        if cache_id.is_empty() {
            return Err(Error::Metadata {
                path,
                source: io::Error::new(ErrorKind::InvalidData, "empty cache id"),
            });
        }
        Ok(cache_id)
    }

    pub fn get_parent(&self, chain_id: &ChainId) -> Result<Option<ChainId>> {
        read_optional(&self.layer_dir(chain_id).join(PARENT_FILE))?
            .map(|s| ChainId::parse(&s))
            .transpose()
    }

    pub fn get_descriptor(&self, chain_id: &ChainId) -> Result<Option<Descriptor>> {
        let path = self.layer_dir(chain_id).join(DESCRIPTOR_FILE);
        let Some(file) = File::open(&path)
            .filter_not_found()
            .map_err(Error::metadata(&path))?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_reader(BufReader::new(file))?))
    }

    /// Open the tar-split record of a layer, decompressing it if needed.
    pub fn tar_split_reader(&self, chain_id: &ChainId) -> Result<Box<dyn BufRead + Send>> {
        let path = self.layer_dir(chain_id).join(TAR_SPLIT_FILE);
        let file = File::open(&path).map_err(Error::metadata(&path))?;
        let mut reader = BufReader::new(file);
        let head = reader.fill_buf().map_err(Error::metadata(&path))?;
        if head.starts_with(&GZIP_MAGIC) {
            Ok(Box::new(BufReader::new(GzDecoder::new(reader))))
        } else {
            Ok(Box::new(reader))
        }
    }

    fn write_mount_file(&self, name: &str, file: &str, value: &str) -> Result<()> {
        let dir = self.mount_dir(name);
        fs::create_dir_all(&dir).map_err(Error::metadata(&dir))?;
        let path = dir.join(file);
        let mut tmp = NamedTempFile::new_in(&dir).map_err(Error::metadata(&path))?;
        tmp.write_all(value.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(Error::metadata(&path))?;
        tmp.persist(&path)
            .map_err(|e| Error::metadata(&path)(e.error))?;
        Ok(())
    }

    pub fn set_mount_id(&self, name: &str, mount_id: &str) -> Result<()> {
        self.write_mount_file(name, MOUNT_ID_FILE, mount_id)
    }

    pub fn set_init_id(&self, name: &str, init_id: &str) -> Result<()> {
        self.write_mount_file(name, INIT_ID_FILE, init_id)
    }

    pub fn set_mount_parent(&self, name: &str, parent: &ChainId) -> Result<()> {
        self.write_mount_file(name, PARENT_FILE, parent.digest().as_str())
    }

    pub fn get_mount_id(&self, name: &str) -> Result<String> {
        read_trimmed(&self.mount_dir(name).join(MOUNT_ID_FILE))
    }

    pub fn get_init_id(&self, name: &str) -> Result<Option<String>> {
        read_optional(&self.mount_dir(name).join(INIT_ID_FILE))
    }

    pub fn get_mount_parent(&self, name: &str) -> Result<Option<ChainId>> {
        read_optional(&self.mount_dir(name).join(PARENT_FILE))?
            .map(|s| ChainId::parse(&s))
            .transpose()
    }

    pub fn remove_mount(&self, name: &str) -> Result<()> {
        let dir = self.mount_dir(name);
        fs::remove_dir_all(&dir)
            .filter_not_found()
            .map_err(Error::metadata(&dir))?;
        Ok(())
    }

    /// All committed layer chain IDs and all mount names.
    pub fn list(&self) -> Result<(Vec<ChainId>, Vec<String>)> {
        let layers_dir = self.layers_dir();
        let mut layers = Vec::new();
        for entry in fs::read_dir(&layers_dir).map_err(Error::metadata(&layers_dir))? {
            let entry = entry.map_err(Error::metadata(&layers_dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_sha256_hex(name) {
                if !name.ends_with(REMOVING_SUFFIX) {
                    debug!("Ignoring unexpected entry {name:?} in {}", layers_dir.display());
                }
                continue;
            }
            if !entry.file_type().map_err(Error::metadata(entry.path()))?.is_dir() {
                continue;
            }
            layers.push(ChainId::parse(&format!("sha256:{name}"))?);
        }

        let mounts_dir = self.root.join(MOUNTS_DIR);
        let mut mounts = Vec::new();
        for entry in fs::read_dir(&mounts_dir).map_err(Error::metadata(&mounts_dir))? {
            let entry = entry.map_err(Error::metadata(&mounts_dir))?;
            if !entry.file_type().map_err(Error::metadata(entry.path()))?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => mounts.push(name),
                Err(name) => warn!("Ignoring mount with non UTF-8 name {name:?}"),
            }
        }

        layers.sort();
        mounts.sort();
        Ok((layers, mounts))
    }

    /// Move a layer's record aside before its backing store is removed.
    ///
    /// The returned directory keeps the `cache-id` so that an interrupted
    /// deletion can be finished by [`orphans`](Self::orphans).
    pub fn rename_for_removal(&self, chain_id: &ChainId) -> Result<PathBuf> {
        let from = self.layer_dir(chain_id);
        loop {
            let name = format!(
                "{}-{}{REMOVING_SUFFIX}",
                chain_id.encoded(),
                crate::util::generate_random_id()
            );
            let to = self.layers_dir().join(name);
            match rename_noreplace(&from, &to) {
                Ok(()) => return Ok(to),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(Error::metadata(&from)(err)),
            }
        }
    }

    /// Layer records left in the removing state by an interrupted deletion.
    pub fn orphans(&self) -> Result<Vec<Orphan>> {
        let layers_dir = self.layers_dir();
        let mut orphans = Vec::new();
        for entry in fs::read_dir(&layers_dir).map_err(Error::metadata(&layers_dir))? {
            let entry = entry.map_err(Error::metadata(&layers_dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(REMOVING_SUFFIX) {
                continue;
            }
            if !entry.file_type().map_err(Error::metadata(entry.path()))?.is_dir() {
                continue;
            }
            let encoded = name.split('-').next().unwrap_or_default();
            let Ok(chain_id) = ChainId::parse(&format!("sha256:{encoded}")) else {
                warn!("Ignoring removal directory with invalid digest: {name}");
                continue;
            };
            let cache_id_path = entry.path().join(CACHE_ID_FILE);
            let cache_id = match fs::read_to_string(&cache_id_path) {
                Ok(content) => content.trim().to_string(),
                Err(err) => {
                    if err.kind() != ErrorKind::NotFound {
                        warn!("Cannot read {}: {err}", cache_id_path.display());
                    }
                    continue;
                }
            };
            if cache_id.is_empty() {
                warn!("Empty cache id in {}", cache_id_path.display());
                continue;
            }
            orphans.push(Orphan { chain_id, cache_id });
        }
        Ok(orphans)
    }

    /// Delete the removing-state records of `chain_id` whose cache ID matches.
    pub fn remove(&self, chain_id: &ChainId, cache_id: &str) -> Result<()> {
        let layers_dir = self.layers_dir();
        for entry in fs::read_dir(&layers_dir).map_err(Error::metadata(&layers_dir))? {
            let entry = entry.map_err(Error::metadata(&layers_dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(chain_id.encoded()) || !name.ends_with(REMOVING_SUFFIX) {
                continue;
            }
            let dir = entry.path();
            match fs::read_to_string(dir.join(CACHE_ID_FILE)) {
                Ok(content) if content.trim() == cache_id => {
                    return fs::remove_dir_all(&dir).map_err(Error::metadata(&dir));
                }
                Ok(_) => {}
                Err(err) => warn!("Cannot read cache id in {}: {err}", dir.display()),
            }
        }
        Ok(())
    }
}

/// Destination of a layer's tar-split record, optionally gzip compressed.
pub struct TarSplitWriter {
    inner: TarSplitInner,
    path: PathBuf,
}

enum TarSplitInner {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl std::fmt::Debug for TarSplitWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarSplitWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TarSplitWriter {
    /// Flush, finish compression and fsync the record.
    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let writer = match self.inner {
            TarSplitInner::Plain(writer) => writer,
            TarSplitInner::Gzip(encoder) => encoder.finish().map_err(Error::metadata(&path))?,
        };
        let file = writer
            .into_inner()
            .map_err(|e| Error::metadata(&path)(e.into_error()))?;
        file.sync_all().map_err(Error::metadata(&path))
    }
}

impl Write for TarSplitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            TarSplitInner::Plain(w) => w.write(buf),
            TarSplitInner::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            TarSplitInner::Plain(w) => w.flush(),
            TarSplitInner::Gzip(w) => w.flush(),
        }
    }
}

/// An uncommitted layer record.
///
/// Exactly one of [`commit`](Self::commit) or [`cancel`](Self::cancel) ends
/// it; dropping it unfinished cancels.
#[derive(Debug)]
pub struct Transaction {
    dir: Option<TempDir>,
    layers_dir: PathBuf,
}

impl Transaction {
    fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .expect("transaction used after completion")
    }

    fn write(&self, file: &str, data: &[u8]) -> Result<()> {
        let path = self.path().join(file);
        write_file_synced(&path, data).map_err(Error::metadata(&path))
    }

    pub fn set_diff_id(&self, diff_id: &DiffId) -> Result<()> {
        self.write(DIFF_FILE, diff_id.digest().as_str().as_bytes())
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        self.write(SIZE_FILE, size.to_string().as_bytes())
    }

    pub fn set_cache_id(&self, cache_id: &str) -> Result<()> {
        self.write(CACHE_ID_FILE, cache_id.as_bytes())
    }

    pub fn set_parent(&self, parent: &ChainId) -> Result<()> {
        self.write(PARENT_FILE, parent.digest().as_str().as_bytes())
    }

    pub fn set_descriptor(&self, descriptor: &Descriptor) -> Result<()> {
        self.write(DESCRIPTOR_FILE, &serde_json::to_vec(descriptor)?)
    }

    /// Writer for the tar-split record; must be [`finish`](TarSplitWriter::finish)ed before commit.
    pub fn tar_split_writer(&self, compress: bool) -> Result<TarSplitWriter> {
        let path = self.path().join(TAR_SPLIT_FILE);
        let file = File::create(&path).map_err(Error::metadata(&path))?;
        let writer = BufWriter::new(file);
        let inner = if compress {
            TarSplitInner::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            TarSplitInner::Plain(writer)
        };
        Ok(TarSplitWriter { inner, path })
    }

    /// Publish the record under `chain_id`.
    pub fn commit(mut self, chain_id: &ChainId) -> Result<()> {
        let dir = self.dir.take().expect("transaction used after completion");
        sync_dir(dir.path()).map_err(Error::metadata(dir.path()))?;
        let target = self.layers_dir.join(chain_id.encoded());
        // the TempDir still owns the directory, so a failed rename cleans up on drop
        rename_noreplace(dir.path(), &target).map_err(Error::metadata(&target))?;
        dir.keep();
        sync_dir(&self.layers_dir).map_err(Error::metadata(&self.layers_dir))
    }

    /// Discard the record.
    pub fn cancel(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close().map_err(Error::metadata(path))
            }
            None => Ok(()),
        }
    }

    /// The private directory of this transaction, for diagnostics.
    pub fn location(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }
}
