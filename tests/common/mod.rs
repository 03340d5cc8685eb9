#![allow(dead_code)]

use std::{
    collections::HashMap,
    ffi::OsString,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, LazyLock, Mutex,
    },
};

use anyhow::{bail, Result};
use tempfile::TempDir;

use layerstore::{
    driver::{DiffGetter, LiveRestore},
    CreateOpts, GraphDriver, Layer, LayerStore, VfsDriver,
};

static TMPDIR: LazyLock<OsString> = LazyLock::new(|| {
    std::env::var_os("LAYERSTORE_TEST_TMPDIR").unwrap_or_else(|| std::env::temp_dir().into())
});

pub fn tempdir() -> TempDir {
    TempDir::with_prefix_in("layerstore-test-", TMPDIR.as_os_str()).unwrap()
}

/// A tar holding one regular file per `(path, content)` pair.
pub fn tar_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_size(content.len() as u64);
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

/// A single-file tar whose content is derived from `seed`.
pub fn layer_tar(seed: &str) -> Vec<u8> {
    tar_of(&[(&format!("layers/{seed}"), &format!("content of {seed}\n"))])
}

/// A tar made only of entries without content: directories, a symlink and
/// an empty file.
pub fn metadata_only_tar() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o700);
    dir.set_size(0);
    builder.append_data(&mut dir, "etc", io::empty()).unwrap();

    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_mode(0o777);
    link.set_size(0);
    link.set_link_name("../usr/share/zoneinfo/UTC").unwrap();
    builder.append_data(&mut link, "etc/localtime", io::empty()).unwrap();

    let mut empty = tar::Header::new_gnu();
    empty.set_entry_type(tar::EntryType::Regular);
    empty.set_mode(0o600);
    empty.set_size(0);
    builder.append_data(&mut empty, "etc/machine-id", io::empty()).unwrap();

    builder.into_inner().unwrap()
}

pub fn export(layer: &Layer) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    layer.tar_stream()?.read_to_end(&mut data)?;
    Ok(data)
}

/// A vfs driver with switchable failures and a log of removals.
#[derive(Debug)]
pub struct FaultyDriver {
    inner: VfsDriver,
    pub fail_remove: AtomicBool,
    pub fail_create_read_write: AtomicBool,
    pub fail_put: AtomicBool,
    removed: Mutex<HashMap<String, usize>>,
}

impl FaultyDriver {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        FaultyDriver {
            inner: VfsDriver::new(home, &[]).unwrap(),
            fail_remove: AtomicBool::new(false),
            fail_create_read_write: AtomicBool::new(false),
            fail_put: AtomicBool::new(false),
            removed: Mutex::default(),
        }
    }

    pub fn vfs(&self) -> &VfsDriver {
        &self.inner
    }

    /// How often `remove` succeeded for `id`.
    pub fn removals(&self, id: &str) -> usize {
        self.removed.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_removals(&self) -> usize {
        self.removed.lock().unwrap().values().sum()
    }
}

impl GraphDriver for FaultyDriver {
    fn name(&self) -> &str {
        "faulty"
    }

    fn create(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()> {
        self.inner.create(id, parent, opts)
    }

    fn create_read_write(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()> {
        if self.fail_create_read_write.load(Ordering::SeqCst) {
            bail!("injected create_read_write failure for {id}");
        }
        self.inner.create_read_write(id, parent, opts)
    }

    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf> {
        self.inner.get(id, mount_label)
    }

    fn put(&self, id: &str) -> Result<()> {
        if self.fail_put.load(Ordering::SeqCst) {
            bail!("injected put failure for {id}");
        }
        self.inner.put(id)
    }

    fn remove(&self, id: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            bail!("injected remove failure for {id}");
        }
        self.inner.remove(id)?;
        *self.removed.lock().unwrap().entry(id.to_string()).or_default() += 1;
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.inner.exists(id)
    }

    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64> {
        self.inner.apply_diff(id, parent, diff)
    }

    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64> {
        self.inner.diff_size(id, parent)
    }

    fn get_metadata(&self, id: &str) -> Result<HashMap<String, String>> {
        self.inner.get_metadata(id)
    }

    fn status(&self) -> Vec<(String, String)> {
        self.inner.status()
    }

    fn cleanup(&self) -> Result<()> {
        self.inner.cleanup()
    }

    fn cache_ids(&self) -> Result<Vec<String>> {
        self.inner.cache_ids()
    }

    fn as_diff_getter(&self) -> Option<&dyn DiffGetter> {
        self.inner.as_diff_getter()
    }

    fn as_live_restore(&self) -> Option<&dyn LiveRestore> {
        self.inner.as_live_restore()
    }
}

/// A store in `root`, together with its driver.
pub fn open_store(root: &Path) -> (LayerStore, Arc<FaultyDriver>) {
    let driver = Arc::new(FaultyDriver::new(root.join("faulty")));
    let store = LayerStore::open(root.join("layerdb"), Arc::clone(&driver) as Arc<dyn GraphDriver>)
        .unwrap();
    (store, driver)
}
