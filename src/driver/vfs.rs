//! A driver that keeps every backing store as a plain directory.
//!
//! Creating a store on top of a parent copies the parent's whole tree, so
//! there is no sharing between layers. Slow and space hungry, but it works on
//! any filesystem and needs no privileges.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{self, Read},
    os::unix::fs::{symlink, PermissionsExt},
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

use anyhow::{bail, Context, Result};
use log::{debug, trace};

use super::{tree_size, CreateOpts, GraphDriver, LiveRestore};
use crate::util::NotFoundFilter;

pub const NAME: &str = "vfs";

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Directory-per-layer graph driver.
#[derive(Debug)]
pub struct VfsDriver {
    home: PathBuf,
    active: Mutex<HashMap<String, usize>>,
}

impl VfsDriver {
    /// Open a driver storing its data under `home`. No options are supported.
    pub fn new(home: impl Into<PathBuf>, options: &[(String, String)]) -> Result<Self> {
        if let Some((key, _)) = options.first() {
            bail!("vfs driver does not support option {key:?}");
        }
        let home = home.into();
        let dir = home.join("dir");
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(VfsDriver {
            home,
            active: Mutex::default(),
        })
    }

    fn dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains('/') || id == "." || id == ".." {
            bail!("invalid layer id {id:?}");
        }
        Ok(self.home.join("dir").join(id))
    }

    fn create_dir(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let dir = self.dir(id)?;
        match parent {
            Some(parent) => {
                let parent_dir = self.dir(parent)?;
                if !parent_dir.is_dir() {
                    bail!("parent layer {parent} does not exist");
                }
                copy_tree(&parent_dir, &dir)
                    .with_context(|| format!("copying {parent} into {id}"))?;
            }
            None => {
                fs::create_dir(&dir).with_context(|| format!("creating {}", dir.display()))?;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
            }
        }
        trace!("vfs: created {id} (parent {parent:?})");
        Ok(())
    }

    /// Number of outstanding [`get`](GraphDriver::get) calls for `id`.
    pub fn active_count(&self, id: &str) -> usize {
        let active = self.active.lock().expect("vfs lock poisoned");
        active.get(id).copied().unwrap_or(0)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(&from)?, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    fs::set_permissions(dst, fs::metadata(src)?.permissions())
}

/// Remove whatever is at `path`, file or directory.
fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn clean_entry_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                bail!("tar entry {} escapes the layer", path.display())
            }
        }
    }
    Ok(out)
}

/// Extract a layer tar into `root`, processing whiteouts.
fn apply_tar(root: &Path, diff: &mut dyn Read) -> Result<u64> {
    let mut archive = tar::Archive::new(diff);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut size = 0;

    for entry in archive.entries().context("reading tar stream")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = clean_entry_path(&entry.path().context("decoding entry path")?)?;
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let parent = path.parent().unwrap_or(Path::new(""));

        if file_name == WHITEOUT_OPAQUE {
            let dir = root.join(parent);
            if let Some(children) = fs::read_dir(&dir).filter_not_found()? {
                for child in children {
                    let child = child?;
                    let relative = parent.join(child.file_name());
                    if !unpacked.contains(&relative) {
                        remove_any(&child.path())?;
                    }
                }
            }
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&root.join(parent).join(hidden))
                .with_context(|| format!("applying whiteout {}", path.display()))?;
            continue;
        }

        let target = root.join(&path);
        let is_dir = entry.header().entry_type().is_dir();
        if let Ok(existing) = fs::symlink_metadata(&target) {
            if !(is_dir && existing.is_dir()) {
                remove_any(&target)?;
            }
        }

        if entry.header().entry_type().is_file() {
            size += entry.size();
        }
        entry
            .unpack_in(root)
            .with_context(|| format!("unpacking {}", path.display()))?;
        unpacked.insert(path);
    }
    Ok(size)
}

impl GraphDriver for VfsDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, id: &str, parent: Option<&str>, _opts: &CreateOpts) -> Result<()> {
        self.create_dir(id, parent)
    }

    fn create_read_write(&self, id: &str, parent: Option<&str>, _opts: &CreateOpts) -> Result<()> {
        self.create_dir(id, parent)
    }

    fn get(&self, id: &str, _mount_label: &str) -> Result<PathBuf> {
        let dir = self.dir(id)?;
        if !dir.is_dir() {
            bail!("layer {id} does not exist");
        }
        let mut active = self.active.lock().expect("vfs lock poisoned");
        *active.entry(id.to_string()).or_default() += 1;
        Ok(dir)
    }

    fn put(&self, id: &str) -> Result<()> {
        let mut active = self.active.lock().expect("vfs lock poisoned");
        let Some(count) = active.get_mut(id) else {
            bail!("layer {id} is not active");
        };
        *count -= 1;
        if *count == 0 {
            active.remove(id);
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let dir = self.dir(id)?;
        self.active.lock().expect("vfs lock poisoned").remove(id);
        if fs::remove_dir_all(&dir)
            .filter_not_found()
            .with_context(|| format!("removing {}", dir.display()))?
            .is_some()
        {
            trace!("vfs: removed {id}");
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.dir(id).is_ok_and(|dir| dir.is_dir())
    }

    fn apply_diff(&self, id: &str, _parent: Option<&str>, diff: &mut dyn Read) -> Result<u64> {
        let dir = self.dir(id)?;
        if !dir.is_dir() {
            bail!("layer {id} does not exist");
        }
        let size = apply_tar(&dir, diff).with_context(|| format!("applying diff to {id}"))?;
        debug!("vfs: applied {size} bytes to {id}");
        Ok(size)
    }

    fn diff_size(&self, id: &str, _parent: Option<&str>) -> Result<u64> {
        // every vfs layer holds a full copy, so the whole tree counts
        let dir = self.dir(id)?;
        tree_size(&dir).with_context(|| format!("measuring {}", dir.display()))
    }

    fn get_metadata(&self, id: &str) -> Result<HashMap<String, String>> {
        let dir = self.dir(id)?;
        if !dir.is_dir() {
            bail!("layer {id} does not exist");
        }
        Ok(HashMap::from([("Path".to_string(), dir.display().to_string())]))
    }

    fn status(&self) -> Vec<(String, String)> {
        let layers = fs::read_dir(self.home.join("dir"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        vec![
            ("Root Dir".to_string(), self.home.display().to_string()),
            ("Layers".to_string(), layers.to_string()),
        ]
    }

    fn cleanup(&self) -> Result<()> {
        let active = self.active.lock().expect("vfs lock poisoned");
        if !active.is_empty() {
            debug!("vfs: {} stores still active at cleanup", active.len());
        }
        Ok(())
    }

    fn cache_ids(&self) -> Result<Vec<String>> {
        let dir = self.home.join("dir");
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
            if let Ok(name) = entry?.file_name().into_string() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn as_live_restore(&self) -> Option<&dyn LiveRestore> {
        Some(self)
    }
}

impl LiveRestore for VfsDriver {
    fn restore(&self, id: &str) -> Result<()> {
        let dir = self.dir(id)?;
        if !dir.is_dir() {
            bail!("cannot restore {id}: no such layer");
        }
        let mut active = self.active.lock().expect("vfs lock poisoned");
        active.entry(id.to_string()).or_insert(1);
        debug!("vfs: restored active layer {id}");
        Ok(())
    }
}
