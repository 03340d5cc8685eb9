use std::{
    fs::File,
    io::{ErrorKind, Result, Write},
    path::Path,
};

use rand::Rng;
use rustix::{
    fs::{renameat_with, RenameFlags, CWD},
    io::Errno,
};

/// Turn "not found" into `Ok(None)`, passing every other error through.
pub(crate) trait NotFoundFilter<T> {
    fn filter_not_found(self) -> Result<Option<T>>;
}

impl<T> NotFoundFilter<T> for Result<T> {
    fn filter_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Generate a random 64 character hex identifier, suitable for cache and mount IDs.
///
/// Identifiers whose 12 character short form would parse as a decimal number are
/// rejected, since such IDs get confused with numeric arguments by tooling.
pub(crate) fn generate_random_id() -> String {
    let mut rng = rand::rng();
    loop {
        let id = hex::encode(rng.random::<[u8; 32]>());
        if !id[..12].bytes().all(|b| b.is_ascii_digit()) {
            return id;
        }
    }
}

/// Write `data` to a new file at `path` and fsync it.
pub(crate) fn write_file_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// fsync a directory so that entries created in it are durable.
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()
}

/// Rename `from` to `to`, failing with `AlreadyExists` instead of replacing `to`.
pub(crate) fn rename_noreplace(from: &Path, to: &Path) -> Result<()> {
    match renameat_with(CWD, from, CWD, to, RenameFlags::NOREPLACE) {
        Ok(()) => Ok(()),
        // filesystems without renameat2() support
        Err(Errno::INVAL) | Err(Errno::NOSYS) => {
            if to.symlink_metadata().is_ok() {
                return Err(ErrorKind::AlreadyExists.into());
            }
            std::fs::rename(from, to)
        }
        Err(err) => Err(err.into()),
    }
}
