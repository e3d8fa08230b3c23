//! Write-to-temp-then-rename helpers. Readers never observe a partial file:
//! a record is either absent or fully written.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

/// Prefix of in-flight temp files. Directory scans skip anything starting with `.`.
const TMP_PREFIX: &str = ".tmp-";

/// Atomically create `target` with `bytes`. Returns `Ok(false)` without touching
/// the existing file if `target` already exists.
pub(crate) async fn create_new(target: PathBuf, bytes: Vec<u8>) -> io::Result<bool> {
    blocking(move || {
        let tmp = write_temp(&target, &bytes)?;
        match tmp.persist_noclobber(&target) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error),
        }
    })
    .await
}

/// Atomically create or replace `target` with `bytes`.
pub(crate) async fn replace(target: PathBuf, bytes: Vec<u8>) -> io::Result<()> {
    blocking(move || {
        let tmp = write_temp(&target, &bytes)?;
        tmp.persist(&target).map(|_| ()).map_err(|e| e.error)
    })
    .await
}

fn write_temp(target: &Path, bytes: &[u8]) -> io::Result<tempfile::NamedTempFile> {
    let dir = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TMP_PREFIX)
        .suffix(".json")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Open `path` (creating it and its parent) and take an exclusive advisory
/// lock on it, waiting for any other holder. Closing the returned file
/// releases the lock.
pub(crate) async fn lock_exclusive(path: PathBuf) -> io::Result<File> {
    blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    })
    .await
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)?
}

/// Whether a directory entry name is a hidden or in-flight file.
pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}
