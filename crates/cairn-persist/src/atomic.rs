//! Write-then-rename file replacement.
//!
//! Readers of a canonical path only ever see the old file or the complete
//! new one: data goes to a `.tmp` sibling first and the rename is the single
//! operation that touches the canonical path.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// `<file>.tmp` next to `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact");
    let tmp_name = format!("{file_name}.tmp");
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Create `path`'s parent directory if it has one.
pub fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Replace `path` with `bytes` atomically.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8], sync: bool) -> io::Result<()> {
    ensure_parent(path)?;
    let tmp_path = temp_path_for(path);
    let written = (|| -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(bytes)?;
        let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    })();
    if let Err(error) = written {
        discard(&tmp_path);
        return Err(error);
    }
    commit(&tmp_path, path, sync)
}

/// Rename `tmp_path` over `final_path`, then make the rename durable.
pub fn commit(tmp_path: &Path, final_path: &Path, sync: bool) -> io::Result<()> {
    if let Err(error) = fs::rename(tmp_path, final_path) {
        discard(tmp_path);
        return Err(error);
    }
    if sync {
        if let Some(parent) = final_path.parent() {
            fsync_directory(parent);
        }
    }
    Ok(())
}

/// Remove a temporary file, ignoring failures.
pub fn discard(tmp_path: &Path) {
    match fs::remove_file(tmp_path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!(
            path = %tmp_path.display(),
            %error,
            "could not remove temporary file"
        ),
    }
}

/// Best-effort fsync of a directory so a rename inside it survives a crash.
/// Not every platform can open a directory for syncing.
fn fsync_directory(path: &Path) {
    let path = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
}
