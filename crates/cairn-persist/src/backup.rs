//! Rotating backups of the previously committed artifact.
//!
//! Before a checkpoint replaces its artifact, the old one is copied to
//! `<file>.bak<slot>-d<depth>`, where `slot` cycles through
//! `0..backup_slots` and `depth` is the active segment at the time of the
//! copy. At most one file exists per slot. Backups are a debugging aid and
//! are never read by restore.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cairn_world::segment::SegmentNumber;

fn slot_prefix(target: &Path, slot: u32) -> Option<String> {
    let name = target.file_name()?.to_str()?;
    Some(format!("{name}.bak{slot}-d"))
}

/// `<file>.bak<slot>-d<depth>` next to `target`.
pub fn backup_path(target: &Path, slot: u32, depth: SegmentNumber) -> PathBuf {
    let prefix = slot_prefix(target, slot).unwrap_or_else(|| format!("artifact.bak{slot}-d"));
    target.with_file_name(format!("{prefix}{}", depth.0))
}

fn sibling_dir(target: &Path) -> &Path {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Copy `target` into the slot chosen by `counter`, replacing whatever that
/// slot held. Returns `None` when backups are disabled or there is nothing to
/// back up yet.
pub fn rotate(
    target: &Path,
    slots: u32,
    counter: u64,
    depth: SegmentNumber,
) -> io::Result<Option<PathBuf>> {
    if slots == 0 || !target.is_file() {
        return Ok(None);
    }
    let slot = (counter % u64::from(slots)) as u32;
    if let Some(prefix) = slot_prefix(target, slot) {
        for entry in fs::read_dir(sibling_dir(target))? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                fs::remove_file(entry.path())?;
            }
        }
    }
    let path = backup_path(target, slot, depth);
    fs::copy(target, &path)?;
    tracing::debug!(
        backup = %path.display(),
        slot,
        "backed up previous artifact"
    );
    Ok(Some(path))
}

/// Every backup of `target` currently on disk, sorted by name.
pub fn list(target: &Path) -> io::Result<Vec<PathBuf>> {
    let Some(name) = target.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{name}.bak");
    let mut found = Vec::new();
    let entries = match fs::read_dir(sibling_dir(target)) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(error) => return Err(error),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_slot_and_depth() {
        let path = backup_path(Path::new("saves/cairn.sav"), 2, SegmentNumber(7));
        assert_eq!(path, PathBuf::from("saves/cairn.sav.bak2-d7"));
    }

    #[test]
    fn nothing_to_back_up_on_first_save() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cairn.sav");
        assert_eq!(rotate(&target, 3, 0, SegmentNumber(1)).unwrap(), None);
    }

    #[test]
    fn rotation_is_bounded_and_overwrites_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cairn.sav");
        for counter in 0..7u64 {
            fs::write(&target, counter.to_le_bytes()).unwrap();
            let depth = SegmentNumber(1 + (counter % 4) as u16);
            rotate(&target, 3, counter, depth).unwrap();
        }
        let backups = list(&target).unwrap();
        assert_eq!(backups.len(), 3);
        // Counter 6 landed in slot 0 and replaced counter 3's copy.
        let slot0 = backup_path(&target, 0, SegmentNumber(3));
        assert_eq!(fs::read(slot0).unwrap(), 6u64.to_le_bytes());
    }

    #[test]
    fn zero_slots_disables_backups() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cairn.sav");
        fs::write(&target, b"x").unwrap();
        assert_eq!(rotate(&target, 0, 4, SegmentNumber(1)).unwrap(), None);
        assert!(list(&target).unwrap().is_empty());
    }
}
