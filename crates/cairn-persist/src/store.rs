//! Standalone segment stores and the [`SaveStore`] that owns them.
//!
//! While a game runs, every segment that is neither active nor consolidated
//! into a committed artifact sits in a [`SegmentStore`] as its encoded
//! bytes. [`DirSegmentStore`] keeps one file per segment; [`MemorySegmentStore`]
//! keeps them in a map.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cairn_world::segment::{Segment, SegmentNumber};

use crate::atomic;
use crate::codec::to_bytes;
use crate::config::PersistConfig;
use crate::CheckpointError;

// ---------------------------------------------------------------------------
// SegmentStore
// ---------------------------------------------------------------------------

/// Keyed storage for encoded segments at rest.
pub trait SegmentStore: fmt::Debug + Send {
    /// Store `bytes` for `number`, replacing any previous copy atomically.
    fn put(&mut self, number: SegmentNumber, bytes: &[u8]) -> io::Result<()>;

    /// The stored bytes for `number`, if there are any.
    fn get(&self, number: SegmentNumber) -> io::Result<Option<Vec<u8>>>;

    /// Delete the copy for `number`. Returns whether one existed.
    fn remove(&mut self, number: SegmentNumber) -> io::Result<bool>;

    /// Delete every stored segment. Returns how many were removed.
    fn clear(&mut self) -> io::Result<usize>;

    /// Stored segment numbers, ascending.
    fn numbers(&self) -> io::Result<Vec<SegmentNumber>>;

    /// Where `number` is kept, for error messages and logs.
    fn location(&self, number: SegmentNumber) -> PathBuf;
}

/// One file per segment, `segment-NNNNN.bin`, inside a directory.
#[derive(Debug, Clone)]
pub struct DirSegmentStore {
    dir: PathBuf,
    sync: bool,
}

impl DirSegmentStore {
    /// A store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, sync: bool) -> Self {
        Self {
            dir: dir.into(),
            sync,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn parse_name(name: &str) -> Option<SegmentNumber> {
        let digits = name.strip_prefix("segment-")?.strip_suffix(".bin")?;
        let number = SegmentNumber(digits.parse().ok()?);
        number.is_valid().then_some(number)
    }

    fn entries(&self) -> io::Result<Vec<(SegmentNumber, PathBuf)>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };
        let mut found = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if let Some(number) = entry.file_name().to_str().and_then(Self::parse_name) {
                found.push((number, entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }
}

impl SegmentStore for DirSegmentStore {
    fn put(&mut self, number: SegmentNumber, bytes: &[u8]) -> io::Result<()> {
        atomic::write_bytes_atomic(&self.location(number), bytes, self.sync)
    }

    fn get(&self, number: SegmentNumber) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.location(number)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn remove(&mut self, number: SegmentNumber) -> io::Result<bool> {
        match fs::remove_file(self.location(number)) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn clear(&mut self) -> io::Result<usize> {
        let entries = self.entries()?;
        for (_, path) in &entries {
            fs::remove_file(path)?;
        }
        Ok(entries.len())
    }

    fn numbers(&self) -> io::Result<Vec<SegmentNumber>> {
        Ok(self.entries()?.into_iter().map(|(n, _)| n).collect())
    }

    fn location(&self, number: SegmentNumber) -> PathBuf {
        self.dir.join(format!("segment-{:05}.bin", number.0))
    }
}

/// Segments kept in memory. Used by tests and by hosts that never need to
/// survive a crash between checkpoints.
#[derive(Debug, Default, Clone)]
pub struct MemorySegmentStore {
    segments: BTreeMap<SegmentNumber, Vec<u8>>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentStore for MemorySegmentStore {
    fn put(&mut self, number: SegmentNumber, bytes: &[u8]) -> io::Result<()> {
        self.segments.insert(number, bytes.to_vec());
        Ok(())
    }

    fn get(&self, number: SegmentNumber) -> io::Result<Option<Vec<u8>>> {
        Ok(self.segments.get(&number).cloned())
    }

    fn remove(&mut self, number: SegmentNumber) -> io::Result<bool> {
        Ok(self.segments.remove(&number).is_some())
    }

    fn clear(&mut self) -> io::Result<usize> {
        let count = self.segments.len();
        self.segments.clear();
        Ok(count)
    }

    fn numbers(&self) -> io::Result<Vec<SegmentNumber>> {
        Ok(self.segments.keys().copied().collect())
    }

    fn location(&self, number: SegmentNumber) -> PathBuf {
        PathBuf::from(format!("memory://segment-{}", number.0))
    }
}

// ---------------------------------------------------------------------------
// SaveStore
// ---------------------------------------------------------------------------

/// Owns the standalone segment store and remembers the last artifact that
/// was committed or restored, which doubles as a source for segments that
/// are no longer in the standalone store.
///
/// Checkpoint lives in [`checkpoint`](crate::checkpoint), restore and segment
/// loading in [`restore`](crate::restore).
#[derive(Debug)]
pub struct SaveStore {
    pub(crate) config: PersistConfig,
    pub(crate) segments: Box<dyn SegmentStore>,
    pub(crate) last_artifact: Option<PathBuf>,
}

impl SaveStore {
    /// A save store keeping segments in `config.segment_dir`.
    pub fn new(config: PersistConfig) -> Self {
        let segments = Box::new(DirSegmentStore::new(&config.segment_dir, config.sync));
        Self::with_store(config, segments)
    }

    /// A save store over a caller-provided segment store.
    pub fn with_store(config: PersistConfig, segments: Box<dyn SegmentStore>) -> Self {
        Self {
            config,
            segments,
            last_artifact: None,
        }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn segments(&self) -> &dyn SegmentStore {
        self.segments.as_ref()
    }

    /// The artifact most recently committed or restored in this session.
    pub fn last_artifact(&self) -> Option<&Path> {
        self.last_artifact.as_deref()
    }

    /// Whether a committed artifact exists at `path`.
    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Remove the artifact at `path` and any temporary file left next to it.
    /// Backups are left alone. Returns whether an artifact was removed.
    pub fn delete(&mut self, path: &Path) -> io::Result<bool> {
        atomic::discard(&atomic::temp_path_for(path));
        let removed = match fs::remove_file(path) {
            Ok(()) => true,
            Err(error) if error.kind() == io::ErrorKind::NotFound => false,
            Err(error) => return Err(error),
        };
        if self.last_artifact.as_deref() == Some(path) {
            self.last_artifact = None;
        }
        Ok(removed)
    }

    /// Put a departing segment to rest in the standalone store.
    pub fn stash_segment(&mut self, segment: &Segment) -> Result<u64, CheckpointError> {
        let bytes = to_bytes(segment);
        self.segments
            .put(segment.number, &bytes)
            .map_err(|source| CheckpointError::Io {
                op: "store segment",
                path: self.segments.location(segment.number),
                source,
            })?;
        tracing::debug!(segment = %segment.number, bytes = bytes.len(), "stashed segment");
        Ok(bytes.len() as u64)
    }

    /// Drop every standalone segment and forget the last artifact. Used when
    /// a new game starts.
    pub fn reset(&mut self) -> io::Result<usize> {
        self.last_artifact = None;
        self.segments.clear()
    }
}
