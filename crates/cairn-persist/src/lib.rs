//! Cairn Persist -- segmented, crash-consistent checkpoint and restore.
//!
//! A checkpoint writes the whole live world into one consolidated artifact:
//! the active segment and the world block are encoded with the two-pass
//! [`codec`], every other visited segment is pulled out of its standalone
//! [`SegmentStore`](store::SegmentStore) and appended as a tagged record, and
//! the result is committed with a single atomic rename. Restore runs the same
//! layout backwards, pushes the non-active segments back out into standalone
//! stores, and reconnects cross-segment references with the [`relink`]
//! passes.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use cairn_persist::prelude::*;
//! use cairn_world::prelude::*;
//!
//! # fn run(mut world: WorldState, mut registry: IdentityRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let mut saves = SaveStore::new(PersistConfig::default());
//! let report = saves.checkpoint(&mut world, &registry, Path::new("save/cairn.sav"))?;
//! println!("wrote {} bytes", report.bytes);
//!
//! let restored = saves.restore(Path::new("save/cairn.sav"), &mut registry)?;
//! assert_eq!(restored, world);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

use std::io;
use std::path::PathBuf;

use cairn_world::identity::Identity;
use cairn_world::segment::SegmentNumber;
use cairn_world::WorldError;

pub mod artifact;
pub mod atomic;
pub mod backup;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod relink;
pub mod restore;
pub mod sink;
pub mod store;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Malformed encoded bytes. Offsets are relative to the start of the payload
/// being decoded.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    #[error("invalid {what} tag {tag} at offset {offset}")]
    BadTag {
        offset: u64,
        what: &'static str,
        tag: u64,
    },

    #[error("{what} out of range ({value}) at offset {offset}")]
    OutOfRange {
        offset: u64,
        what: &'static str,
        value: u64,
    },

    #[error("zero identity at offset {offset}")]
    ZeroIdentity { offset: u64 },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: u64 },

    #[error("{remaining} trailing bytes at offset {offset}")]
    TrailingBytes { offset: u64, remaining: u64 },

    #[error("identity {identity} appears more than once")]
    DuplicateIdentity { identity: Identity },

    #[error("inconsistent data: {details}")]
    Inconsistent { details: String },

    /// The bytes parsed but describe an impossible world.
    #[error("rejected at offset {offset}: {source}")]
    World {
        offset: u64,
        #[source]
        source: WorldError,
    },
}

/// Why a checkpoint did not commit. In every case the previously committed
/// artifact is untouched.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The world is not in a savable state yet. Nothing was written.
    #[error("world is not ready to checkpoint: {reason}")]
    NotReady { reason: &'static str },

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A visited segment's stored bytes failed validation.
    #[error("segment {segment} failed validation during consolidation: {source}")]
    Corrupt {
        segment: SegmentNumber,
        #[source]
        source: CodecError,
    },

    /// A visited segment has no stored copy anywhere.
    #[error("segment {segment} was visited but has no stored copy")]
    Missing { segment: SegmentNumber },

    /// The previously committed artifact, needed as a consolidation source,
    /// could not be read.
    #[error("previous artifact {} is unreadable: {source}", path.display())]
    PreviousArtifact {
        path: PathBuf,
        #[source]
        source: Box<RestoreError>,
    },

    /// Transient state could not be normalized.
    #[error("could not normalize transient state: {0}")]
    World(#[from] WorldError),
}

/// Why a restore failed. After any restore error the registry and segment
/// store have been reset and the world must not be resumed.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("artifact is corrupt: {details}")]
    Corrupt { details: String },
}

impl RestoreError {
    pub(crate) fn corrupt(details: impl Into<String>) -> Self {
        RestoreError::Corrupt {
            details: details.into(),
        }
    }

    /// Wrap a codec failure with what was being decoded.
    pub(crate) fn codec(context: impl std::fmt::Display, source: CodecError) -> Self {
        RestoreError::Corrupt {
            details: format!("{context}: {source}"),
        }
    }
}

/// Errors loading a [`PersistConfig`](config::PersistConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid persistence config: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::artifact::{ArtifactIndex, RecordEntry};
    pub use crate::checkpoint::CheckpointReport;
    pub use crate::codec::{
        decode_segment, encode_segment, measure, to_bytes, Encode, EncodeMode, Encoded,
        SegmentSlot,
    };
    pub use crate::config::PersistConfig;
    pub use crate::relink::{relink, relink_segment, RelinkPass, RelinkReport};
    pub use crate::sink::{BufferSink, CountingSink, Sink};
    pub use crate::store::{DirSegmentStore, MemorySegmentStore, SaveStore, SegmentStore};
    pub use crate::{CheckpointError, CodecError, ConfigError, RestoreError};
}
