//! Cairn Engine -- turn driver tying the world model to persistence.
//!
//! This crate owns the single simulation thread's view of a game: the
//! [`WorldState`](cairn_world::state::WorldState), the identity registry, the
//! [`SaveStore`](cairn_persist::store::SaveStore) and the bounded command
//! queue. Other threads talk to it only through a
//! [`CommandSender`](cairn_world::command::CommandSender) and read it only
//! through the lock-free [`SnapshotPublisher`](snapshot::SnapshotPublisher).
//!
//! # Quick Start
//!
//! ```
//! use cairn_engine::prelude::*;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = RuntimeConfig {
//!     persist: PersistConfig {
//!         segment_dir: dir.path().join("segments"),
//!         sync: false,
//!         ..PersistConfig::default()
//!     },
//!     ..RuntimeConfig::default()
//! };
//! let mut runtime = Runtime::new(config);
//! runtime.new_game("wanderer").unwrap();
//! runtime.run_turn(&mut NoRules).unwrap();
//!
//! let save = dir.path().join("cairn.sav");
//! runtime.checkpoint(&save).unwrap();
//! runtime.restore(&save).unwrap();
//! assert_eq!(runtime.publisher().read().turn, 1);
//! ```

#![deny(unsafe_code)]

use std::io;
use std::path::PathBuf;

use cairn_persist::{CheckpointError, RestoreError};
use cairn_world::segment::SegmentNumber;
use cairn_world::WorldError;

pub mod runtime;
pub mod snapshot;

/// Re-export the world model for convenience.
pub use cairn_world;

/// Re-export the persistence layer for convenience.
pub use cairn_persist;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    World(#[from] WorldError),

    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Travel to the active segment or to a reserved number.
    #[error("cannot travel to segment {to}")]
    BadDestination { to: SegmentNumber },

    /// No game has been started or restored.
    #[error("no game in progress")]
    NoSession,

    /// A restore failed part way; only `reset`, `new_game` or another
    /// `restore` are accepted until then.
    #[error("runtime is poisoned by a failed restore")]
    Poisoned,

    #[error("debug dump failed: {0}")]
    Dump(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for hosts.
pub mod prelude {
    pub use cairn_persist::prelude::*;
    pub use cairn_world::prelude::*;

    pub use crate::runtime::{NoRules, Rules, Runtime, RuntimeConfig};
    pub use crate::snapshot::{Feature, FeatureKind, LiveSnapshot, SnapshotPublisher};
    pub use crate::RuntimeError;
}
