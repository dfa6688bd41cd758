//! Checkpoint: consolidate the live world into one committed artifact.
//!
//! The artifact is written to `<target>.tmp` and only renamed over `target`
//! once every byte, the end tag and the digest are on disk. Any failure
//! before the rename deletes the temporary file and leaves the previously
//! committed artifact exactly as it was.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use cairn_world::identity::IdentityRegistry;
use cairn_world::segment::SegmentNumber;
use cairn_world::state::WorldState;

use crate::artifact::{write_record, ArtifactIndex, ArtifactPrefix, HashingWriter, EOF_TAG};
use crate::codec::{parse_segment, to_bytes, PlayerBlock};
use crate::store::SaveStore;
use crate::{atomic, backup, CheckpointError, CodecError};

/// What a committed checkpoint wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    /// The committed artifact.
    pub path: PathBuf,
    /// Total artifact size, digest included.
    pub bytes: u64,
    /// Non-active segments appended as tagged records, ascending.
    pub consolidated: Vec<SegmentNumber>,
    /// Where the previous artifact was copied, if a backup was taken.
    pub backup: Option<PathBuf>,
    /// Hex BLAKE3 digest of the artifact body.
    pub digest: String,
}

fn io_error<'a>(
    op: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> CheckpointError + 'a {
    move |source| CheckpointError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

impl SaveStore {
    /// Write `state` and every visited segment to `target`.
    ///
    /// The world must have a placed avatar and at least one elapsed turn.
    /// In-flight projectiles are landed for the write and relaunched
    /// afterwards whether or not the checkpoint commits. Standalone copies of
    /// consolidated segments are deleted once the artifact is committed.
    pub fn checkpoint(
        &mut self,
        state: &mut WorldState,
        registry: &IdentityRegistry,
        target: &Path,
    ) -> Result<CheckpointReport, CheckpointError> {
        // 1. Refuse before touching anything.
        if let Some(reason) = state.not_ready_reason() {
            tracing::warn!(path = %target.display(), reason, "checkpoint refused");
            return Err(CheckpointError::NotReady { reason });
        }

        // 2. Land projectiles so only storable state remains.
        let stash = state.normalize_transients()?;

        let started = Instant::now();
        let counter = state.checkpoints;
        state.checkpoints += 1;
        let tmp = atomic::temp_path_for(target);

        let outcome = self.write_and_commit(state, registry, target, &tmp, counter);

        // 9. Relaunch projectiles on every path.
        state.restore_transients(stash);

        match outcome {
            Ok(report) => {
                tracing::info!(
                    path = %report.path.display(),
                    bytes = report.bytes,
                    segments = report.consolidated.len() + 1,
                    turn = state.turn,
                    digest = %report.digest,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "checkpoint committed"
                );
                Ok(report)
            }
            Err(error) => {
                atomic::discard(&tmp);
                state.checkpoints = counter;
                tracing::warn!(path = %target.display(), %error, "checkpoint failed");
                Err(error)
            }
        }
    }

    fn write_and_commit(
        &mut self,
        state: &WorldState,
        registry: &IdentityRegistry,
        target: &Path,
        tmp: &Path,
        counter: u64,
    ) -> Result<CheckpointReport, CheckpointError> {
        // 3. Header, player block, active segment and world block.
        atomic::ensure_parent(target).map_err(io_error("create directory", target))?;
        let file = File::create(tmp).map_err(io_error("create", tmp))?;
        let mut out = HashingWriter::new(BufWriter::new(file));
        let player = PlayerBlock::capture(state, registry);
        let prefix = to_bytes(&ArtifactPrefix {
            player: &player,
            world: state,
        });
        out.write_all(&prefix).map_err(io_error("write", tmp))?;

        // 4. Every other visited segment, ascending.
        let mut previous = None;
        let mut consolidated = Vec::new();
        for &number in &state.visited {
            if number == state.active.number {
                continue;
            }
            let bytes = self.consolidation_source(number, &mut previous)?;
            let segment = parse_segment(&bytes)
                .map_err(|source| CheckpointError::Corrupt { segment: number, source })?;
            if segment.number != number {
                return Err(CheckpointError::Corrupt {
                    segment: number,
                    source: CodecError::Inconsistent {
                        details: format!("stored copy holds segment {}", segment.number),
                    },
                });
            }
            write_record(&mut out, number, &bytes).map_err(io_error("write", tmp))?;
            consolidated.push(number);
        }

        // 5. End tag, then the digest of everything before it.
        out.write_all(&EOF_TAG.to_le_bytes())
            .map_err(io_error("write", tmp))?;
        let (mut writer, digest, written) = out.finish();
        writer
            .write_all(digest.as_bytes())
            .map_err(io_error("write", tmp))?;
        let file = writer
            .into_inner()
            .map_err(|error| io_error("flush", tmp)(error.into_error()))?;
        if self.config.sync {
            file.sync_all().map_err(io_error("sync", tmp))?;
        }
        drop(file);

        // 6. Keep a copy of what is about to be replaced.
        let backup = match backup::rotate(
            target,
            self.config.backup_slots,
            counter,
            state.active.number,
        ) {
            Ok(backup) => backup,
            Err(error) => {
                tracing::warn!(path = %target.display(), %error, "backup rotation failed");
                None
            }
        };

        // 7. Commit.
        atomic::commit(tmp, target, self.config.sync).map_err(io_error("rename", target))?;
        self.last_artifact = Some(target.to_path_buf());

        // 8. The artifact now holds these segments.
        for &number in &consolidated {
            if let Err(error) = self.segments.remove(number) {
                tracing::warn!(
                    segment = %number,
                    location = %self.segments.location(number).display(),
                    %error,
                    "could not remove consolidated segment"
                );
            }
        }

        Ok(CheckpointReport {
            path: target.to_path_buf(),
            bytes: written + digest.as_bytes().len() as u64,
            consolidated,
            backup,
            digest: digest.to_hex().to_string(),
        })
    }

    /// Stored bytes for `number`: the standalone store first, then the last
    /// committed artifact. The artifact index is scanned at most once per
    /// checkpoint.
    fn consolidation_source(
        &self,
        number: SegmentNumber,
        previous: &mut Option<ArtifactIndex>,
    ) -> Result<Vec<u8>, CheckpointError> {
        let stored = self
            .segments
            .get(number)
            .map_err(|source| CheckpointError::Io {
                op: "read segment",
                path: self.segments.location(number),
                source,
            })?;
        if let Some(bytes) = stored {
            return Ok(bytes);
        }

        let Some(path) = self.last_artifact.as_deref() else {
            return Err(CheckpointError::Missing { segment: number });
        };
        let unreadable = |source| CheckpointError::PreviousArtifact {
            path: path.to_path_buf(),
            source: Box::new(source),
        };
        if previous.is_none() {
            *previous = Some(ArtifactIndex::scan(path).map_err(unreadable)?);
        }
        let Some(index) = previous.as_ref() else {
            return Err(CheckpointError::Missing { segment: number });
        };
        match index.read_segment(number).map_err(unreadable)? {
            Some(bytes) => {
                tracing::debug!(
                    segment = %number,
                    artifact = %path.display(),
                    "segment taken from previous artifact"
                );
                Ok(bytes)
            }
            None => Err(CheckpointError::Missing { segment: number }),
        }
    }
}
