//! Restore a world from a committed artifact, and bring stored segments back
//! into play.
//!
//! Restore walks the artifact front to back. The player block and active
//! segment come first, then the world block; every later record is validated
//! and pushed out to the standalone segment store. References are relinked
//! twice, once with only the resident world registered and once after every
//! segment has been decoded.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use cairn_world::identity::IdentityRegistry;
use cairn_world::segment::{Segment, SegmentNumber};
use cairn_world::state::WorldState;

use crate::artifact::{ArtifactIndex, ArtifactReader};
use crate::codec::{
    decode_player_block, decode_segment, decode_world_block, to_bytes, SegmentSlot,
};
use crate::relink::{relink, relink_segment, RelinkPass};
use crate::store::SaveStore;
use crate::RestoreError;

impl SaveStore {
    /// Rebuild the world saved in `source`.
    ///
    /// `registry` is reset first and ends up holding every entity in the
    /// artifact: the active segment's as resident, every other segment's as
    /// at rest. The segment store is cleared and refilled with the non-active
    /// segments. On failure both are reset again and the returned error is
    /// the only outcome; nothing half-restored is handed back.
    pub fn restore(
        &mut self,
        source: &Path,
        registry: &mut IdentityRegistry,
    ) -> Result<WorldState, RestoreError> {
        let started = Instant::now();

        // 1. Start from nothing.
        registry.reset();
        self.last_artifact = None;
        self.segments
            .clear()
            .map_err(|error| RestoreError::Io {
                op: "clear segment store",
                path: self.config.segment_dir.clone(),
                source: error,
            })?;

        match self.restore_from(source, registry) {
            Ok(state) => {
                self.last_artifact = Some(source.to_path_buf());
                tracing::info!(
                    path = %source.display(),
                    turn = state.turn,
                    active = %state.active.number,
                    segments = state.visited.len(),
                    entities = registry.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "restore complete"
                );
                Ok(state)
            }
            Err(error) => {
                registry.reset();
                if let Err(clear_error) = self.segments.clear() {
                    tracing::warn!(%clear_error, "could not clear segment store after failed restore");
                }
                tracing::warn!(path = %source.display(), %error, "restore failed");
                Err(error)
            }
        }
    }

    fn restore_from(
        &mut self,
        source: &Path,
        registry: &mut IdentityRegistry,
    ) -> Result<WorldState, RestoreError> {
        let mut reader = ArtifactReader::open(source)?;
        reader.read_header()?;

        // 2. Player block, then the active segment as resident.
        let player = decode_player_block(&reader.read_block("player block")?)
            .map_err(|e| RestoreError::codec("player block", e))?;
        let Some((active_number, active_bytes)) = reader.next_record()? else {
            return Err(RestoreError::corrupt(
                "end tag where the active segment record belongs",
            ));
        };
        let active_hash = blake3::hash(&active_bytes);
        let active = decode_segment(&active_bytes, active_number, registry, SegmentSlot::Active)
            .map_err(|e| RestoreError::codec(format_args!("active segment {active_number}"), e))?;

        // 3. World block.
        let block = decode_world_block(&reader.read_block("world block")?)
            .map_err(|e| RestoreError::codec("world block", e))?;
        if block.avatar.id != player.avatar {
            return Err(RestoreError::corrupt(format!(
                "player block names avatar {} but world block holds {}",
                player.avatar, block.avatar.id
            )));
        }
        if block.seed != player.seed || block.turn != player.turn {
            return Err(RestoreError::corrupt(
                "player block and world block disagree on seed or turn",
            ));
        }
        let mut state = block
            .into_state(active)
            .map_err(|e| RestoreError::codec("world block", e))?;
        state
            .register_resident(registry)
            .map_err(|e| RestoreError::corrupt(format!("resident world: {e}")))?;
        registry.raise_high_water(player.high_water);
        relink(&mut state, registry, RelinkPass::Initial);

        // 4. Push every other segment out to the standalone store.
        let mut extracted = BTreeSet::new();
        let mut last = None;
        while let Some((number, bytes)) = reader.next_record()? {
            if number == state.active.number {
                return Err(RestoreError::corrupt(format!(
                    "active segment {number} appears twice"
                )));
            }
            if !state.visited.contains(&number) {
                return Err(RestoreError::corrupt(format!(
                    "segment {number} is stored but was never visited"
                )));
            }
            if last.is_some_and(|prev| number <= prev) {
                return Err(RestoreError::corrupt(format!(
                    "segment {number} is out of order or duplicated"
                )));
            }
            last = Some(number);

            decode_segment(&bytes, number, registry, SegmentSlot::Stored)
                .map_err(|e| RestoreError::codec(format_args!("segment {number}"), e))?;
            self.segments
                .put(number, &bytes)
                .map_err(|error| RestoreError::Io {
                    op: "store segment",
                    path: self.segments.location(number),
                    source: error,
                })?;
            extracted.insert(number);
        }

        // 5. Digest, and nothing visited may be missing.
        reader.finish()?;
        if let Some(missing) = state
            .visited
            .iter()
            .find(|n| **n != state.active.number && !extracted.contains(*n))
        {
            return Err(RestoreError::corrupt(format!(
                "visited segment {missing} has no record"
            )));
        }

        // 6. The active segment must re-encode to exactly what was read.
        let reencoded = blake3::hash(&to_bytes(&state.active));
        if reencoded != active_hash {
            return Err(RestoreError::corrupt(format!(
                "active segment {} does not re-encode to its stored bytes",
                state.active.number
            )));
        }

        // 7. Everything is registered now; drop what can never resolve.
        let report = relink(&mut state, registry, RelinkPass::Final);
        if report.dropped > 0 {
            tracing::warn!(dropped = report.dropped, "dropped references to destroyed entities");
        }

        // 8. Derived indices.
        state.rebuild_indices();
        Ok(state)
    }

    /// Bring a stored segment back as the active one.
    ///
    /// Looks in the standalone store first, then in the last committed or
    /// restored artifact. Returns `None` when the segment has never been
    /// stored, meaning it should be generated. Entities are registered as
    /// resident and the standalone copy, if any, is removed.
    pub fn load_segment(
        &mut self,
        number: SegmentNumber,
        registry: &mut IdentityRegistry,
    ) -> Result<Option<Segment>, RestoreError> {
        let stored = self
            .segments
            .get(number)
            .map_err(|error| RestoreError::Io {
                op: "read segment",
                path: self.segments.location(number),
                source: error,
            })?;
        let (bytes, from_store) = match stored {
            Some(bytes) => (bytes, true),
            None => {
                let Some(path) = self.last_artifact.as_deref() else {
                    return Ok(None);
                };
                match ArtifactIndex::scan(path)?.read_segment(number)? {
                    Some(bytes) => (bytes, false),
                    None => return Ok(None),
                }
            }
        };

        let mut segment = decode_segment(&bytes, number, registry, SegmentSlot::Active)
            .map_err(|e| RestoreError::codec(format_args!("stored copy of segment {number}"), e))?;
        relink_segment(&mut segment, registry, RelinkPass::Final);
        segment.rebuild_indices();

        if from_store {
            if let Err(error) = self.segments.remove(number) {
                tracing::warn!(segment = %number, %error, "could not remove loaded segment from store");
            }
        }
        tracing::debug!(segment = %number, from_store, bytes = bytes.len(), "loaded segment");
        Ok(Some(segment))
    }
}
