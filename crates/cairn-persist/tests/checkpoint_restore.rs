//! Checkpoint and restore across several segments: round trips, commit
//! atomicity, corruption handling, backup rotation and relink convergence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cairn_persist::prelude::*;
use cairn_persist::artifact::ArtifactReader;
use cairn_persist::codec::{decode_player_block, decode_world_block};
use cairn_persist::{atomic, backup};
use cairn_world::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SEED: u64 = 0x00C0_FFEE;

fn config(dir: &Path) -> PersistConfig {
    PersistConfig {
        segment_dir: dir.join("segments"),
        backup_slots: 2,
        sync: false,
    }
}

/// A fresh world on segment 1 with the avatar on the down stairs.
fn new_world(registry: &mut IdentityRegistry) -> (WorldState, SegmentGenerator) {
    let generator = SegmentGenerator::new(SEED, 16, 10);
    let first = generator.generate(SegmentNumber::FIRST, registry).unwrap();
    let mut avatar = Avatar::new(registry.allocate(), "wanderer");
    avatar.position = first.stairway(true).map(|s| s.position);
    let state = WorldState::new(SEED, avatar, first);
    state.register_avatar(registry).unwrap();
    (state, generator)
}

/// Leave the active segment for `to`, the way a host moves between segments.
fn travel(
    saves: &mut SaveStore,
    state: &mut WorldState,
    registry: &mut IdentityRegistry,
    generator: &SegmentGenerator,
    to: SegmentNumber,
) {
    let from = state.active.number;
    saves.stash_segment(&state.active).unwrap();
    registry.set_resident(from, false);

    let mut arriving = match saves.load_segment(to, registry).unwrap() {
        Some(segment) => segment,
        None => generator.generate(to, registry).unwrap(),
    };
    arriving.visited = true;
    let down = to > from;
    state.avatar.position = arriving
        .stairway(!down)
        .or_else(|| arriving.stairway(down))
        .map(|s| s.position);
    state.active = arriving;
    state.visited.insert(to);
    state.rebuild_indices();
}

/// Three segments deep, with timers aimed across segment boundaries.
fn three_segment_world(
    saves: &mut SaveStore,
    registry: &mut IdentityRegistry,
) -> (WorldState, SegmentGenerator, Identity) {
    let (mut state, generator) = new_world(registry);
    state.turn = 5;
    let first_actor = state.active.actors[0].id;
    state
        .schedule(registry, TimerScope::Local, 40, first_actor, 1, vec![1])
        .unwrap();

    travel(saves, &mut state, registry, &generator, SegmentNumber(2));
    state.turn = 12;
    let sword = state.give_avatar(registry, 17, 1).unwrap();
    state.avatar.wear(EquipSlot::Weapon, sword).unwrap();

    travel(saves, &mut state, registry, &generator, SegmentNumber(3));
    state.turn = 20;
    let third_actor = state.active.actors[0].id;
    // Global timers resolve at different relink passes: the avatar's item
    // during the initial pass, the first segment's actor only at the end.
    state
        .schedule(registry, TimerScope::Global, 30, sword, 2, vec![2, 2])
        .unwrap();
    state
        .schedule(registry, TimerScope::Global, 35, first_actor, 3, Vec::new())
        .unwrap();
    state
        .schedule(registry, TimerScope::Local, 25, third_actor, 4, vec![4; 8])
        .unwrap();
    state.flags.insert("met_oracle".into(), 1);
    (state, generator, first_actor)
}

fn saves_at(dir: &Path) -> SaveStore {
    SaveStore::new(config(dir))
}

// ---------------------------------------------------------------------------
// Round trip
// ---------------------------------------------------------------------------

#[test]
fn three_segment_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _, first_actor) = three_segment_world(&mut saves, &mut registry);

    let report = saves.checkpoint(&mut state, &registry, &target).unwrap();
    assert_eq!(
        report.consolidated,
        vec![SegmentNumber(1), SegmentNumber(2)]
    );
    // Consolidated copies leave the standalone store.
    assert!(saves.segments().numbers().unwrap().is_empty());

    let mut restored_registry = IdentityRegistry::new();
    let restored = saves.restore(&target, &mut restored_registry).unwrap();
    assert_eq!(restored, state);
    assert_eq!(restored.timers.len(), 2);
    assert_eq!(restored.timers.unresolved(), 0);
    assert_eq!(restored_registry.len(), registry.len());
    assert_eq!(restored_registry.high_water(), registry.high_water());

    // The first segment's actor is known but at rest.
    let record = restored_registry.resolve(first_actor).unwrap();
    assert_eq!(record.residence, Residence::Segment(SegmentNumber(1)));
    assert!(!record.resident);

    // Non-active segments are back in the standalone store.
    assert_eq!(
        saves.segments().numbers().unwrap(),
        vec![SegmentNumber(1), SegmentNumber(2)]
    );
}

#[test]
fn second_checkpoint_reads_segments_from_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _, _) = three_segment_world(&mut saves, &mut registry);

    let first = saves.checkpoint(&mut state, &registry, &target).unwrap();
    state.turn += 1;
    let second = saves.checkpoint(&mut state, &registry, &target).unwrap();
    assert_eq!(first.consolidated, second.consolidated);
    assert_ne!(first.digest, second.digest);

    let restored = saves
        .restore(&target, &mut IdentityRegistry::new())
        .unwrap();
    assert_eq!(restored, state);
}

#[test]
fn revisiting_a_segment_keeps_its_state() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, generator, first_actor) = three_segment_world(&mut saves, &mut registry);
    saves.checkpoint(&mut state, &registry, &target).unwrap();

    // Segment 1 now lives only inside the artifact.
    travel(&mut saves, &mut state, &mut registry, &generator, SegmentNumber(1));
    assert!(state.active.actor(first_actor).is_some());
    assert_eq!(state.active.timers.len(), 1);
    assert!(registry.resolve(first_actor).unwrap().resident);
}

#[test]
fn restore_then_checkpoint_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.sav");
    let second = dir.path().join("b.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _, _) = three_segment_world(&mut saves, &mut registry);
    saves.checkpoint(&mut state, &registry, &first).unwrap();

    let mut registry = IdentityRegistry::new();
    let mut restored = saves.restore(&first, &mut registry).unwrap();
    restored.turn += 3;
    saves.checkpoint(&mut restored, &registry, &second).unwrap();

    let again = saves
        .restore(&second, &mut IdentityRegistry::new())
        .unwrap();
    assert_eq!(again, restored);
}

// ---------------------------------------------------------------------------
// Atomicity
// ---------------------------------------------------------------------------

/// A segment store whose reads always fail.
#[derive(Debug, Default)]
struct BrokenStore {
    inner: MemorySegmentStore,
}

impl SegmentStore for BrokenStore {
    fn put(&mut self, number: SegmentNumber, bytes: &[u8]) -> io::Result<()> {
        self.inner.put(number, bytes)
    }
    fn get(&self, _number: SegmentNumber) -> io::Result<Option<Vec<u8>>> {
        Err(io::Error::other("disk on fire"))
    }
    fn remove(&mut self, number: SegmentNumber) -> io::Result<bool> {
        self.inner.remove(number)
    }
    fn clear(&mut self) -> io::Result<usize> {
        self.inner.clear()
    }
    fn numbers(&self) -> io::Result<Vec<SegmentNumber>> {
        self.inner.numbers()
    }
    fn location(&self, number: SegmentNumber) -> PathBuf {
        PathBuf::from(format!("broken://{}", number.0))
    }
}

#[test]
fn failed_consolidation_leaves_previous_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut registry = IdentityRegistry::new();
    let (mut state, _) = new_world(&mut registry);
    state.turn = 1;

    let mut good = saves_at(dir.path());
    good.checkpoint(&mut state, &registry, &target).unwrap();
    let committed = fs::read(&target).unwrap();

    let mut broken = SaveStore::with_store(config(dir.path()), Box::new(BrokenStore::default()));
    state.visited.insert(SegmentNumber(2));
    state.turn = 2;
    let err = broken
        .checkpoint(&mut state, &registry, &target)
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Io { op: "read segment", .. }));
    assert_eq!(fs::read(&target).unwrap(), committed);
    assert!(!atomic::temp_path_for(&target).exists());
    assert_eq!(state.checkpoints, 1);
}

#[test]
fn stray_temporary_file_is_ignored_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _) = new_world(&mut registry);
    state.turn = 3;

    // Left behind by a crash mid-write.
    fs::write(atomic::temp_path_for(&target), b"half an artifact").unwrap();
    saves.checkpoint(&mut state, &registry, &target).unwrap();
    assert!(!atomic::temp_path_for(&target).exists());
    assert!(saves.restore(&target, &mut IdentityRegistry::new()).is_ok());
}

#[test]
fn not_ready_world_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _) = new_world(&mut registry);
    state.avatar.position = None;
    state.turn = 4;

    let err = saves.checkpoint(&mut state, &registry, &target).unwrap_err();
    assert!(matches!(err, CheckpointError::NotReady { .. }));
    assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[test]
fn unwritable_target_reports_the_failing_step() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"x").unwrap();
    let target = blocker.join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _) = new_world(&mut registry);
    state.turn = 4;

    match saves.checkpoint(&mut state, &registry, &target) {
        Err(CheckpointError::Io { op, path, .. }) => {
            assert_eq!(op, "create directory");
            assert_eq!(path, target);
        }
        other => panic!("expected an I/O failure, got {other:?}"),
    }
    assert_eq!(state.checkpoints, 0);
}

// ---------------------------------------------------------------------------
// Corruption
// ---------------------------------------------------------------------------

#[test]
fn corrupt_artifacts_are_rejected_and_reset_state() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _, _) = three_segment_world(&mut saves, &mut registry);
    saves.checkpoint(&mut state, &registry, &target).unwrap();
    let pristine = fs::read(&target).unwrap();

    let damaged = dir.path().join("damaged.sav");
    for at in [0, 20, pristine.len() / 2, pristine.len() - 40, pristine.len() - 1] {
        let mut bytes = pristine.clone();
        bytes[at] ^= 0x5A;
        fs::write(&damaged, &bytes).unwrap();

        let mut fresh = IdentityRegistry::new();
        let err = saves.restore(&damaged, &mut fresh).unwrap_err();
        assert!(
            matches!(err, RestoreError::Corrupt { .. }),
            "flip at {at} gave {err}"
        );
        assert!(fresh.is_empty());
        assert!(saves.segments().numbers().unwrap().is_empty());
        assert!(saves.last_artifact().is_none());
    }

    fs::write(&damaged, &pristine[..pristine.len() - 7]).unwrap();
    assert!(saves.restore(&damaged, &mut IdentityRegistry::new()).is_err());

    let mut padded = pristine.clone();
    padded.push(0);
    fs::write(&damaged, &padded).unwrap();
    assert!(saves.restore(&damaged, &mut IdentityRegistry::new()).is_err());

    // The untouched artifact still restores.
    assert!(saves.restore(&target, &mut IdentityRegistry::new()).is_ok());
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

#[test]
fn backups_rotate_within_configured_slots() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _) = new_world(&mut registry);

    for turn in 1..=6 {
        state.turn = turn;
        let report = saves.checkpoint(&mut state, &registry, &target).unwrap();
        assert_eq!(report.backup.is_some(), turn > 1);
    }
    let backups = backup::list(&target).unwrap();
    assert_eq!(backups.len(), 2);
    for path in backups {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-d1"), "unexpected backup name {name}");
    }
}

// ---------------------------------------------------------------------------
// Relinking
// ---------------------------------------------------------------------------

#[test]
fn timers_on_destroyed_targets_are_dropped_at_restore() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _) = new_world(&mut registry);
    state.turn = 2;
    let doomed = state.active.actors[0].id;
    let survivor = state.give_avatar(&mut registry, 5, 1).unwrap();
    state
        .schedule(&registry, TimerScope::Global, 10, doomed, 1, Vec::new())
        .unwrap();
    state
        .schedule(&registry, TimerScope::Global, 11, survivor, 2, Vec::new())
        .unwrap();
    state.destroy(&mut registry, doomed).unwrap();
    saves.checkpoint(&mut state, &registry, &target).unwrap();

    let restored = saves
        .restore(&target, &mut IdentityRegistry::new())
        .unwrap();
    let targets: Vec<Identity> = restored.timers.iter().map(|e| e.target.identity()).collect();
    assert_eq!(targets, vec![survivor]);
    assert_eq!(restored.timers.next_seq(), state.timers.next_seq());
}

#[test]
fn at_rest_timer_target_resolves_only_after_every_segment() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cairn.sav");
    let mut saves = saves_at(dir.path());
    let mut registry = IdentityRegistry::new();
    let (mut state, _, first_actor) = three_segment_world(&mut saves, &mut registry);
    saves.checkpoint(&mut state, &registry, &target).unwrap();

    let first_actor_link = |world: &WorldState| {
        world
            .timers
            .iter()
            .find(|e| e.target.identity() == first_actor)
            .map(|e| e.target)
    };

    // 1. Player block, active segment and world block only.
    let mut reader = ArtifactReader::open(&target).unwrap();
    reader.read_header().unwrap();
    let player = decode_player_block(&reader.read_block("player block").unwrap()).unwrap();
    let (number, bytes) = reader.next_record().unwrap().unwrap();
    assert_eq!(number, SegmentNumber(3));
    let mut staged = IdentityRegistry::new();
    let active = decode_segment(&bytes, number, &mut staged, SegmentSlot::Active).unwrap();
    let block = decode_world_block(&reader.read_block("world block").unwrap()).unwrap();
    let mut partial = block.into_state(active).unwrap();
    partial.register_resident(&mut staged).unwrap();
    staged.raise_high_water(player.high_water);
    relink(&mut partial, &staged, RelinkPass::Initial);

    assert!(first_actor_link(&partial).unwrap().needs_fixup());
    assert_eq!(partial.timers.unresolved(), 1);

    // 2. Segments 1 and 2 follow; only then can the target be found.
    while let Some((number, bytes)) = reader.next_record().unwrap() {
        decode_segment(&bytes, number, &mut staged, SegmentSlot::Stored).unwrap();
    }
    reader.finish().unwrap();
    relink(&mut partial, &staged, RelinkPass::Final);
    assert_eq!(partial.timers.unresolved(), 0);
    assert_eq!(first_actor_link(&partial), Some(Link::Resolved(first_actor)));

    // 3. A full restore ends in the same place.
    let mut restored_registry = IdentityRegistry::new();
    let restored = saves.restore(&target, &mut restored_registry).unwrap();
    assert_eq!(restored.timers.unresolved(), 0);
    assert_eq!(restored.timers, partial.timers);
    assert_eq!(first_actor_link(&restored), Some(Link::Resolved(first_actor)));
    let record = restored_registry.resolve(first_actor).unwrap();
    assert_eq!(record.residence, Residence::Segment(SegmentNumber(1)));
    assert!(!record.resident);
}
