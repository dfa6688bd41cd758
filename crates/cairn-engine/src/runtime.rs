//! The turn driver.
//!
//! A [`Runtime`] is owned by the simulation thread. Each call to
//! [`Runtime::run_turn`]:
//!
//! 1. Drains the command queue and hands every command, in arrival order, to
//!    the host's [`Rules`].
//! 2. Advances the turn counter.
//! 3. Fires due timers, the global queue first and then the active
//!    segment's queue.
//! 4. Refreshes the avatar's field of view and publishes a live snapshot.
//!
//! Checkpoint and restore go through the same object, so a host never has to
//! keep the world, the registry and the segment store in step by hand.
//!
//! # Example
//!
//! ```
//! use cairn_engine::prelude::*;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut config = RuntimeConfig::default();
//! config.persist.segment_dir = dir.path().join("segments");
//! config.persist.sync = false;
//!
//! let mut runtime = Runtime::new(config);
//! runtime.new_game("wanderer").unwrap();
//! for _ in 0..3 {
//!     runtime.run_turn(&mut NoRules).unwrap();
//! }
//! runtime.travel(SegmentNumber(2)).unwrap();
//! assert_eq!(runtime.world().unwrap().active.number, SegmentNumber(2));
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cairn_persist::checkpoint::CheckpointReport;
use cairn_persist::config::PersistConfig;
use cairn_persist::store::SaveStore;
use cairn_world::command::{CommandQueue, CommandSender, CommandToken};
use cairn_world::entity::Avatar;
use cairn_world::generate::SegmentGenerator;
use cairn_world::identity::{Identity, IdentityRegistry};
use cairn_world::segment::SegmentNumber;
use cairn_world::state::WorldState;
use cairn_world::timer::{TimerEvent, TimerQueue, TimerScope};
use cairn_world::WorldError;

use crate::snapshot::SnapshotPublisher;
use crate::RuntimeError;

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Everything a [`Runtime`] needs to start a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Seed for segment generation.
    pub seed: u64,
    /// Generated segment size. Both must be at least
    /// [`MIN_DIMENSION`](cairn_world::generate::MIN_DIMENSION).
    pub segment_width: u16,
    pub segment_height: u16,
    /// Pending commands held before producers see `QueueFull`.
    pub command_capacity: usize,
    pub persist: PersistConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 0x5EED,
            segment_width: 40,
            segment_height: 20,
            command_capacity: 64,
            persist: PersistConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Game rules plugged into the turn loop. Both hooks default to doing
/// nothing.
pub trait Rules {
    /// Apply one queued command.
    fn on_command(
        &mut self,
        world: &mut WorldState,
        registry: &mut IdentityRegistry,
        command: CommandToken,
    ) -> Result<(), WorldError> {
        let _ = (world, registry, command);
        Ok(())
    }

    /// React to a timer whose target is resident.
    fn on_timer(
        &mut self,
        world: &mut WorldState,
        registry: &mut IdentityRegistry,
        event: &TimerEvent,
    ) -> Result<(), WorldError> {
        let _ = (world, registry, event);
        Ok(())
    }
}

/// Rules that ignore every command and timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRules;

impl Rules for NoRules {}

/// What became of a popped timer.
enum Disposition {
    Fire,
    /// Target is registered but at rest; try again next turn.
    Defer,
    Drop,
}

fn dispose(event: &TimerEvent, registry: &IdentityRegistry) -> Disposition {
    if event.target.needs_fixup() {
        return Disposition::Drop;
    }
    match registry.resolve(event.target.identity()) {
        Some(record) if record.resident => Disposition::Fire,
        Some(_) => Disposition::Defer,
        None => Disposition::Drop,
    }
}

fn queue_mut(world: &mut WorldState, scope: TimerScope) -> &mut TimerQueue {
    match scope {
        TimerScope::Global => &mut world.timers,
        TimerScope::Local => &mut world.active.timers,
    }
}

/// Fire every event in `scope` due on or before `world.turn`. Returns how
/// many fired.
///
/// If a callback fails, its event goes back where it was and every event
/// deferred so far is re-queued before the error is returned.
fn fire_due(
    world: &mut WorldState,
    registry: &mut IdentityRegistry,
    rules: &mut dyn Rules,
    scope: TimerScope,
) -> Result<usize, RuntimeError> {
    let turn = world.turn;
    let mut fired = 0;
    let mut deferred = Vec::new();
    let mut outcome = Ok(());
    while let Some(event) = queue_mut(world, scope).pop_due(turn) {
        match dispose(&event, registry) {
            Disposition::Fire => {
                if let Err(error) = rules.on_timer(world, registry, &event) {
                    tracing::warn!(
                        identity = %event.target.identity(),
                        kind = event.kind,
                        seq = event.seq,
                        ?scope,
                        %error,
                        "timer callback failed; event kept"
                    );
                    let fire_turn = event.fire_turn;
                    queue_mut(world, scope).defer(event, fire_turn);
                    outcome = Err(error);
                    break;
                }
                fired += 1;
            }
            Disposition::Defer => deferred.push(event),
            Disposition::Drop => tracing::warn!(
                identity = %event.target.identity(),
                kind = event.kind,
                seq = event.seq,
                ?scope,
                "dropping timer with unknown target"
            ),
        }
    }
    let queue = queue_mut(world, scope);
    for event in deferred {
        queue.defer(event, turn + 1);
    }
    outcome?;
    Ok(fired)
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    config: RuntimeConfig,
    generator: SegmentGenerator,
    registry: IdentityRegistry,
    saves: SaveStore,
    world: Option<WorldState>,
    commands: CommandQueue,
    publisher: Arc<SnapshotPublisher>,
    /// Set by a failed restore, cleared by `reset`, `new_game` or a
    /// successful restore.
    poisoned: bool,
}

impl Runtime {
    /// Create an idle runtime. Call [`new_game`](Self::new_game) or
    /// [`restore`](Self::restore) before running turns.
    ///
    /// # Panics
    ///
    /// Panics if `command_capacity` is zero or a segment dimension is below
    /// [`MIN_DIMENSION`](cairn_world::generate::MIN_DIMENSION).
    pub fn new(config: RuntimeConfig) -> Self {
        let generator =
            SegmentGenerator::new(config.seed, config.segment_width, config.segment_height);
        let commands = CommandQueue::new(config.command_capacity);
        let saves = SaveStore::new(config.persist.clone());
        Self {
            config,
            generator,
            registry: IdentityRegistry::new(),
            saves,
            world: None,
            commands,
            publisher: Arc::new(SnapshotPublisher::new()),
            poisoned: false,
        }
    }

    /// Like [`new`](Self::new) but over a caller-provided save store.
    pub fn with_saves(config: RuntimeConfig, saves: SaveStore) -> Self {
        let mut runtime = Self::new(config);
        runtime.saves = saves;
        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Handle for observer threads.
    pub fn publisher(&self) -> Arc<SnapshotPublisher> {
        Arc::clone(&self.publisher)
    }

    /// Handle for command producers.
    pub fn sender(&self) -> CommandSender {
        self.commands.sender()
    }

    pub fn world(&self) -> Option<&WorldState> {
        self.world.as_ref()
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn saves(&self) -> &SaveStore {
        &self.saves
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Mutable access to the live world and registry together, for hosts
    /// editing the world outside of a turn.
    pub fn session_mut(
        &mut self,
    ) -> Result<(&mut WorldState, &mut IdentityRegistry), RuntimeError> {
        if self.poisoned {
            return Err(RuntimeError::Poisoned);
        }
        let world = self.world.as_mut().ok_or(RuntimeError::NoSession)?;
        Ok((world, &mut self.registry))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Throw away the current game, the standalone segment store, pending
    /// commands and the published snapshot.
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        self.world = None;
        self.poisoned = false;
        self.registry.reset();
        let dropped = self.commands.clear();
        self.publisher.clear();
        let removed = self.saves.reset().map_err(|source| RuntimeError::Io {
            op: "clear segment store",
            path: self.config.persist.segment_dir.clone(),
            source,
        })?;
        tracing::debug!(dropped, removed, "runtime reset");
        Ok(())
    }

    /// Start a fresh game on the first segment.
    pub fn new_game(&mut self, avatar_name: &str) -> Result<(), RuntimeError> {
        self.reset()?;
        let first = self
            .generator
            .generate(SegmentNumber::FIRST, &mut self.registry)?;
        let mut avatar = Avatar::new(self.registry.allocate(), avatar_name);
        avatar.position = first.stairway(true).map(|s| s.position);
        let world = WorldState::new(self.config.seed, avatar, first);
        world.register_avatar(&mut self.registry)?;
        self.publisher.publish(&world);
        tracing::info!(
            seed = self.config.seed,
            entities = self.registry.len(),
            "new game"
        );
        self.world = Some(world);
        Ok(())
    }

    // -- turns --------------------------------------------------------------

    /// Run one turn. Returns the new turn number.
    pub fn run_turn(&mut self, rules: &mut dyn Rules) -> Result<u64, RuntimeError> {
        if self.poisoned {
            return Err(RuntimeError::Poisoned);
        }
        let world = self.world.as_mut().ok_or(RuntimeError::NoSession)?;

        // 1. Commands, in arrival order.
        for command in self.commands.drain() {
            rules.on_command(world, &mut self.registry, command)?;
        }

        // 2. Advance.
        world.turn += 1;

        // 3. Timers, global before local.
        let global = fire_due(world, &mut self.registry, rules, TimerScope::Global)?;
        let local = fire_due(world, &mut self.registry, rules, TimerScope::Local)?;

        // 4. Vision and snapshot.
        world.refresh_vision();
        self.publisher.publish(world);

        tracing::trace!(turn = world.turn, global, local, "turn complete");
        Ok(world.turn)
    }

    /// Schedule a timer in the live world.
    pub fn schedule(
        &mut self,
        scope: TimerScope,
        fire_turn: u64,
        target: Identity,
        kind: u16,
        payload: Vec<u8>,
    ) -> Result<u64, RuntimeError> {
        let (world, registry) = self.session_mut()?;
        Ok(world.schedule(registry, scope, fire_turn, target, kind, payload)?)
    }

    /// Destroy a resident entity. Timers aimed at it stay queued and are
    /// dropped when they come due.
    pub fn destroy(&mut self, identity: Identity) -> Result<(), RuntimeError> {
        let (world, registry) = self.session_mut()?;
        Ok(world.destroy(registry, identity)?)
    }

    /// Throw an inventory item from the avatar's tile.
    pub fn launch(&mut self, item: Identity, heading: (i8, i8)) -> Result<(), RuntimeError> {
        let (world, registry) = self.session_mut()?;
        Ok(world.launch(registry, item, heading)?)
    }

    // -- travel -------------------------------------------------------------

    /// Make segment `to` the active one.
    ///
    /// The departing segment goes to rest in the standalone store, with any
    /// in-flight projectiles landed on its floor. The arriving segment is
    /// loaded from the store or the last artifact, or generated if it has
    /// never existed. On failure the departing segment stays active.
    pub fn travel(&mut self, to: SegmentNumber) -> Result<(), RuntimeError> {
        if self.poisoned {
            return Err(RuntimeError::Poisoned);
        }
        let world = self.world.as_mut().ok_or(RuntimeError::NoSession)?;
        let from = world.active.number;
        if to == from || !to.is_valid() {
            return Err(RuntimeError::BadDestination { to });
        }

        // 1. Land projectiles on the departing floor.
        let stash = world.normalize_transients()?;

        // 2. Put the departing segment to rest.
        if let Err(error) = self.saves.stash_segment(&world.active) {
            world.restore_transients(stash);
            return Err(error.into());
        }
        self.registry.set_resident(from, false);

        // 3. Load or generate the arriving one.
        let arriving = match self.saves.load_segment(to, &mut self.registry) {
            Ok(Some(segment)) => Ok(segment),
            Ok(None) => self
                .generator
                .generate(to, &mut self.registry)
                .map_err(RuntimeError::from),
            Err(error) => Err(error.into()),
        };
        let mut arriving = match arriving {
            Ok(segment) => segment,
            Err(error) => {
                self.registry.set_resident(from, true);
                world.restore_transients(stash);
                tracing::warn!(from = %from, to = %to, %error, "travel failed");
                return Err(error);
            }
        };
        let landed = !stash.is_empty();

        // 4. Swap in and place the avatar on the stairs it came through.
        arriving.visited = true;
        let down = to > from;
        world.avatar.position = arriving
            .stairway(!down)
            .or_else(|| arriving.stairway(down))
            .map(|s| s.position);
        world.active = arriving;
        world.visited.insert(to);
        world.rebuild_indices();

        tracing::debug!(from = %from, to = %to, landed, "travelled");
        Ok(())
    }

    // -- persistence --------------------------------------------------------

    /// Checkpoint the live world to `path`. Observers keep seeing the last
    /// published snapshot while the write is in progress.
    pub fn checkpoint(&mut self, path: &Path) -> Result<CheckpointReport, RuntimeError> {
        if self.poisoned {
            return Err(RuntimeError::Poisoned);
        }
        let world = self.world.as_mut().ok_or(RuntimeError::NoSession)?;
        self.publisher.suspend();
        let outcome = self.saves.checkpoint(world, &self.registry, path);
        self.publisher.resume();
        Ok(outcome?)
    }

    /// Replace the current game with the one saved at `path`.
    ///
    /// Pending commands are discarded. On failure the runtime is left
    /// poisoned with no world; only [`reset`](Self::reset),
    /// [`new_game`](Self::new_game) or another restore will clear it.
    pub fn restore(&mut self, path: &Path) -> Result<u64, RuntimeError> {
        self.publisher.suspend();
        self.commands.clear();
        self.world = None;
        match self.saves.restore(path, &mut self.registry) {
            Ok(world) => {
                self.poisoned = false;
                self.publisher.clear();
                self.publisher.publish(&world);
                let turn = world.turn;
                self.world = Some(world);
                Ok(turn)
            }
            Err(error) => {
                self.poisoned = true;
                self.publisher.clear();
                tracing::warn!(path = %path.display(), "runtime poisoned by failed restore");
                Err(error.into())
            }
        }
    }

    /// Whether a committed artifact exists at `path`.
    pub fn exists(&self, path: &Path) -> bool {
        self.saves.exists(path)
    }

    /// Delete the artifact at `path`. Returns whether one was removed.
    pub fn delete(&mut self, path: &Path) -> Result<bool, RuntimeError> {
        self.saves
            .delete(path)
            .map_err(|source| RuntimeError::Io {
                op: "delete artifact",
                path: path.to_path_buf(),
                source,
            })
    }

    /// The live world as pretty-printed JSON, for debugging.
    pub fn debug_dump(&self) -> Result<String, RuntimeError> {
        let world = self.world.as_ref().ok_or(RuntimeError::NoSession)?;
        Ok(serde_json::to_string_pretty(world)?)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("turn", &self.world.as_ref().map(|w| w.turn))
            .field("entities", &self.registry.len())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_world::entity::Position;

    fn config(dir: &Path) -> RuntimeConfig {
        RuntimeConfig {
            seed: 42,
            segment_width: 16,
            segment_height: 10,
            command_capacity: 4,
            persist: PersistConfig {
                segment_dir: dir.join("segments"),
                backup_slots: 0,
                sync: false,
            },
        }
    }

    /// Records what it was asked to do.
    #[derive(Default)]
    struct Recorder {
        commands: Vec<Vec<u8>>,
        timers: Vec<(u64, u16)>,
    }

    impl Rules for Recorder {
        fn on_command(
            &mut self,
            _world: &mut WorldState,
            _registry: &mut IdentityRegistry,
            command: CommandToken,
        ) -> Result<(), WorldError> {
            self.commands.push(command.as_bytes().to_vec());
            Ok(())
        }

        fn on_timer(
            &mut self,
            world: &mut WorldState,
            _registry: &mut IdentityRegistry,
            event: &TimerEvent,
        ) -> Result<(), WorldError> {
            self.timers.push((world.turn, event.kind));
            Ok(())
        }
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn zero_capacity_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.command_capacity = 0;
        Runtime::new(config);
    }

    #[test]
    fn config_reads_partial_json() {
        let config =
            RuntimeConfig::from_json_str(r#"{ "seed": 9, "persist": { "sync": false } }"#)
                .unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.segment_width, 40);
        assert!(!config.persist.sync);
        assert!(RuntimeConfig::from_json_str(r#"{ "sead": 9 }"#).is_err());
    }

    #[test]
    fn turns_need_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(config(dir.path()));
        assert!(matches!(
            runtime.run_turn(&mut NoRules),
            Err(RuntimeError::NoSession)
        ));
        assert!(runtime.debug_dump().is_err());
    }

    #[test]
    fn commands_arrive_in_order_and_queue_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        let sender = runtime.sender();
        for byte in 0..4u8 {
            sender.try_send(CommandToken::new(vec![byte])).unwrap();
        }
        assert!(matches!(
            sender.try_send(CommandToken::new(vec![9])),
            Err(WorldError::QueueFull)
        ));

        let mut rules = Recorder::default();
        assert_eq!(runtime.run_turn(&mut rules).unwrap(), 1);
        assert_eq!(rules.commands, vec![vec![0], vec![1], vec![2], vec![3]]);
        sender.try_send(CommandToken::new(vec![5])).unwrap();
    }

    #[test]
    fn global_timers_fire_before_local_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        let actor = runtime.world().unwrap().active.actors[0].id;
        runtime
            .schedule(TimerScope::Local, 2, actor, 10, Vec::new())
            .unwrap();
        runtime
            .schedule(TimerScope::Global, 2, actor, 20, Vec::new())
            .unwrap();
        runtime
            .schedule(TimerScope::Global, 1, actor, 30, Vec::new())
            .unwrap();

        let mut rules = Recorder::default();
        runtime.run_turn(&mut rules).unwrap();
        runtime.run_turn(&mut rules).unwrap();
        assert_eq!(rules.timers, vec![(1, 30), (2, 20), (2, 10)]);
    }

    #[test]
    fn timers_for_absent_targets_wait_or_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        let (first_actor, second_actor) = {
            let actors = &runtime.world().unwrap().active.actors;
            (actors[0].id, actors[1].id)
        };
        runtime
            .schedule(TimerScope::Global, 1, first_actor, 1, Vec::new())
            .unwrap();
        runtime
            .schedule(TimerScope::Global, 1, second_actor, 2, Vec::new())
            .unwrap();
        runtime.destroy(second_actor).unwrap();
        runtime.travel(SegmentNumber(2)).unwrap();

        let mut rules = Recorder::default();
        runtime.run_turn(&mut rules).unwrap();
        assert!(rules.timers.is_empty());
        // The at-rest target's timer waits; the destroyed one is gone.
        assert_eq!(runtime.world().unwrap().timers.len(), 1);
        assert_eq!(runtime.world().unwrap().timers.peek().unwrap().fire_turn, 2);

        runtime.travel(SegmentNumber(1)).unwrap();
        runtime.run_turn(&mut rules).unwrap();
        assert_eq!(rules.timers, vec![(2, 1)]);
    }

    /// Fails every timer of one kind.
    struct Refuse(u16);

    impl Rules for Refuse {
        fn on_timer(
            &mut self,
            _world: &mut WorldState,
            _registry: &mut IdentityRegistry,
            event: &TimerEvent,
        ) -> Result<(), WorldError> {
            if event.kind == self.0 {
                return Err(WorldError::NotResident {
                    identity: event.target.identity(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn failed_timer_callback_keeps_pending_timers() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        let first_actor = runtime.world().unwrap().active.actors[0].id;
        runtime
            .schedule(TimerScope::Global, 1, first_actor, 1, Vec::new())
            .unwrap();
        runtime.travel(SegmentNumber(2)).unwrap();
        let second_actor = runtime.world().unwrap().active.actors[0].id;
        runtime
            .schedule(TimerScope::Global, 1, second_actor, 2, Vec::new())
            .unwrap();

        assert!(matches!(
            runtime.run_turn(&mut Refuse(2)),
            Err(RuntimeError::World(WorldError::NotResident { .. }))
        ));
        let timers = &runtime.world().unwrap().timers;
        let pending: Vec<(u64, u16)> = timers.iter().map(|e| (e.fire_turn, e.kind)).collect();
        assert_eq!(pending, vec![(1, 2), (2, 1)]);

        let mut rules = Recorder::default();
        runtime.run_turn(&mut rules).unwrap();
        assert_eq!(rules.timers, vec![(2, 2)]);
        assert_eq!(runtime.world().unwrap().timers.len(), 1);
    }

    #[test]
    fn travel_round_trip_keeps_the_segment() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let saves = SaveStore::with_store(
            config.persist.clone(),
            Box::new(cairn_persist::store::MemorySegmentStore::new()),
        );
        let mut runtime = Runtime::with_saves(config, saves);
        runtime.new_game("wanderer").unwrap();
        runtime.run_turn(&mut NoRules).unwrap();
        let before = runtime.world().unwrap().active.clone();
        let entities = runtime.registry().len();

        runtime.travel(SegmentNumber(2)).unwrap();
        assert!(runtime
            .saves()
            .segments()
            .numbers()
            .unwrap()
            .contains(&SegmentNumber(1)));
        assert!(matches!(
            runtime.travel(SegmentNumber(2)),
            Err(RuntimeError::BadDestination { .. })
        ));

        runtime.travel(SegmentNumber(1)).unwrap();
        let world = runtime.world().unwrap();
        assert_eq!(world.active, before);
        assert!(world.avatar_position().is_some());
        assert_eq!(
            world.visited.iter().copied().collect::<Vec<_>>(),
            vec![SegmentNumber(1), SegmentNumber(2)]
        );
        assert!(runtime.registry().len() > entities);
    }

    #[test]
    fn projectiles_land_when_leaving() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        let (world, registry) = runtime.session_mut().unwrap();
        let rock = world.give_avatar(registry, 3, 1).unwrap();
        let at: Position = world.avatar_position().unwrap();
        runtime.launch(rock, (1, 0)).unwrap();

        runtime.travel(SegmentNumber(2)).unwrap();
        runtime.travel(SegmentNumber(1)).unwrap();
        let world = runtime.world().unwrap();
        assert!(world.in_flight.is_empty());
        assert!(world.active.floor[&at].iter().any(|item| item.id == rock));
    }

    #[test]
    fn checkpoint_refused_before_first_turn() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cairn.sav");
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        let err = runtime.checkpoint(&target).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Checkpoint(cairn_persist::CheckpointError::NotReady { .. })
        ));
        assert!(!runtime.exists(&target));
        assert!(!runtime.publisher().is_suspended());
    }

    #[test]
    fn failed_restore_poisons_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cairn.sav");
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        runtime.run_turn(&mut NoRules).unwrap();
        runtime.checkpoint(&target).unwrap();

        let mut bytes = std::fs::read(&target).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x40;
        std::fs::write(&target, bytes).unwrap();

        assert!(matches!(
            runtime.restore(&target),
            Err(RuntimeError::Restore(_))
        ));
        assert!(runtime.is_poisoned());
        assert!(runtime.world().is_none());
        assert_eq!(runtime.registry().len(), 0);
        assert!(matches!(
            runtime.run_turn(&mut NoRules),
            Err(RuntimeError::Poisoned)
        ));
        assert!(matches!(
            runtime.checkpoint(&target),
            Err(RuntimeError::Poisoned)
        ));

        runtime.reset().unwrap();
        assert!(!runtime.is_poisoned());
        runtime.new_game("again").unwrap();
        assert_eq!(runtime.run_turn(&mut NoRules).unwrap(), 1);
    }

    #[test]
    fn debug_dump_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = Runtime::new(config(dir.path()));
        runtime.new_game("wanderer").unwrap();
        runtime.run_turn(&mut NoRules).unwrap();
        let dump = runtime.debug_dump().unwrap();
        let value: serde_json::Value = serde_json::from_str(&dump).unwrap();
        assert_eq!(value["turn"], 1);
        assert_eq!(value["avatar"]["name"], "wanderer");
    }
}
