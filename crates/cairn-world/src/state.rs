//! The [`WorldState`]: everything a checkpoint persists.
//!
//! The world state owns the avatar, the active segment, the global timer
//! queue, the global flags and the bookkeeping needed to find the other
//! segments again (the visited set). It does not own the
//! [`IdentityRegistry`]; mutating helpers take the registry explicitly so the
//! two never drift apart.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::entity::{Actor, Avatar, Item, Position};
use crate::identity::{EntityKind, EntityRecord, Identity, IdentityRegistry, Residence};
use crate::segment::{Segment, SegmentNumber};
use crate::timer::{TimerQueue, TimerScope};
use crate::vision::{field_of_view, VISION_RADIUS};
use crate::WorldError;

// ---------------------------------------------------------------------------
// Projectile
// ---------------------------------------------------------------------------

/// An item in flight across the active segment. Transient: a checkpoint
/// lands it on the floor before writing and relaunches it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projectile {
    pub item: Item,
    pub at: Position,
    pub heading: (i8, i8),
    pub thrown_by: Identity,
}

/// Projectiles landed by [`WorldState::normalize_transients`], waiting to
/// be relaunched.
#[derive(Debug, Default)]
#[must_use = "stashed projectiles are lost unless passed to restore_transients"]
pub struct TransientStash {
    landed: Vec<(Identity, Position, (i8, i8), Identity)>,
}

impl TransientStash {
    pub fn is_empty(&self) -> bool {
        self.landed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WorldState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    /// Seed for segment generation.
    pub seed: u64,
    pub turn: u64,
    pub avatar: Avatar,
    pub flags: BTreeMap<String, i64>,
    pub active: Segment,
    pub timers: TimerQueue,
    /// Every segment that has ever been active, the current one included.
    pub visited: BTreeSet<SegmentNumber>,
    pub in_flight: Vec<Projectile>,
    /// Number of committed checkpoints; drives backup rotation.
    pub checkpoints: u64,
    #[serde(skip)]
    visible: HashSet<Position>,
}

impl PartialEq for WorldState {
    /// Observational equality: persisted fields only.
    fn eq(&self, other: &Self) -> bool {
        self.seed == other.seed
            && self.turn == other.turn
            && self.avatar == other.avatar
            && self.flags == other.flags
            && self.active == other.active
            && self.timers == other.timers
            && self.visited == other.visited
            && self.in_flight == other.in_flight
    }
}

impl WorldState {
    /// A fresh world at turn 0 with `active` as the current segment.
    pub fn new(seed: u64, avatar: Avatar, mut active: Segment) -> Self {
        active.visited = true;
        let mut visited = BTreeSet::new();
        visited.insert(active.number);
        let mut state = Self {
            seed,
            turn: 0,
            avatar,
            flags: BTreeMap::new(),
            active,
            timers: TimerQueue::new(),
            visited,
            in_flight: Vec::new(),
            checkpoints: 0,
            visible: HashSet::new(),
        };
        state.rebuild_indices();
        state
    }

    /// The avatar's tile, if it has been placed on the active segment.
    pub fn avatar_position(&self) -> Option<Position> {
        self.avatar
            .position
            .filter(|pos| self.active.terrain.in_bounds(*pos))
    }

    /// Why the world cannot be checkpointed right now, if it cannot.
    pub fn not_ready_reason(&self) -> Option<&'static str> {
        if self.avatar_position().is_none() {
            Some("avatar has not been placed")
        } else if self.turn == 0 {
            Some("no turn has elapsed")
        } else {
            None
        }
    }

    // -- derived indices ----------------------------------------------------

    /// Rebuild occupancy, stairways and the avatar's field of view.
    pub fn rebuild_indices(&mut self) {
        self.active.rebuild_indices();
        self.refresh_vision();
    }

    /// Recompute only the field of view (cheap; run after avatar moves).
    pub fn refresh_vision(&mut self) {
        self.visible = match self.avatar_position() {
            Some(origin) => field_of_view(&self.active.terrain, origin, VISION_RADIUS),
            None => HashSet::new(),
        };
    }

    pub fn visible(&self) -> &HashSet<Position> {
        &self.visible
    }

    // -- registration -------------------------------------------------------

    /// Register the avatar, everything it carries, in-flight projectiles and
    /// every entity on the active segment.
    pub fn register_resident(&self, registry: &mut IdentityRegistry) -> Result<(), WorldError> {
        self.register_avatar(registry)?;
        self.active.register_entities(registry, true)?;
        for projectile in &self.in_flight {
            registry.register(
                projectile.item.id,
                EntityRecord::on_segment(EntityKind::Item, self.active.number, true),
            )?;
        }
        Ok(())
    }

    /// Register the avatar and its inventory.
    pub fn register_avatar(&self, registry: &mut IdentityRegistry) -> Result<(), WorldError> {
        registry.register(self.avatar.id, EntityRecord::with_avatar(EntityKind::Avatar))?;
        for id in self.avatar.identities().into_iter().skip(1) {
            registry.register(id, EntityRecord::with_avatar(EntityKind::Item))?;
        }
        Ok(())
    }

    // -- spawning -----------------------------------------------------------

    /// Create an actor on the active segment.
    pub fn spawn_actor(
        &mut self,
        registry: &mut IdentityRegistry,
        species: u16,
        name: &str,
        position: Position,
    ) -> Result<Identity, WorldError> {
        let id = registry.allocate();
        self.active.add_actor(Actor::new(id, species, name, position))?;
        registry.register(
            id,
            EntityRecord::on_segment(EntityKind::Actor, self.active.number, true),
        )?;
        Ok(id)
    }

    /// Create an item on the active segment's floor.
    pub fn spawn_floor_item(
        &mut self,
        registry: &mut IdentityRegistry,
        position: Position,
        kind: u16,
        quantity: u32,
    ) -> Result<Identity, WorldError> {
        let id = registry.allocate();
        self.active.drop_item(position, Item::new(id, kind, quantity))?;
        registry.register(
            id,
            EntityRecord::on_segment(EntityKind::Item, self.active.number, true),
        )?;
        Ok(id)
    }

    /// Create an item directly in the avatar's inventory.
    pub fn give_avatar(
        &mut self,
        registry: &mut IdentityRegistry,
        kind: u16,
        quantity: u32,
    ) -> Result<Identity, WorldError> {
        let id = registry.allocate();
        registry.register(id, EntityRecord::with_avatar(EntityKind::Item))?;
        self.avatar.inventory.push(Item::new(id, kind, quantity));
        Ok(id)
    }

    // -- timers -------------------------------------------------------------

    /// Schedule a timer. The target must be registered; a local timer must
    /// target something on the active segment.
    pub fn schedule(
        &mut self,
        registry: &IdentityRegistry,
        scope: TimerScope,
        fire_turn: u64,
        target: Identity,
        kind: u16,
        payload: Vec<u8>,
    ) -> Result<u64, WorldError> {
        let record = registry
            .resolve(target)
            .ok_or(WorldError::UnknownIdentity { identity: target })?;
        match scope {
            TimerScope::Global => self.timers.schedule(fire_turn, target, kind, payload),
            TimerScope::Local => {
                if record.residence != Residence::Segment(self.active.number) {
                    return Err(WorldError::NotOnActiveSegment { identity: target });
                }
                self.active.timers.schedule(fire_turn, target, kind, payload)
            }
        }
    }

    // -- destruction --------------------------------------------------------

    /// Destroy a resident entity and everything it contains, releasing the
    /// identities. Timers aimed at it are left alone; they are dropped when a
    /// later restore fails to relink them.
    pub fn destroy(
        &mut self,
        registry: &mut IdentityRegistry,
        identity: Identity,
    ) -> Result<(), WorldError> {
        if identity == self.avatar.id {
            return Err(WorldError::AvatarIsPermanent);
        }
        let mut released = Vec::new();
        if let Some(actor) = self.active.remove_actor(identity) {
            released.push(actor.id);
            crate::entity::walk_items(&actor.inventory, &mut |i| released.push(i.id));
        } else if let Some(item) = self.take_resident_item(identity) {
            item.walk(&mut |i| released.push(i.id));
        } else {
            return Err(WorldError::NotResident { identity });
        }
        for id in released {
            registry.release(id);
        }
        Ok(())
    }

    /// Find and detach an item anywhere in resident collections.
    fn take_resident_item(&mut self, identity: Identity) -> Option<Item> {
        if self.avatar.equipment.values().any(|worn| *worn == identity) {
            return self.avatar.take_item(identity);
        }
        if let Some(item) = take_nested(&mut self.avatar.inventory, identity) {
            return Some(item);
        }
        for actor in &mut self.active.actors {
            if let Some(item) = take_nested(&mut actor.inventory, identity) {
                return Some(item);
            }
        }
        let mut emptied = None;
        let mut found = None;
        for (pos, pile) in self.active.floor.iter_mut() {
            if let Some(item) = take_nested(pile, identity) {
                if pile.is_empty() {
                    emptied = Some(*pos);
                }
                found = Some(item);
                break;
            }
        }
        if let Some(pos) = emptied {
            self.active.floor.remove(&pos);
        }
        found
    }

    // -- transients ---------------------------------------------------------

    /// Launch an inventory item from the avatar's tile.
    pub fn launch(
        &mut self,
        registry: &mut IdentityRegistry,
        item: Identity,
        heading: (i8, i8),
    ) -> Result<(), WorldError> {
        let at = self
            .avatar_position()
            .ok_or(WorldError::AvatarNotPlaced)?;
        let thrown = self
            .avatar
            .take_item(item)
            .ok_or(WorldError::NotCarried { identity: item })?;
        registry.relocate(item, Residence::Segment(self.active.number), true)?;
        self.in_flight.push(Projectile {
            item: thrown,
            at,
            heading,
            thrown_by: self.avatar.id,
        });
        Ok(())
    }

    /// Land every projectile on the floor at its current tile so the world
    /// holds only storable state.
    pub fn normalize_transients(&mut self) -> Result<TransientStash, WorldError> {
        // Check every landing tile first so a failure leaves nothing landed.
        if let Some(stray) = self
            .in_flight
            .iter()
            .find(|p| !self.active.terrain.in_bounds(p.at))
        {
            return Err(WorldError::OutOfBounds { position: stray.at });
        }
        let mut stash = TransientStash::default();
        for projectile in std::mem::take(&mut self.in_flight) {
            let id = projectile.item.id;
            self.active.drop_item(projectile.at, projectile.item)?;
            stash
                .landed
                .push((id, projectile.at, projectile.heading, projectile.thrown_by));
        }
        Ok(stash)
    }

    /// Put landed projectiles back in flight.
    pub fn restore_transients(&mut self, stash: TransientStash) {
        for (id, at, heading, thrown_by) in stash.landed {
            match self.active.take_floor_item(at, id) {
                Some(item) => self.in_flight.push(Projectile {
                    item,
                    at,
                    heading,
                    thrown_by,
                }),
                None => tracing::warn!(
                    identity = %id,
                    "landed projectile vanished before it could be relaunched"
                ),
            }
        }
    }
}

/// Detach `identity` from an item forest, searching containers recursively.
fn take_nested(items: &mut Vec<Item>, identity: Identity) -> Option<Item> {
    if let Some(index) = items.iter().position(|i| i.id == identity) {
        return Some(items.remove(index));
    }
    items
        .iter_mut()
        .find_map(|item| take_nested(&mut item.contents, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EquipSlot;
    use crate::terrain::{TerrainGrid, Tile};

    fn world() -> (WorldState, IdentityRegistry) {
        let mut registry = IdentityRegistry::new();
        let avatar = Avatar::new(registry.allocate(), "hero");
        let segment = Segment::new(SegmentNumber(1), TerrainGrid::filled(10, 8, Tile::Floor));
        let state = WorldState::new(7, avatar, segment);
        state.register_resident(&mut registry).unwrap();
        (state, registry)
    }

    #[test]
    fn not_ready_until_placed_and_ticked() {
        let (mut state, _) = world();
        assert_eq!(state.not_ready_reason(), Some("avatar has not been placed"));
        state.avatar.position = Some(Position::new(2, 2));
        assert_eq!(state.not_ready_reason(), Some("no turn has elapsed"));
        state.turn = 1;
        assert_eq!(state.not_ready_reason(), None);
    }

    #[test]
    fn local_timer_must_target_active_segment() {
        let (mut state, mut reg) = world();
        let rat = state
            .spawn_actor(&mut reg, 1, "rat", Position::new(3, 3))
            .unwrap();
        let sword = state.give_avatar(&mut reg, 9, 1).unwrap();
        state
            .schedule(&reg, TimerScope::Local, 5, rat, 1, Vec::new())
            .unwrap();
        let err = state
            .schedule(&reg, TimerScope::Local, 5, sword, 1, Vec::new())
            .unwrap_err();
        assert!(matches!(err, WorldError::NotOnActiveSegment { .. }));
        state
            .schedule(&reg, TimerScope::Global, 5, sword, 1, Vec::new())
            .unwrap();
        assert_eq!(state.active.timers.len(), 1);
        assert_eq!(state.timers.len(), 1);
    }

    #[test]
    fn destroy_releases_nested_identities() {
        let (mut state, mut reg) = world();
        let bag = state.give_avatar(&mut reg, 1, 1).unwrap();
        let gem = reg.allocate();
        reg.register(gem, EntityRecord::with_avatar(EntityKind::Item))
            .unwrap();
        state.avatar.inventory[0]
            .contents
            .push(Item::new(gem, 2, 1));
        state.avatar.wear(EquipSlot::Body, bag).unwrap();

        state.destroy(&mut reg, bag).unwrap();
        assert!(reg.resolve(bag).is_none());
        assert!(reg.resolve(gem).is_none());
        assert!(state.avatar.equipment.is_empty());
    }

    #[test]
    fn destroy_unknown_entity_fails() {
        let (mut state, mut reg) = world();
        let ghost = Identity::new(999).unwrap();
        assert!(matches!(
            state.destroy(&mut reg, ghost),
            Err(WorldError::NotResident { .. })
        ));
        let avatar = state.avatar.id;
        assert!(matches!(
            state.destroy(&mut reg, avatar),
            Err(WorldError::AvatarIsPermanent)
        ));
    }

    #[test]
    fn transients_land_and_relaunch() {
        let (mut state, mut reg) = world();
        state.avatar.position = Some(Position::new(4, 4));
        let dagger = state.give_avatar(&mut reg, 3, 1).unwrap();
        state.launch(&mut reg, dagger, (1, 0)).unwrap();
        assert_eq!(state.in_flight.len(), 1);

        let stash = state.normalize_transients().unwrap();
        assert!(state.in_flight.is_empty());
        assert_eq!(state.active.floor[&Position::new(4, 4)][0].id, dagger);

        state.restore_transients(stash);
        assert_eq!(state.in_flight.len(), 1);
        assert!(state.active.floor.is_empty());
    }

    #[test]
    fn vision_follows_avatar() {
        let (mut state, _) = world();
        assert!(state.visible().is_empty());
        state.avatar.position = Some(Position::new(0, 0));
        state.refresh_vision();
        assert!(state.visible().contains(&Position::new(3, 3)));
        assert!(!state.visible().contains(&Position::new(9, 7)));
    }
}
