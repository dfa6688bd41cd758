//! Segments: the unit the world is partitioned into.
//!
//! A [`Segment`] is one dungeon level: its terrain, the actors living on it,
//! the item piles lying on its floor, and its local timers. Exactly one
//! segment is active at a time; the rest are at rest in segment stores or
//! have not been generated yet.
//!
//! Besides the persisted fields a segment carries derived indices (tile
//! occupancy and the stairway registry). They are never encoded and must be
//! rebuilt with [`Segment::rebuild_indices`] after the persisted fields
//! change wholesale.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{walk_items, Actor, Item, Position};
use crate::identity::{EntityKind, EntityRecord, Identity, IdentityRegistry};
use crate::terrain::{TerrainGrid, Tile};
use crate::timer::TimerQueue;
use crate::WorldError;

// ---------------------------------------------------------------------------
// SegmentNumber
// ---------------------------------------------------------------------------

/// Segment number, equal to its depth. Segment numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentNumber(pub u16);

impl SegmentNumber {
    pub const FIRST: SegmentNumber = SegmentNumber(1);
    /// Deepest segment. `u16::MAX` is reserved as the artifact's end marker.
    pub const LAST: SegmentNumber = SegmentNumber(u16::MAX - 1);

    /// The segment below this one; `None` at [`SegmentNumber::LAST`].
    pub fn deeper(self) -> Option<SegmentNumber> {
        (self < Self::LAST).then(|| SegmentNumber(self.0 + 1))
    }

    /// Whether this is a usable segment number (1 through `LAST`).
    pub fn is_valid(self) -> bool {
        self >= Self::FIRST && self <= Self::LAST
    }

    /// The segment above this one; `None` for the first segment.
    pub fn shallower(self) -> Option<SegmentNumber> {
        (self.0 > 1).then(|| SegmentNumber(self.0 - 1))
    }
}

impl fmt::Display for SegmentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stairway
// ---------------------------------------------------------------------------

/// A staircase and the segment it leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stairway {
    pub position: Position,
    pub down: bool,
    pub destination: Option<SegmentNumber>,
}

/// Piles serialize as a list of `(position, items)` pairs, since
/// [`Position`] is not a string and cannot key a JSON object.
mod piles {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::entity::{Item, Position};

    pub fn serialize<S: Serializer>(
        floor: &BTreeMap<Position, Vec<Item>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(floor.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Position, Vec<Item>>, D::Error> {
        let pairs = Vec::<(Position, Vec<Item>)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub number: SegmentNumber,
    pub terrain: TerrainGrid,
    /// Actors in creation order.
    pub actors: Vec<Actor>,
    /// Item piles keyed by tile; iteration is row-major.
    #[serde(with = "piles")]
    pub floor: BTreeMap<Position, Vec<Item>>,
    /// Timers that only run while this segment is active.
    pub timers: TimerQueue,
    pub visited: bool,
    #[serde(skip)]
    occupancy: HashMap<Position, Identity>,
    #[serde(skip)]
    stairways: Vec<Stairway>,
}

impl PartialEq for Segment {
    /// Compares persisted fields only; derived indices are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.terrain == other.terrain
            && self.actors == other.actors
            && self.floor == other.floor
            && self.timers == other.timers
            && self.visited == other.visited
    }
}

impl Eq for Segment {}

impl Segment {
    /// An empty segment over `terrain`, with indices built.
    pub fn new(number: SegmentNumber, terrain: TerrainGrid) -> Self {
        let mut segment = Self {
            number,
            terrain,
            actors: Vec::new(),
            floor: BTreeMap::new(),
            timers: TimerQueue::new(),
            visited: false,
            occupancy: HashMap::new(),
            stairways: Vec::new(),
        };
        segment.rebuild_indices();
        segment
    }

    /// Recompute occupancy and the stairway registry from persisted state.
    pub fn rebuild_indices(&mut self) {
        self.occupancy = self
            .actors
            .iter()
            .map(|actor| (actor.position, actor.id))
            .collect();
        let number = self.number;
        self.stairways = self
            .terrain
            .iter()
            .filter_map(|(position, tile)| match tile {
                Tile::StairsDown => Some(Stairway {
                    position,
                    down: true,
                    destination: number.deeper(),
                }),
                Tile::StairsUp => Some(Stairway {
                    position,
                    down: false,
                    destination: number.shallower(),
                }),
                _ => None,
            })
            .collect();
    }

    /// The actor standing on `pos`, if any.
    pub fn occupant(&self, pos: Position) -> Option<Identity> {
        self.occupancy.get(&pos).copied()
    }

    pub fn stairways(&self) -> &[Stairway] {
        &self.stairways
    }

    /// The staircase leading down (`down = true`) or up.
    pub fn stairway(&self, down: bool) -> Option<Stairway> {
        self.stairways.iter().copied().find(|s| s.down == down)
    }

    // -- entities -----------------------------------------------------------

    /// Every entity on the segment with its kind, in encoding order: actors,
    /// each followed by its inventory, then floor piles row-major.
    pub fn entities(&self) -> Vec<(Identity, EntityKind)> {
        let mut out = Vec::new();
        for actor in &self.actors {
            out.push((actor.id, EntityKind::Actor));
            walk_items(&actor.inventory, &mut |item| out.push((item.id, EntityKind::Item)));
        }
        for pile in self.floor.values() {
            walk_items(pile, &mut |item| out.push((item.id, EntityKind::Item)));
        }
        out
    }

    pub fn entity_count(&self) -> usize {
        self.actors
            .iter()
            .map(|a| 1 + a.inventory.iter().map(Item::count).sum::<usize>())
            .sum::<usize>()
            + self
                .floor
                .values()
                .flat_map(|pile| pile.iter())
                .map(Item::count)
                .sum::<usize>()
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.entities().iter().any(|(id, _)| *id == identity)
    }

    /// Register every entity on this segment.
    pub fn register_entities(
        &self,
        registry: &mut IdentityRegistry,
        resident: bool,
    ) -> Result<(), WorldError> {
        for (id, kind) in self.entities() {
            registry.register(id, EntityRecord::on_segment(kind, self.number, resident))?;
        }
        Ok(())
    }

    // -- actors -------------------------------------------------------------

    /// Add an actor. Fails if its tile is off the grid or already occupied.
    pub fn add_actor(&mut self, actor: Actor) -> Result<(), WorldError> {
        if !self.terrain.in_bounds(actor.position) {
            return Err(WorldError::OutOfBounds {
                position: actor.position,
            });
        }
        if let Some(occupant) = self.occupant(actor.position) {
            return Err(WorldError::Occupied {
                position: actor.position,
                occupant,
            });
        }
        self.occupancy.insert(actor.position, actor.id);
        self.actors.push(actor);
        Ok(())
    }

    pub fn actor(&self, id: Identity) -> Option<&Actor> {
        self.actors.iter().find(|a| a.id == id)
    }

    /// Remove an actor, keeping the creation order of the others.
    pub fn remove_actor(&mut self, id: Identity) -> Option<Actor> {
        let index = self.actors.iter().position(|a| a.id == id)?;
        let actor = self.actors.remove(index);
        self.occupancy.remove(&actor.position);
        Some(actor)
    }

    // -- floor --------------------------------------------------------------

    /// Put `item` on top of the pile at `pos`.
    pub fn drop_item(&mut self, pos: Position, item: Item) -> Result<(), WorldError> {
        if !self.terrain.in_bounds(pos) {
            return Err(WorldError::OutOfBounds { position: pos });
        }
        self.floor.entry(pos).or_default().push(item);
        Ok(())
    }

    /// Take a top-level item out of the pile at `pos`.
    pub fn take_floor_item(&mut self, pos: Position, id: Identity) -> Option<Item> {
        let pile = self.floor.get_mut(&pos)?;
        let index = pile.iter().position(|i| i.id == id)?;
        let item = pile.remove(index);
        if pile.is_empty() {
            self.floor.remove(&pos);
        }
        Some(item)
    }
}
