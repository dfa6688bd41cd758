//! Segment codec: deterministic binary encoding of segments, the world block
//! and the player-identity block.
//!
//! Every encoder is a single traversal generic over [`Sink`], run twice: once
//! into a [`CountingSink`] to learn the exact length and once into a
//! [`BufferSink`] sized to that length. Traversal order is fixed, so encoding
//! an unmodified value twice yields identical bytes:
//!
//! 1. segment header (number, visited flag, grid dimensions)
//! 2. terrain, row-major, one byte per tile
//! 3. actors in creation order, each followed by its inventory tree
//! 4. floor piles in row-major tile order, items in pile order
//! 5. local timers in fire order
//!
//! Decoding never touches any "currently active" state. [`decode_segment`]
//! only adds registry records for the entities it found, and only once the
//! whole payload has parsed and validated. Every [`Link`] comes back
//! [`Link::Unresolved`]; the relinker resolves them once enough of the world
//! is loaded.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use cairn_world::entity::{Actor, Avatar, EquipSlot, Item, Position, Vitals};
use cairn_world::identity::{EntityRecord, Identity, IdentityRegistry, Link};
use cairn_world::segment::{Segment, SegmentNumber};
use cairn_world::state::{Projectile, WorldState};
use cairn_world::terrain::{TerrainGrid, Tile};
use cairn_world::timer::{TimerEvent, TimerQueue};
use cairn_world::WorldError;

use crate::sink::{BufferSink, CountingSink, Reader, Sink};
use crate::CodecError;

/// Deepest container nesting accepted when decoding.
pub const MAX_ITEM_DEPTH: usize = 32;

// Smallest possible encodings, used to reject absurd collection lengths.
const MIN_ITEM: usize = 18;
const MIN_ACTOR: usize = 31;
const MIN_PILE: usize = 8;
const MIN_TIMER: usize = 27;
const MIN_FLAG: usize = 12;
const MIN_EQUIP: usize = 9;
const MIN_PROJECTILE: usize = 32;

// ---------------------------------------------------------------------------
// Two-pass plumbing
// ---------------------------------------------------------------------------

/// Which pass of the two-pass protocol to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Walk the value and report its encoded length. Allocates nothing.
    Count,
    /// Walk the value into a buffer of exactly the counted length.
    Write,
}

/// Result of [`encode_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Count(u64),
    Bytes(Vec<u8>),
}

impl Encoded {
    /// Encoded length in bytes, whichever pass produced this.
    pub fn len(&self) -> u64 {
        match self {
            Encoded::Count(n) => *n,
            Encoded::Bytes(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes of a `Write` pass; `None` for a `Count` pass.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Encoded::Count(_) => None,
            Encoded::Bytes(bytes) => Some(bytes),
        }
    }
}

/// A value with a canonical binary encoding.
pub trait Encode {
    fn encode<S: Sink>(&self, sink: &mut S);
}

/// Exact encoded length of `value`.
pub fn measure<T: Encode + ?Sized>(value: &T) -> u64 {
    let mut counter = CountingSink::new();
    value.encode(&mut counter);
    counter.count()
}

/// Encode `value` into a buffer allocated once, to its exact length.
pub fn to_bytes<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut sink = BufferSink::exact(measure(value));
    value.encode(&mut sink);
    sink.into_bytes()
}

/// Encode one segment in the requested mode.
pub fn encode_segment(segment: &Segment, mode: EncodeMode) -> Encoded {
    match mode {
        EncodeMode::Count => Encoded::Count(measure(segment)),
        EncodeMode::Write => Encoded::Bytes(to_bytes(segment)),
    }
}

/// Where a decoded segment is headed. Decides the `resident` flag of the
/// registry records it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSlot {
    /// Becomes the active segment; entities are resident.
    Active,
    /// Goes to (or stays in) a segment store; entities are at rest.
    Stored,
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

fn put_item<S: Sink>(sink: &mut S, item: &Item) {
    sink.put_u64(item.id.to_raw());
    sink.put_u16(item.kind);
    sink.put_u32(item.quantity);
    put_items(sink, &item.contents);
}

fn put_items<S: Sink>(sink: &mut S, items: &[Item]) {
    sink.put_len(items.len());
    for item in items {
        put_item(sink, item);
    }
}

fn put_timers<S: Sink>(sink: &mut S, timers: &TimerQueue) {
    sink.put_u64(timers.next_seq());
    sink.put_len(timers.len());
    for event in timers.iter() {
        sink.put_u64(event.fire_turn);
        sink.put_u64(event.seq);
        sink.put_u64(event.target.identity().to_raw());
        sink.put_u16(event.kind);
        sink.put_u8(event.payload.len() as u8);
        sink.put(&event.payload);
    }
}

fn put_position<S: Sink>(sink: &mut S, pos: Position) {
    sink.put_i16(pos.x);
    sink.put_i16(pos.y);
}

fn put_vitals<S: Sink>(sink: &mut S, vitals: Vitals) {
    sink.put_i32(vitals.hp);
    sink.put_i32(vitals.hp_max);
}

fn read_identity(r: &mut Reader<'_>) -> Result<Identity, CodecError> {
    let offset = r.offset();
    match r.u64()? {
        u64::MAX => Err(CodecError::OutOfRange {
            offset,
            what: "identity",
            value: u64::MAX,
        }),
        raw => Identity::new(raw).ok_or(CodecError::ZeroIdentity { offset }),
    }
}

fn read_item(r: &mut Reader<'_>, depth: usize) -> Result<Item, CodecError> {
    let offset = r.offset();
    if depth > MAX_ITEM_DEPTH {
        return Err(CodecError::OutOfRange {
            offset,
            what: "item nesting depth",
            value: depth as u64,
        });
    }
    let id = read_identity(r)?;
    let kind = r.u16()?;
    let quantity = r.u32()?;
    let contents = read_items(r, depth + 1)?;
    Ok(Item {
        id,
        kind,
        quantity,
        contents,
    })
}

fn read_items(r: &mut Reader<'_>, depth: usize) -> Result<Vec<Item>, CodecError> {
    let count = r.seq_len(MIN_ITEM)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_item(r, depth)?);
    }
    Ok(items)
}

fn read_timers(r: &mut Reader<'_>) -> Result<TimerQueue, CodecError> {
    let next_seq = r.u64()?;
    let count = r.seq_len(MIN_TIMER)?;
    let start = r.offset();
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let fire_turn = r.u64()?;
        let seq = r.u64()?;
        let target = read_identity(r)?;
        let kind = r.u16()?;
        let len = r.u8()? as usize;
        let payload = r.take(len)?.to_vec();
        events.push(TimerEvent {
            fire_turn,
            seq,
            target: Link::Unresolved(target),
            kind,
            payload,
        });
    }
    TimerQueue::from_parts(next_seq, events)
        .map_err(|source| CodecError::World { offset: start, source })
}

fn read_position(r: &mut Reader<'_>) -> Result<Position, CodecError> {
    Ok(Position::new(r.i16()?, r.i16()?))
}

fn read_vitals(r: &mut Reader<'_>) -> Result<Vitals, CodecError> {
    Ok(Vitals {
        hp: r.i32()?,
        hp_max: r.i32()?,
    })
}

fn read_segment_number(r: &mut Reader<'_>) -> Result<SegmentNumber, CodecError> {
    let offset = r.offset();
    let number = SegmentNumber(r.u16()?);
    if !number.is_valid() {
        return Err(CodecError::OutOfRange {
            offset,
            what: "segment number",
            value: u64::from(number.0),
        });
    }
    Ok(number)
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

impl Encode for Segment {
    fn encode<S: Sink>(&self, sink: &mut S) {
        sink.put_u16(self.number.0);
        sink.put_bool(self.visited);
        sink.put_u16(self.terrain.width());
        sink.put_u16(self.terrain.height());
        for tile in self.terrain.tiles() {
            sink.put_u8(tile.to_code());
        }

        sink.put_len(self.actors.len());
        for actor in &self.actors {
            sink.put_u64(actor.id.to_raw());
            sink.put_u16(actor.species);
            sink.put_str(&actor.name);
            put_position(sink, actor.position);
            put_vitals(sink, actor.vitals);
            match actor.owner {
                Some(owner) => {
                    sink.put_u8(1);
                    sink.put_u64(owner.identity().to_raw());
                }
                None => sink.put_u8(0),
            }
            put_items(sink, &actor.inventory);
        }

        // Empty piles are not part of the world; skip them without allocating.
        let piles = self.floor.values().filter(|pile| !pile.is_empty()).count();
        sink.put_len(piles);
        for (pos, pile) in self.floor.iter().filter(|(_, pile)| !pile.is_empty()) {
            put_position(sink, *pos);
            put_items(sink, pile);
        }

        put_timers(sink, &self.timers);
    }
}

/// Parse a segment payload without registering anything.
pub fn parse_segment(bytes: &[u8]) -> Result<Segment, CodecError> {
    let mut r = Reader::new(bytes);
    let number = read_segment_number(&mut r)?;
    let visited = r.bool()?;
    let width = r.u16()?;
    let height = r.u16()?;

    let tiles_at = r.offset();
    let raw_tiles = r.take(usize::from(width) * usize::from(height))?;
    let mut tiles = Vec::with_capacity(raw_tiles.len());
    for (i, code) in raw_tiles.iter().enumerate() {
        let tile = Tile::from_code(*code).ok_or(CodecError::BadTag {
            offset: tiles_at + i as u64,
            what: "tile",
            tag: u64::from(*code),
        })?;
        tiles.push(tile);
    }
    let terrain = TerrainGrid::from_tiles(width, height, tiles).ok_or(CodecError::OutOfRange {
        offset: tiles_at,
        what: "terrain dimensions",
        value: u64::from(width) * u64::from(height),
    })?;

    let mut segment = Segment::new(number, terrain);
    segment.visited = visited;

    let actors = r.seq_len(MIN_ACTOR)?;
    for _ in 0..actors {
        let offset = r.offset();
        let id = read_identity(&mut r)?;
        let species = r.u16()?;
        let name = r.str()?;
        let position = read_position(&mut r)?;
        let vitals = read_vitals(&mut r)?;
        let owner_at = r.offset();
        let owner = match r.u8()? {
            0 => None,
            1 => Some(Link::Unresolved(read_identity(&mut r)?)),
            tag => {
                return Err(CodecError::BadTag {
                    offset: owner_at,
                    what: "actor owner",
                    tag: u64::from(tag),
                })
            }
        };
        let inventory = read_items(&mut r, 0)?;
        let actor = Actor {
            id,
            species,
            name,
            position,
            vitals,
            inventory,
            owner,
        };
        segment
            .add_actor(actor)
            .map_err(|source| CodecError::World { offset, source })?;
    }

    let piles = r.seq_len(MIN_PILE)?;
    let mut previous: Option<Position> = None;
    for _ in 0..piles {
        let offset = r.offset();
        let pos = read_position(&mut r)?;
        if previous.is_some_and(|prev| prev >= pos) {
            return Err(CodecError::OutOfRange {
                offset,
                what: "floor pile order",
                value: u64::from(pos.y.unsigned_abs()),
            });
        }
        previous = Some(pos);
        let items = read_items(&mut r, 0)?;
        if items.is_empty() {
            return Err(CodecError::OutOfRange {
                offset,
                what: "floor pile size",
                value: 0,
            });
        }
        for item in items {
            segment
                .drop_item(pos, item)
                .map_err(|source| CodecError::World { offset, source })?;
        }
    }

    segment.timers = read_timers(&mut r)?;
    r.finish()?;

    let mut seen = HashSet::new();
    for (identity, _) in segment.entities() {
        if !seen.insert(identity) {
            return Err(CodecError::DuplicateIdentity { identity });
        }
    }
    Ok(segment)
}

/// Decode segment `expected` and register every entity on it.
///
/// Registration happens only after the payload has fully parsed, its number
/// matched `expected` and every record has been checked against the
/// registry, so a failed decode leaves the registry untouched.
pub fn decode_segment(
    bytes: &[u8],
    expected: SegmentNumber,
    registry: &mut IdentityRegistry,
    slot: SegmentSlot,
) -> Result<Segment, CodecError> {
    let segment = parse_segment(bytes)?;
    if segment.number != expected {
        return Err(CodecError::Inconsistent {
            details: format!("expected segment {expected}, found {}", segment.number),
        });
    }
    let resident = slot == SegmentSlot::Active;

    let entities = segment.entities();
    for (identity, kind) in &entities {
        if let Some(existing) = registry.resolve(*identity) {
            let incoming = EntityRecord::on_segment(*kind, segment.number, resident);
            if existing.kind != incoming.kind || existing.residence != incoming.residence {
                return Err(CodecError::World {
                    offset: bytes.len() as u64,
                    source: WorldError::IdentityConflict {
                        identity: *identity,
                        existing,
                        incoming,
                    },
                });
            }
        }
    }
    segment
        .register_entities(registry, resident)
        .map_err(|source| CodecError::World {
            offset: bytes.len() as u64,
            source,
        })?;

    tracing::debug!(
        segment = %segment.number,
        bytes = bytes.len(),
        entities = entities.len(),
        ?slot,
        "decoded segment"
    );
    Ok(segment)
}

// ---------------------------------------------------------------------------
// World block
// ---------------------------------------------------------------------------

/// The world block: everything in a [`WorldState`] except the active segment,
/// which is encoded as its own record just before it.
impl Encode for WorldState {
    fn encode<S: Sink>(&self, sink: &mut S) {
        sink.put_u64(self.seed);
        sink.put_u64(self.turn);
        sink.put_u64(self.checkpoints);

        let avatar = &self.avatar;
        sink.put_u64(avatar.id.to_raw());
        sink.put_str(&avatar.name);
        match avatar.position {
            Some(pos) => {
                sink.put_bool(true);
                put_position(sink, pos);
            }
            None => sink.put_bool(false),
        }
        put_vitals(sink, avatar.vitals);
        put_items(sink, &avatar.inventory);
        sink.put_len(avatar.equipment.len());
        for (slot, item) in &avatar.equipment {
            sink.put_u8(slot.to_u8());
            sink.put_u64(item.to_raw());
        }

        sink.put_len(self.flags.len());
        for (name, value) in &self.flags {
            sink.put_str(name);
            sink.put_i64(*value);
        }

        sink.put_len(self.visited.len());
        for number in &self.visited {
            sink.put_u16(number.0);
        }

        put_timers(sink, &self.timers);

        sink.put_len(self.in_flight.len());
        for projectile in &self.in_flight {
            put_item(sink, &projectile.item);
            put_position(sink, projectile.at);
            sink.put_u8(projectile.heading.0 as u8);
            sink.put_u8(projectile.heading.1 as u8);
            sink.put_u64(projectile.thrown_by.to_raw());
        }
    }
}

/// A decoded world block, waiting for its active segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldBlock {
    pub seed: u64,
    pub turn: u64,
    pub checkpoints: u64,
    pub avatar: Avatar,
    pub flags: BTreeMap<String, i64>,
    pub visited: BTreeSet<SegmentNumber>,
    pub timers: TimerQueue,
    pub in_flight: Vec<Projectile>,
}

impl WorldBlock {
    /// Attach the active segment and rebuild derived indices.
    pub fn into_state(self, active: Segment) -> Result<WorldState, CodecError> {
        if !self.visited.contains(&active.number) {
            return Err(CodecError::Inconsistent {
                details: format!(
                    "active segment {} is missing from the visited set",
                    active.number
                ),
            });
        }
        let mut state = WorldState::new(self.seed, self.avatar, active);
        state.turn = self.turn;
        state.checkpoints = self.checkpoints;
        state.flags = self.flags;
        state.visited = self.visited;
        state.timers = self.timers;
        state.in_flight = self.in_flight;
        state.rebuild_indices();
        Ok(state)
    }
}

pub fn decode_world_block(bytes: &[u8]) -> Result<WorldBlock, CodecError> {
    let mut r = Reader::new(bytes);
    let seed = r.u64()?;
    let turn = r.u64()?;
    let checkpoints = r.u64()?;

    let id = read_identity(&mut r)?;
    let name = r.str()?;
    let position = if r.bool()? {
        Some(read_position(&mut r)?)
    } else {
        None
    };
    let vitals = read_vitals(&mut r)?;
    let inventory = read_items(&mut r, 0)?;
    let mut avatar = Avatar {
        id,
        name,
        position,
        vitals,
        inventory,
        equipment: BTreeMap::new(),
    };
    let worn = r.seq_len(MIN_EQUIP)?;
    for _ in 0..worn {
        let offset = r.offset();
        let raw = r.u8()?;
        let slot = EquipSlot::from_u8(raw).ok_or(CodecError::BadTag {
            offset,
            what: "equipment slot",
            tag: u64::from(raw),
        })?;
        let item = read_identity(&mut r)?;
        avatar
            .wear(slot, item)
            .map_err(|source| CodecError::World { offset, source })?;
    }

    let flag_count = r.seq_len(MIN_FLAG)?;
    let mut flags = BTreeMap::new();
    for _ in 0..flag_count {
        let name = r.str()?;
        let value = r.i64()?;
        flags.insert(name, value);
    }

    let visited_count = r.seq_len(2)?;
    let mut visited = BTreeSet::new();
    for _ in 0..visited_count {
        visited.insert(read_segment_number(&mut r)?);
    }

    let timers = read_timers(&mut r)?;

    let projectile_count = r.seq_len(MIN_PROJECTILE)?;
    let mut in_flight = Vec::with_capacity(projectile_count);
    for _ in 0..projectile_count {
        let item = read_item(&mut r, 0)?;
        let at = read_position(&mut r)?;
        let heading = (r.u8()? as i8, r.u8()? as i8);
        let thrown_by = read_identity(&mut r)?;
        in_flight.push(Projectile {
            item,
            at,
            heading,
            thrown_by,
        });
    }
    r.finish()?;

    Ok(WorldBlock {
        seed,
        turn,
        checkpoints,
        avatar,
        flags,
        visited,
        timers,
        in_flight,
    })
}

// ---------------------------------------------------------------------------
// Player-identity block
// ---------------------------------------------------------------------------

/// Who the save belongs to, and where identity allocation resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerBlock {
    pub avatar: Identity,
    pub name: String,
    /// Registry high-water mark at checkpoint time.
    pub high_water: u64,
    pub seed: u64,
    pub turn: u64,
}

impl PlayerBlock {
    pub fn capture(state: &WorldState, registry: &IdentityRegistry) -> Self {
        Self {
            avatar: state.avatar.id,
            name: state.avatar.name.clone(),
            high_water: registry.high_water(),
            seed: state.seed,
            turn: state.turn,
        }
    }
}

impl Encode for PlayerBlock {
    fn encode<S: Sink>(&self, sink: &mut S) {
        sink.put_u64(self.avatar.to_raw());
        sink.put_str(&self.name);
        sink.put_u64(self.high_water);
        sink.put_u64(self.seed);
        sink.put_u64(self.turn);
    }
}

pub fn decode_player_block(bytes: &[u8]) -> Result<PlayerBlock, CodecError> {
    let mut r = Reader::new(bytes);
    let avatar = read_identity(&mut r)?;
    let name = r.str()?;
    let high_water_at = r.offset();
    let high_water = r.u64()?;
    if high_water <= avatar.to_raw() || high_water == u64::MAX {
        return Err(CodecError::OutOfRange {
            offset: high_water_at,
            what: "identity high-water mark",
            value: high_water,
        });
    }
    let seed = r.u64()?;
    let turn = r.u64()?;
    r.finish()?;
    Ok(PlayerBlock {
        avatar,
        name,
        high_water,
        seed,
        turn,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
