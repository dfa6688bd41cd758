//! Stable entity identities and the registry that resolves them.
//!
//! An [`Identity`] is a process-lifetime-unique, non-zero `u64` handed out to
//! every avatar, actor and item when it is created. It is the only currency a
//! cross-reference may use: serialized data and anything shared across the
//! simulation/presentation boundary carry identities, never addresses.
//!
//! The [`IdentityRegistry`] is the lookup side. It records, for each live
//! identity, what kind of entity it names and where that entity currently
//! lives (carried by the avatar, or on a numbered segment, resident in memory
//! or at rest in a segment store).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::segment::SegmentNumber;
use crate::WorldError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A stable, non-zero entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(u64);

impl Identity {
    /// Build an identity from its raw value. Returns `None` for zero, which is
    /// never a valid identity.
    #[inline]
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity(#{})", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// What an identity names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Avatar,
    Actor,
    Item,
}

/// Where a registered entity lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Residence {
    /// The avatar itself, or an item somewhere in the avatar's inventory.
    Avatar,
    /// An actor or item belonging to the given segment.
    Segment(SegmentNumber),
}

/// Registry entry for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub residence: Residence,
    /// `true` when the owning collection is in memory (the avatar, or the
    /// active segment); `false` when it is at rest in a segment store.
    pub resident: bool,
}

impl EntityRecord {
    /// An entity carried by (or being) the avatar. Always resident.
    pub fn with_avatar(kind: EntityKind) -> Self {
        Self {
            kind,
            residence: Residence::Avatar,
            resident: true,
        }
    }

    /// An entity on `segment`.
    pub fn on_segment(kind: EntityKind, segment: SegmentNumber, resident: bool) -> Self {
        Self {
            kind,
            residence: Residence::Segment(segment),
            resident,
        }
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// A cross-reference to another entity.
///
/// References decoded from storage start out `Unresolved` and become
/// `Resolved` once the relinker has found their target in the registry. A
/// reference created during play is `Resolved` from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Link {
    Resolved(Identity),
    Unresolved(Identity),
}

impl Link {
    /// The identity referred to, resolved or not.
    pub fn identity(self) -> Identity {
        match self {
            Link::Resolved(id) | Link::Unresolved(id) => id,
        }
    }

    /// `true` while the target has not been found in the registry.
    pub fn needs_fixup(self) -> bool {
        matches!(self, Link::Unresolved(_))
    }
}

// ---------------------------------------------------------------------------
// IdentityRegistry
// ---------------------------------------------------------------------------

/// Allocates identities and resolves them to [`EntityRecord`]s.
///
/// Allocation is monotonic: the registry remembers a high-water mark and never
/// hands out a value below it, so an identity is never reused while (or after)
/// its referent exists. Registering an identity decoded from storage raises
/// the high-water mark past it.
#[derive(Debug)]
pub struct IdentityRegistry {
    /// Next raw value [`allocate`](Self::allocate) will return.
    next: u64,
    /// Every registered identity. `BTreeMap` keeps iteration deterministic.
    records: BTreeMap<Identity, EntityRecord>,
}

impl IdentityRegistry {
    /// Create an empty registry. The first allocated identity is `#1`.
    pub fn new() -> Self {
        Self {
            next: 1,
            records: BTreeMap::new(),
        }
    }

    /// Allocate a fresh identity. The identity is not registered until
    /// [`register`](Self::register) is called for it.
    pub fn allocate(&mut self) -> Identity {
        let id = Identity(self.next);
        self.next += 1;
        id
    }

    /// Register `identity` with the given record.
    ///
    /// Re-registering the same identity with the same kind and residence is
    /// allowed and only refreshes the `resident` flag (a segment being loaded
    /// back into memory). Any other re-registration is a conflict. The raw
    /// value `u64::MAX` leaves no room above it and is refused.
    pub fn register(&mut self, identity: Identity, record: EntityRecord) -> Result<(), WorldError> {
        if let Some(existing) = self.records.get_mut(&identity) {
            if existing.kind != record.kind || existing.residence != record.residence {
                return Err(WorldError::IdentityConflict {
                    identity,
                    existing: *existing,
                    incoming: record,
                });
            }
            existing.resident = record.resident;
            return Ok(());
        }
        let next = identity
            .0
            .checked_add(1)
            .ok_or(WorldError::IdentityExhausted { identity })?;
        self.raise_high_water(next);
        self.records.insert(identity, record);
        Ok(())
    }

    /// Move an already-registered entity to a new residence (an item picked
    /// up from the floor, or dropped from the inventory).
    pub fn relocate(
        &mut self,
        identity: Identity,
        residence: Residence,
        resident: bool,
    ) -> Result<(), WorldError> {
        let record = self
            .records
            .get_mut(&identity)
            .ok_or(WorldError::UnknownIdentity { identity })?;
        record.residence = residence;
        record.resident = resident;
        Ok(())
    }

    /// Resolve an identity against everything currently registered.
    pub fn resolve(&self, identity: Identity) -> Option<EntityRecord> {
        self.records.get(&identity).copied()
    }

    /// Whether `identity` is registered.
    pub fn contains(&self, identity: Identity) -> bool {
        self.records.contains_key(&identity)
    }

    /// Remove an identity whose referent was destroyed. The raw value is not
    /// returned to any pool.
    pub fn release(&mut self, identity: Identity) -> Option<EntityRecord> {
        self.records.remove(&identity)
    }

    /// Flip the `resident` flag of every entity on `segment`.
    pub fn set_resident(&mut self, segment: SegmentNumber, resident: bool) {
        for record in self.records.values_mut() {
            if record.residence == Residence::Segment(segment) {
                record.resident = resident;
            }
        }
    }

    /// Drop every record living on `segment`. Returns how many were removed.
    pub fn forget_segment(&mut self, segment: SegmentNumber) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.residence != Residence::Segment(segment));
        before - self.records.len()
    }

    /// Number of registered entities living in `residence`.
    pub fn count_in(&self, residence: Residence) -> usize {
        self.records
            .values()
            .filter(|r| r.residence == residence)
            .count()
    }

    /// Drop every record and rewind allocation to `#1`.
    ///
    /// Only valid when nothing that carries an identity survives the reset,
    /// i.e. right before a restore rebuilds the world from storage.
    pub fn reset(&mut self) {
        self.records.clear();
        self.next = 1;
    }

    /// The next raw value that [`allocate`](Self::allocate) would return.
    pub fn high_water(&self) -> u64 {
        self.next
    }

    /// Ensure future allocations start at or above `next`.
    pub fn raise_high_water(&mut self, next: u64) {
        self.next = self.next.max(next);
    }

    /// Total number of registered identities.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no identity is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over registered identities in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Identity, EntityRecord)> + '_ {
        self.records.iter().map(|(id, rec)| (*id, *rec))
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
