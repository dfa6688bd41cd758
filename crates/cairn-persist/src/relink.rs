//! Reference relinking.
//!
//! Decoded references start out [`Link::Unresolved`]. A relink pass looks
//! each one up in the registry and marks it resolved when its target is
//! registered (resident or at rest). Restore runs two passes:
//!
//! - [`RelinkPass::Initial`] right after the world block, when only the
//!   avatar and the active segment are known. Misses are left for later.
//! - [`RelinkPass::Final`] once every segment has been decoded. Whatever is
//!   still unresolved names an entity that was destroyed before the
//!   checkpoint; timers aimed at it are dropped and ownership links cleared,
//!   each with a warning.
//!
//! Relinking never fails and never panics.

use cairn_world::identity::{IdentityRegistry, Link};
use cairn_world::segment::Segment;
use cairn_world::state::WorldState;
use cairn_world::timer::TimerQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelinkPass {
    Initial,
    Final,
}

/// Outcome of one relink pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelinkReport {
    /// References resolved by this pass.
    pub resolved: usize,
    /// References still waiting for their target.
    pub unresolved: usize,
    /// References given up on and removed (final pass only).
    pub dropped: usize,
}

impl RelinkReport {
    fn absorb(&mut self, other: RelinkReport) {
        self.resolved += other.resolved;
        self.unresolved += other.unresolved;
        self.dropped += other.dropped;
    }
}

/// Resolve `link` in place. Returns whether it is resolved afterwards.
fn fix(link: &mut Link, registry: &IdentityRegistry) -> bool {
    match *link {
        Link::Resolved(_) => true,
        Link::Unresolved(id) if registry.contains(id) => {
            *link = Link::Resolved(id);
            true
        }
        Link::Unresolved(_) => false,
    }
}

fn relink_timers(
    queue: &mut TimerQueue,
    registry: &IdentityRegistry,
    pass: RelinkPass,
    queue_name: &str,
) -> RelinkReport {
    let mut report = RelinkReport::default();
    for link in queue.targets_mut() {
        if !link.needs_fixup() {
            continue;
        }
        if fix(link, registry) {
            report.resolved += 1;
        } else {
            report.unresolved += 1;
        }
    }
    if pass == RelinkPass::Final && report.unresolved > 0 {
        queue.retain(|event| {
            if !event.target.needs_fixup() {
                return true;
            }
            tracing::warn!(
                target_identity = %event.target.identity(),
                fire_turn = event.fire_turn,
                kind = event.kind,
                queue = queue_name,
                "dropping timer whose target no longer exists"
            );
            false
        });
        report.dropped = report.unresolved;
        report.unresolved = 0;
    }
    report
}

/// Relink one segment's local timers and actor ownership links.
pub fn relink_segment(
    segment: &mut Segment,
    registry: &IdentityRegistry,
    pass: RelinkPass,
) -> RelinkReport {
    let queue_name = format!("segment {}", segment.number);
    let mut report = relink_timers(&mut segment.timers, registry, pass, &queue_name);

    for actor in &mut segment.actors {
        let Some(link) = actor.owner.as_mut() else {
            continue;
        };
        if !link.needs_fixup() {
            continue;
        }
        if fix(link, registry) {
            report.resolved += 1;
        } else if pass == RelinkPass::Final {
            tracing::warn!(
                actor = %actor.id,
                owner = %link.identity(),
                segment = %segment.number,
                "clearing ownership link to an entity that no longer exists"
            );
            actor.owner = None;
            report.dropped += 1;
        } else {
            report.unresolved += 1;
        }
    }
    report
}

/// Relink the global timer queue and the active segment.
pub fn relink(state: &mut WorldState, registry: &IdentityRegistry, pass: RelinkPass) -> RelinkReport {
    let mut report = relink_timers(&mut state.timers, registry, pass, "global");
    report.absorb(relink_segment(&mut state.active, registry, pass));
    tracing::debug!(
        ?pass,
        resolved = report.resolved,
        unresolved = report.unresolved,
        dropped = report.dropped,
        "relink pass complete"
    );
    report
}
