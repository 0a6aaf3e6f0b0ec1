// Snode selection with bounded reuse
//
// Bounding how long one node stays pinned defends against a node that
// returns successful-but-empty responses while silently failing to relay
// messages from peers — a failure mode invisible without rotation.

use std::collections::HashSet;
use std::time::Instant;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::PollError;
use crate::types::Snode;

/// Per-target polling state. Owned by that target's scheduler task and never
/// shared, so no locking is needed.
#[derive(Debug, Default)]
pub struct PollCursor {
    /// Node currently pinned for this target; `None` forces a new selection
    pub pinned: Option<Snode>,
    /// Completed polls against the pinned node
    pub polls_against_pinned: u32,
    /// Nodes already used in the current rotation cycle, by address
    pub recently_used: HashSet<String>,
    /// Consecutive failed cycles; reset on any successful cycle
    pub failure_count: u32,
    /// When the current/last cycle started
    pub last_cycle_started: Option<Instant>,
}

impl PollCursor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Pick the node to poll next. Keeps the pinned node while its poll-count
/// budget remains; otherwise selects a random swarm node outside the
/// recently-used set, restarting the cycle once every node has been used.
/// `max_poll_count` of 0 disables pinning and the used-set rotation: every
/// selection is an independent random draw.
pub fn select_node(
    cursor: &mut PollCursor,
    swarm: &[Snode],
    max_poll_count: u32,
) -> Result<Snode, PollError> {
    if swarm.is_empty() {
        return Err(PollError::InsufficientNodes { have: 0, need: 1 });
    }

    if max_poll_count == 0 {
        let chosen = swarm
            .choose(&mut rand::thread_rng())
            .ok_or(PollError::InsufficientNodes { have: 0, need: 1 })?
            .clone();
        cursor.pinned = None;
        cursor.polls_against_pinned = 0;
        return Ok(chosen);
    }

    if let Some(pinned) = cursor.pinned.clone() {
        if cursor.polls_against_pinned < max_poll_count && swarm.contains(&pinned) {
            return Ok(pinned);
        }
    }

    let mut unused: Vec<&Snode> = swarm
        .iter()
        .filter(|node| !cursor.recently_used.contains(&node.address))
        .collect();

    if unused.is_empty() {
        cursor.recently_used.clear();
        unused = swarm.iter().collect();
    }

    let chosen = (*unused
        .choose(&mut rand::thread_rng())
        .ok_or(PollError::InsufficientNodes { have: 0, need: 1 })?)
    .clone();

    cursor.recently_used.insert(chosen.address.clone());
    cursor.polls_against_pinned = 0;
    cursor.pinned = Some(chosen.clone());
    Ok(chosen)
}

/// Record one completed poll against the current node; clears the pin once
/// the budget is exhausted so the next cycle rotates.
pub fn increment_use(cursor: &mut PollCursor, max_poll_count: u32) {
    cursor.polls_against_pinned += 1;
    if max_poll_count == 0 || cursor.polls_against_pinned >= max_poll_count {
        cursor.pinned = None;
    }
}

/// Unpin after a failed poll so the next cycle selects a fresh node
pub fn report_failure(cursor: &mut PollCursor, node: &Snode) {
    debug!(node = %node.address, "Dropping pinned node after poll failure");
    cursor.pinned = None;
    cursor.polls_against_pinned = 0;
}
