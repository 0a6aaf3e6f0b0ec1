// Network boundary — fetching stored messages from swarm nodes
//
// The pipeline constructs poll requests and consumes namespaced results; the
// actual wire protocol (onion routing, HTTP, batching) lives in the host.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::envelope::SnodePollResponse;
use crate::error::PollError;
use crate::types::{Namespace, PollTarget, Snode};

/// Fetches stored messages from a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Poll `node` for messages in `namespaces`, resuming each namespace
    /// from its last-hash cursor. Failures abort the current cycle only.
    async fn poll(
        &self,
        target: &PollTarget,
        node: &Snode,
        namespaces: &[Namespace],
        since_hashes: &HashMap<Namespace, String>,
    ) -> Result<SnodePollResponse, PollError>;
}

/// Supplies and maintains the swarm for a target
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SwarmProvider: Send + Sync {
    /// Current swarm membership for the target
    async fn swarm_for(&self, target: &PollTarget) -> Result<Vec<Snode>, PollError>;

    /// Signal that a node failed a poll; the network layer may evict it from
    /// the swarm if errors persist.
    async fn report_failing(&self, target: &PollTarget, node: &Snode);
}
