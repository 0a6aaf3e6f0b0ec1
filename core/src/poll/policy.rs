// Per-target-kind polling policy
//
// One capability trait, three data-carrying implementations. Policy values
// live in fields, not overridden methods.

use std::time::Duration;

use tracing::warn;

use crate::error::PollError;
use crate::types::Namespace;

/// Inputs to the next-delay computation
#[derive(Debug, Clone, Default)]
pub struct DelayContext {
    /// Consecutive failed cycles for this target
    pub failure_count: u32,
    /// Age of the newest message in the target's thread, where relevant
    pub last_message_age: Option<Duration>,
}

/// Per-target-kind polling behavior
pub trait PollerPolicy: Send + Sync {
    /// Name used in log lines
    fn name(&self) -> &str;

    /// Namespaces to query each cycle
    fn namespaces(&self) -> &[Namespace];

    /// Polls allowed against one node before rotating; 0 disables pinning
    fn max_node_poll_count(&self) -> u32;

    /// Delay before the next cycle, measured from the current cycle's start
    fn next_delay(&self, ctx: &DelayContext) -> Duration;

    /// Whether polling should continue after a failed cycle
    fn handle_error(&self, err: &PollError, ctx: &DelayContext) -> bool;
}

/// Main-account polling: frequent, with a gentle linear backoff
pub struct MainAccountPoller {
    pub baseline: Duration,
    pub backoff_step: Duration,
    pub ceiling: Duration,
    pub max_node_poll_count: u32,
    namespaces: Vec<Namespace>,
}

impl Default for MainAccountPoller {
    fn default() -> Self {
        Self {
            baseline: Duration::from_secs(2),
            backoff_step: Duration::from_millis(500),
            ceiling: Duration::from_secs(15),
            max_node_poll_count: 6,
            namespaces: vec![
                Namespace::Default,
                Namespace::UserProfileConfig,
                Namespace::ContactsConfig,
                Namespace::ConversationConfig,
                Namespace::GroupsConfig,
            ],
        }
    }
}

impl PollerPolicy for MainAccountPoller {
    fn name(&self) -> &str {
        "main_account"
    }

    fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    fn max_node_poll_count(&self) -> u32 {
        self.max_node_poll_count
    }

    fn next_delay(&self, ctx: &DelayContext) -> Duration {
        if ctx.failure_count == 0 {
            return self.baseline;
        }
        (self.baseline + self.backoff_step * ctx.failure_count).min(self.ceiling)
    }

    fn handle_error(&self, err: &PollError, ctx: &DelayContext) -> bool {
        warn!(
            poller = self.name(),
            failures = ctx.failure_count,
            %err,
            "Poll cycle failed"
        );
        // The account swarm is refreshed by the network layer; keep going
        true
    }
}

/// Closed-group polling: interval scales with how recently the thread saw a
/// message, so quiet groups are polled less often.
pub struct ClosedGroupPoller {
    pub floor: Duration,
    pub ceiling: Duration,
    /// Recency window over which the delay scales from floor to ceiling
    pub recency_window: Duration,
    /// Assumed last-message age for threads that never received one
    pub fallback_age: Duration,
    pub max_node_poll_count: u32,
    namespaces: Vec<Namespace>,
}

impl Default for ClosedGroupPoller {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(3),
            ceiling: Duration::from_secs(30),
            recency_window: Duration::from_secs(60 * 60),
            fallback_age: Duration::from_secs(5 * 60),
            max_node_poll_count: 6,
            namespaces: vec![Namespace::LegacyGroup],
        }
    }
}

impl PollerPolicy for ClosedGroupPoller {
    fn name(&self) -> &str {
        "closed_group"
    }

    fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    fn max_node_poll_count(&self) -> u32 {
        self.max_node_poll_count
    }

    fn next_delay(&self, ctx: &DelayContext) -> Duration {
        let age = ctx.last_message_age.unwrap_or(self.fallback_age);
        let fraction =
            (age.as_secs_f64() / self.recency_window.as_secs_f64()).clamp(0.0, 1.0);
        let base = self.floor + (self.ceiling - self.floor).mul_f64(fraction);
        // Failures stretch the recency-based delay, still capped
        base.mul_f64(f64::from(ctx.failure_count) + 1.0).min(self.ceiling)
    }

    fn handle_error(&self, err: &PollError, ctx: &DelayContext) -> bool {
        warn!(
            poller = self.name(),
            failures = ctx.failure_count,
            %err,
            "Poll cycle failed"
        );
        true
    }
}

/// Community polling: exponential backoff with a high ceiling, and
/// self-disables after sustained failure (a dead server is not a swarm; no
/// rotation will save it).
pub struct CommunityPoller {
    pub baseline: Duration,
    pub ceiling: Duration,
    /// Consecutive failures after which the target stops itself
    pub give_up_after: u32,
    namespaces: Vec<Namespace>,
}

impl Default for CommunityPoller {
    fn default() -> Self {
        Self {
            baseline: Duration::from_secs(10),
            ceiling: Duration::from_secs(60 * 60),
            give_up_after: 12,
            namespaces: vec![Namespace::Default],
        }
    }
}

impl PollerPolicy for CommunityPoller {
    fn name(&self) -> &str {
        "community"
    }

    fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    fn max_node_poll_count(&self) -> u32 {
        // A community server is a single endpoint; pinning is meaningless
        0
    }

    fn next_delay(&self, ctx: &DelayContext) -> Duration {
        if ctx.failure_count == 0 {
            return self.baseline;
        }
        let exponent = ctx.failure_count.min(20);
        self.baseline
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.ceiling)
    }

    fn handle_error(&self, err: &PollError, ctx: &DelayContext) -> bool {
        warn!(
            poller = self.name(),
            failures = ctx.failure_count,
            %err,
            "Poll cycle failed"
        );
        ctx.failure_count < self.give_up_after
    }
}
