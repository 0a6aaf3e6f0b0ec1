// Polling — node selection, per-target-kind policy, and scheduling

pub mod policy;
pub mod scheduler;
pub mod selector;

pub use policy::{
    ClosedGroupPoller, CommunityPoller, DelayContext, MainAccountPoller, PollerPolicy,
};
pub use scheduler::{CycleOutcome, PollScheduler, SchedulerEnv};
pub use selector::PollCursor;
