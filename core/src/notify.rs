// Notification boundary — fire-and-forget, failures never reach the poller

#[cfg(test)]
use mockall::automock;

use crate::store::records::{Interaction, Reaction, ThreadRecord};
use crate::types::ApplicationState;

/// Host-side user notifications for newly received content
#[cfg_attr(test, automock)]
pub trait Notifier: Send + Sync {
    fn notify_message(
        &self,
        interaction: &Interaction,
        thread: &ThreadRecord,
        state: ApplicationState,
    );

    fn notify_reaction(&self, reaction: &Reaction, thread: &ThreadRecord, state: ApplicationState);
}

/// No-op notifier for headless hosts and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify_message(&self, _: &Interaction, _: &ThreadRecord, _: ApplicationState) {}
    fn notify_reaction(&self, _: &Reaction, _: &ThreadRecord, _: ApplicationState) {}
}
