// Message dispatch — per-thread grouping with config-before-regular ordering
//
// Shared config establishes thread state (is the thread still present, what
// are the disappearing settings) that regular message processing depends
// on, so each thread's regular unit carries a dependency edge on that
// thread's config unit from the same poll cycle.

use std::collections::BTreeMap;

use tracing::debug;

use crate::jobs::{Job, JobKind, JobRunner};
use crate::message::DecodedMessage;

/// How the poll that produced this batch was driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Interactive poll: units are registered but not auto-started; the
    /// caller drives execution inline for responsiveness
    Foreground,
    /// Passive poll: units are persisted and auto-started so they survive
    /// process suspension
    Background,
}

/// One registered unit, returned so foreground callers can drive execution
#[derive(Debug, Clone)]
pub struct ScheduledUnit {
    pub job_id: String,
    pub thread_id: String,
    pub kind: JobKind,
    pub messages: Vec<DecodedMessage>,
}

pub struct MessageDispatcher<'a> {
    jobs: &'a dyn JobRunner,
}

impl<'a> MessageDispatcher<'a> {
    pub fn new(jobs: &'a dyn JobRunner) -> Self {
        Self { jobs }
    }

    /// Group decoded messages by destination thread, split each thread into
    /// config and regular buckets, and register one job per non-empty
    /// bucket with the dependency edge between them.
    pub fn dispatch(
        &self,
        messages: Vec<DecodedMessage>,
        mode: DispatchMode,
    ) -> Vec<ScheduledUnit> {
        // BTreeMap for deterministic unit order across threads
        let mut by_thread: BTreeMap<String, (Vec<DecodedMessage>, Vec<DecodedMessage>)> =
            BTreeMap::new();
        for message in messages {
            let entry = by_thread.entry(message.thread_id.clone()).or_default();
            if message.content.is_config() {
                entry.0.push(message);
            } else {
                entry.1.push(message);
            }
        }

        let auto_start = mode == DispatchMode::Background;
        let mut units = Vec::new();

        for (thread_id, (config, regular)) in by_thread {
            let config_job_id = if config.is_empty() {
                None
            } else {
                let job = Job::receive(JobKind::ConfigSync, &thread_id, config.clone());
                let id = job.id.clone();
                self.jobs.add(job, auto_start);
                units.push(ScheduledUnit {
                    job_id: id.clone(),
                    thread_id: thread_id.clone(),
                    kind: JobKind::ConfigSync,
                    messages: config,
                });
                Some(id)
            };

            if !regular.is_empty() {
                let job = Job::receive(JobKind::MessageReceive, &thread_id, regular.clone());
                let id = job.id.clone();
                self.jobs.add(job, auto_start);
                if let Some(config_id) = &config_job_id {
                    self.jobs.add_dependency(&id, config_id);
                }
                units.push(ScheduledUnit {
                    job_id: id,
                    thread_id: thread_id.clone(),
                    kind: JobKind::MessageReceive,
                    messages: regular,
                });
            }

            debug!(thread = %thread_id, "Dispatched poll batch for thread");
        }

        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MockJobRunner;
    use crate::message::{
        DecodedContent, ExpiryMode, SharedConfigContent, ThreadKind, VisibleContent,
    };
    use crate::types::Namespace;
    use std::sync::{Arc, Mutex};

    fn visible(thread: &str, ts: u64) -> DecodedMessage {
        DecodedMessage {
            thread_id: thread.into(),
            thread_kind: ThreadKind::OneToOne,
            sender: "05alice".into(),
            timestamp_ms: ts,
            server_hash: Some(format!("h{}", ts)),
            namespace: Namespace::Default,
            server_expiration_ms: None,
            content: DecodedContent::Visible(VisibleContent::text("hi")),
        }
    }

    fn config(thread: &str, seqno: u64) -> DecodedMessage {
        DecodedMessage {
            thread_id: thread.into(),
            thread_kind: ThreadKind::OneToOne,
            sender: "05me".into(),
            timestamp_ms: seqno,
            server_hash: Some(format!("c{}", seqno)),
            namespace: Namespace::ConversationConfig,
            server_expiration_ms: None,
            content: DecodedContent::SharedConfig(SharedConfigContent {
                seqno,
                data: Vec::new(),
                expires_in_seconds: None,
                expiry_mode: ExpiryMode::None,
                deleted_before_ms: None,
            }),
        }
    }

    #[test]
    fn test_config_unit_precedes_regular_and_carries_dependency() {
        let added: Arc<Mutex<Vec<(String, JobKind, bool)>>> = Arc::default();
        let deps: Arc<Mutex<Vec<(String, String)>>> = Arc::default();

        let mut runner = MockJobRunner::new();
        let added_clone = Arc::clone(&added);
        runner.expect_add().returning(move |job, auto| {
            added_clone.lock().unwrap().push((job.id, job.kind, auto));
        });
        let deps_clone = Arc::clone(&deps);
        runner.expect_add_dependency().returning(move |job, on| {
            deps_clone.lock().unwrap().push((job.into(), on.into()));
        });

        let dispatcher = MessageDispatcher::new(&runner);
        // Regular message submitted before the config message
        let units = dispatcher.dispatch(
            vec![visible("t1", 10), config("t1", 1)],
            DispatchMode::Background,
        );

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, JobKind::ConfigSync);
        assert_eq!(units[1].kind, JobKind::MessageReceive);

        let deps = deps.lock().unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].0, units[1].job_id);
        assert_eq!(deps[0].1, units[0].job_id);

        // Background units auto-start
        assert!(added.lock().unwrap().iter().all(|(_, _, auto)| *auto));
    }

    #[test]
    fn test_foreground_units_are_not_auto_started() {
        let mut runner = MockJobRunner::new();
        runner.expect_add().withf(|_, auto| !auto).times(1).return_const(());

        let dispatcher = MessageDispatcher::new(&runner);
        let units = dispatcher.dispatch(vec![visible("t1", 10)], DispatchMode::Foreground);
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn test_no_dependency_without_config_unit() {
        let mut runner = MockJobRunner::new();
        runner.expect_add().times(2).return_const(());
        runner.expect_add_dependency().times(0);

        let dispatcher = MessageDispatcher::new(&runner);
        let units = dispatcher.dispatch(
            vec![visible("t1", 10), visible("t2", 20)],
            DispatchMode::Background,
        );
        assert_eq!(units.len(), 2);
        assert_ne!(units[0].thread_id, units[1].thread_id);
    }

    #[test]
    fn test_messages_grouped_by_thread() {
        let mut runner = MockJobRunner::new();
        runner.expect_add().return_const(());
        runner.expect_add_dependency().return_const(());

        let dispatcher = MessageDispatcher::new(&runner);
        let units = dispatcher.dispatch(
            vec![
                visible("t1", 10),
                visible("t2", 11),
                config("t1", 1),
                visible("t1", 12),
            ],
            DispatchMode::Background,
        );

        // t1 gets a config unit and a regular unit with two messages; t2 one
        assert_eq!(units.len(), 3);
        let t1_regular = units
            .iter()
            .find(|u| u.thread_id == "t1" && u.kind == JobKind::MessageReceive)
            .unwrap();
        assert_eq!(t1_regular.messages.len(), 2);
    }
}
