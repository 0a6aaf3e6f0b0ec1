// Job construction for the external durable scheduler
//
// The pipeline only builds jobs and dependency edges; it never executes
// them. Foreground polls register jobs without auto-starting so the caller
// can drive them inline; background polls persist and auto-start them so
// they survive process suspension.

use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::message::{AttachmentPointer, DecodedMessage};

/// What a scheduled unit does when run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Apply shared-config messages for one thread
    ConfigSync,
    /// Reconcile regular messages for one thread
    MessageReceive,
    /// Download one attachment
    AttachmentDownload,
}

/// A unit of work handed to the external runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub thread_id: String,
    /// Messages to process, for config/receive jobs
    pub messages: Vec<DecodedMessage>,
    /// Attachment to fetch, for download jobs
    pub attachment: Option<AttachmentPointer>,
    /// Interaction the attachment belongs to
    pub interaction_id: Option<u64>,
}

impl Job {
    pub fn receive(kind: JobKind, thread_id: impl Into<String>, messages: Vec<DecodedMessage>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            thread_id: thread_id.into(),
            messages,
            attachment: None,
            interaction_id: None,
        }
    }

    pub fn attachment_download(
        thread_id: impl Into<String>,
        interaction_id: u64,
        attachment: AttachmentPointer,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: JobKind::AttachmentDownload,
            thread_id: thread_id.into(),
            messages: Vec::new(),
            attachment: Some(attachment),
            interaction_id: Some(interaction_id),
        }
    }
}

/// External durable job scheduler
#[cfg_attr(test, automock)]
pub trait JobRunner: Send + Sync {
    /// Register a job. When `auto_start` is false the caller drives
    /// execution; when true the runner persists and starts it.
    fn add(&self, job: Job, auto_start: bool);

    /// Record that `job_id` must not run to completion before
    /// `depends_on_id` has completed.
    fn add_dependency(&self, job_id: &str, depends_on_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = Job::receive(JobKind::ConfigSync, "thread", Vec::new());
        let b = Job::receive(JobKind::ConfigSync, "thread", Vec::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_attachment_job_shape() {
        let pointer = AttachmentPointer {
            remote_id: "r1".into(),
            digest: vec![1],
            content_type: "image/png".into(),
            size_bytes: 10,
            file_name: None,
        };
        let job = Job::attachment_download("thread", 7, pointer);
        assert_eq!(job.kind, JobKind::AttachmentDownload);
        assert_eq!(job.interaction_id, Some(7));
        assert!(job.messages.is_empty());
    }
}
