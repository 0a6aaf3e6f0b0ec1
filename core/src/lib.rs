// Tidepool Core — swarm message polling and receive pipeline
//
// Recurring pollers pull stored envelopes from swarm nodes, decode and
// deduplicate them, and reconcile conversation state under a single-writer
// store. Everything network- and platform-shaped (wire protocol, job
// execution, notifications, cryptography) sits behind traits owned here and
// implemented by the host.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod jobs;
pub mod message;
pub mod notify;
pub mod poll;
pub mod receive;
pub mod store;
pub mod transport;
pub mod types;

pub use crypto::{Crypto, KeyContext, Plaintext};
pub use envelope::{Envelope, NamespaceResult, RawReceivedEnvelope, SnodePollResponse};
pub use error::{PollError, ReceiveError};
pub use jobs::{Job, JobKind, JobRunner};
pub use message::{DecodedContent, DecodedMessage, ThreadKind};
pub use notify::{Notifier, NullNotifier};
pub use poll::{
    ClosedGroupPoller, CommunityPoller, MainAccountPoller, PollScheduler, PollerPolicy,
    SchedulerEnv,
};
pub use receive::{
    EnvelopeDecoder, MessageDispatcher, OptimisticTracker, ReceiveStateReconciler,
    ReconcileOptions,
};
pub use store::{Storage, StorageBackend, StoreError};
pub use transport::{SwarmProvider, Transport};
pub use types::{ApplicationState, Namespace, PollTarget, Snode};
