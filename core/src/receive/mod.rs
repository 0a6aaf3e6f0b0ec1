// Receive pipeline — decode, dispatch, reconcile, optimistic merge

pub mod decoder;
pub mod dispatcher;
pub mod optimistic;
pub mod reconciler;

pub use decoder::{DecodeOutcome, EnvelopeDecoder};
pub use dispatcher::{DispatchMode, MessageDispatcher, ScheduledUnit};
pub use optimistic::{OptimisticMessage, OptimisticState, OptimisticTracker};
pub use reconciler::{BatchOutcome, ReceiveStateReconciler, ReconcileOptions};
