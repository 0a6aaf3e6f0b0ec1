// Receive-state reconciliation — applying a decoded message's side effects
//
// Everything for one batch happens inside a single storage write. Errors
// are collected per message; one bad message never aborts the batch.
// Notifications and outbound control messages are emitted strictly after
// the write returns — no network or host I/O inside a transaction.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::ReceiveError;
use crate::jobs::{Job, JobRunner};
use crate::message::{
    CallControlContent, CallControlKind, DataExtractionContent, DecodedContent, DecodedMessage,
    ExpiryMode, ReactionAction, ReceiptContent, ReceiptKind, SharedConfigContent, ThreadKind,
    UnsendContent, VisibleContent,
};
use crate::notify::Notifier;
use crate::store::interactions::InsertOutcome;
use crate::store::records::{
    AttachmentRecord, ConfigRecord, DeliveryState, Interaction, InteractionVariant, ProfileRecord,
    Reaction, RecipientState, ThreadRecord,
};
use crate::store::{Storage, StoreError, StoreTx};
use crate::types::ApplicationState;

/// Caller-supplied context for one batch
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub app_state: ApplicationState,
    /// A call is already active; incoming offers get a busy hang-up
    pub call_busy: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            app_state: ApplicationState::Background,
            call_busy: false,
        }
    }
}

/// What one batch did
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Ids of interactions inserted by this batch
    pub inserted: Vec<u64>,
    /// Per-message failures (server hash where known)
    pub errors: Vec<(Option<String>, ReceiveError)>,
    /// Typing state changes, not persisted
    pub typing: Vec<(String, bool)>,
    /// Control messages the host must send, strictly after commit
    pub post_commit_sends: Vec<CallControlContent>,
}

/// Events deferred until the storage write has committed
enum DeferredEvent {
    NotifyMessage { interaction_id: u64 },
    NotifyReaction { reaction: Reaction },
}

pub struct ReceiveStateReconciler {
    storage: Storage,
    notifier: Arc<dyn Notifier>,
    jobs: Arc<dyn JobRunner>,
    user_public_key: String,
}

impl ReceiveStateReconciler {
    pub fn new(
        storage: Storage,
        notifier: Arc<dyn Notifier>,
        jobs: Arc<dyn JobRunner>,
        user_public_key: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            notifier,
            jobs,
            user_public_key: user_public_key.into(),
        }
    }

    /// Apply one thread's messages under a single storage transaction.
    pub async fn reconcile_batch(
        &self,
        thread_id: &str,
        thread_kind: ThreadKind,
        messages: &[DecodedMessage],
        options: ReconcileOptions,
    ) -> Result<BatchOutcome, ReceiveError> {
        let now_ms = now_ms();
        let mut deferred: Vec<DeferredEvent> = Vec::new();

        let mut outcome = self
            .storage
            .write(|tx| {
                let mut outcome = BatchOutcome::default();
                for message in messages {
                    match self.apply_message(tx, thread_id, thread_kind, message, options, now_ms)
                    {
                        Ok(ApplyResult {
                            inserted,
                            events,
                            typing,
                            post_commit_send,
                        }) => {
                            outcome.inserted.extend(inserted);
                            deferred.extend(events);
                            outcome.typing.extend(typing);
                            outcome.post_commit_sends.extend(post_commit_send);
                        }
                        Err(err) => {
                            warn!(
                                thread = thread_id,
                                hash = message.server_hash.as_deref().unwrap_or("-"),
                                %err,
                                "Message reconciliation failed"
                            );
                            outcome.errors.push((message.server_hash.clone(), err));
                        }
                    }
                }
                Ok(outcome)
            })
            .await
            .map_err(|e| ReceiveError::Storage(e.to_string()))?;

        // Post-commit effects: fire-and-forget notifications
        if let Ok(Some(thread)) = self.storage.read(|tx| tx.thread(thread_id)) {
            for event in deferred {
                match event {
                    DeferredEvent::NotifyMessage { interaction_id } => {
                        if let Ok(Some(interaction)) =
                            self.storage.read(|tx| tx.interaction(interaction_id))
                        {
                            self.notifier
                                .notify_message(&interaction, &thread, options.app_state);
                        }
                    }
                    DeferredEvent::NotifyReaction { reaction } => {
                        self.notifier
                            .notify_reaction(&reaction, &thread, options.app_state);
                    }
                }
            }
        }

        outcome.post_commit_sends.dedup_by_key(|c| c.call_id.clone());
        Ok(outcome)
    }

    fn apply_message(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        thread_kind: ThreadKind,
        message: &DecodedMessage,
        options: ReconcileOptions,
        now_ms: u64,
    ) -> Result<ApplyResult, ReceiveError> {
        match &message.content {
            DecodedContent::SharedConfig(config) => {
                self.apply_shared_config(tx, thread_id, thread_kind, message, config)
            }
            DecodedContent::Visible(visible) if visible.reaction.is_some() => {
                self.apply_reaction(tx, thread_id, message, visible)
            }
            DecodedContent::Visible(visible) => {
                self.apply_visible(tx, thread_id, thread_kind, message, visible, now_ms)
            }
            DecodedContent::CallControl(call) => {
                self.apply_call(tx, thread_id, thread_kind, message, call, options, now_ms)
            }
            DecodedContent::DataExtraction(extraction) => {
                self.apply_data_extraction(tx, thread_id, message, extraction, now_ms)
            }
            DecodedContent::TypingIndicator(typing) => {
                // Nothing persisted; the host renders and expires it
                self.require_thread(tx, thread_id)?;
                Ok(ApplyResult::typing(thread_id, typing.started))
            }
            DecodedContent::Receipt(receipt) => self.apply_receipt(tx, thread_id, message, receipt),
            DecodedContent::UnsendRequest(unsend) => self.apply_unsend(tx, thread_id, message, unsend),
        }
    }

    /// Config establishes thread state, so it may create the thread record;
    /// stale seqnos are ignored.
    fn apply_shared_config(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        thread_kind: ThreadKind,
        message: &DecodedMessage,
        config: &SharedConfigContent,
    ) -> Result<ApplyResult, ReceiveError> {
        if let Some(existing) = tx.config(thread_id)? {
            if existing.seqno >= config.seqno {
                debug!(thread = thread_id, seqno = config.seqno, "Stale config, ignored");
                return Ok(ApplyResult::empty());
            }
        }

        tx.put_config(&ConfigRecord {
            thread_id: thread_id.to_string(),
            seqno: config.seqno,
            timestamp_ms: message.timestamp_ms,
            deleted_before_ms: config.deleted_before_ms,
        })?;

        let mut thread = tx
            .thread(thread_id)?
            .unwrap_or_else(|| ThreadRecord::new(thread_id, thread_kind));
        thread.expires_in_seconds = config.expires_in_seconds;
        thread.expiry_mode = config.expiry_mode;
        tx.put_thread(&thread)?;

        Ok(ApplyResult::empty())
    }

    /// Reactions are an early-exit path: they resolve an existing
    /// interaction and mutate the reaction table directly.
    fn apply_reaction(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        message: &DecodedMessage,
        visible: &VisibleContent,
    ) -> Result<ApplyResult, ReceiveError> {
        let op = visible
            .reaction
            .as_ref()
            .ok_or_else(|| ReceiveError::InvalidMessage("missing reaction".into()))?;

        let target = tx
            .interaction_at(thread_id, op.target_timestamp_ms, &op.target_author)?
            .ok_or(ReceiveError::ObjectNotFound)?;

        self.update_profile(tx, message, visible)?;

        match op.action {
            ReactionAction::React => {
                // Re-delivered reacts are idempotent
                if tx.reaction(target.id, &op.emoji, &message.sender)?.is_some() {
                    return Ok(ApplyResult::empty());
                }
                let sort_id = tx.next_reaction_sort_id(target.id, &op.emoji)?;
                let reaction = Reaction {
                    interaction_id: target.id,
                    author_id: message.sender.clone(),
                    emoji: op.emoji.clone(),
                    count: 1,
                    sort_id,
                    timestamp_ms: message.timestamp_ms,
                };
                tx.put_reaction(&reaction)?;
                Ok(ApplyResult::reaction(reaction))
            }
            ReactionAction::Remove => {
                tx.remove_reaction(target.id, &op.emoji, &message.sender)?;
                Ok(ApplyResult::empty())
            }
        }
    }

    fn apply_visible(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        thread_kind: ThreadKind,
        message: &DecodedMessage,
        visible: &VisibleContent,
        now_ms: u64,
    ) -> Result<ApplyResult, ReceiveError> {
        let mut thread = self.resolve_thread(tx, thread_id, thread_kind)?;

        // Profile propagation does not depend on message acceptance
        self.update_profile(tx, message, visible)?;

        let outgoing = message.sender == self.user_public_key;
        let variant = if outgoing {
            InteractionVariant::StandardOutgoing
        } else {
            InteractionVariant::StandardIncoming
        };

        // Outgoing messages are read by definition; incoming ones are read
        // at insert when they land at or before the read watermark
        let was_read = outgoing || message.timestamp_ms <= thread.last_read_timestamp_ms;

        let (expires_in, expires_started) =
            compute_expiry(message, visible, &thread, was_read, now_ms);

        let interaction = Interaction {
            id: 0,
            thread_id: thread_id.to_string(),
            author_id: message.sender.clone(),
            variant,
            body: visible.body.clone(),
            timestamp_ms: message.timestamp_ms,
            received_at_ms: now_ms,
            was_read,
            expires_in_seconds: expires_in,
            expires_started_at_ms: expires_started,
            server_hash: message.server_hash.clone(),
            quote: visible.quote.clone(),
            link_preview: visible.link_preview.clone(),
        };

        let id = match tx.insert_interaction(&interaction)? {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate(existing) if outgoing => {
                // This device's own send round-tripped via the network:
                // merge recipient/read bookkeeping only
                self.merge_outgoing_duplicate(tx, thread_id, existing, now_ms)?;
                return Ok(ApplyResult::empty());
            }
            InsertOutcome::Duplicate(_) => return Err(ReceiveError::DuplicateMessage),
        };

        self.persist_attachments(tx, thread_id, thread_kind, id, message, visible)?;

        if outgoing {
            // Recipient bookkeeping plus read backfill: everything strictly
            // older than our own send has been seen by us
            if thread_kind == ThreadKind::OneToOne {
                tx.put_recipient_state(&RecipientState {
                    interaction_id: id,
                    recipient_id: thread_id.to_string(),
                    state: DeliveryState::Sent,
                    read_timestamp_ms: None,
                    failure_text: None,
                })?;
            }
            tx.mark_read_before(thread_id, message.timestamp_ms, now_ms)?;
            thread.last_read_timestamp_ms = thread.last_read_timestamp_ms.max(message.timestamp_ms);
        }

        thread.last_message_timestamp_ms = Some(
            thread
                .last_message_timestamp_ms
                .unwrap_or(0)
                .max(message.timestamp_ms),
        );
        tx.put_thread(&thread)?;

        if !outgoing && !was_read {
            Ok(ApplyResult::inserted_notifying(id))
        } else {
            Ok(ApplyResult::inserted(id))
        }
    }

    fn apply_call(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        thread_kind: ThreadKind,
        message: &DecodedMessage,
        call: &CallControlContent,
        options: ReconcileOptions,
        now_ms: u64,
    ) -> Result<ApplyResult, ReceiveError> {
        let mut thread = self.resolve_thread(tx, thread_id, thread_kind)?;

        // Only offers and hang-ups leave a trace in the conversation
        let body = match call.kind {
            CallControlKind::Offer | CallControlKind::PreOffer => {
                if options.call_busy {
                    Some("call_missed_busy")
                } else {
                    Some("call_incoming")
                }
            }
            CallControlKind::EndCall => Some("call_ended"),
            CallControlKind::Answer | CallControlKind::IceCandidates => None,
        };
        let Some(body) = body else {
            return Ok(ApplyResult::empty());
        };

        let interaction = Interaction {
            id: 0,
            thread_id: thread_id.to_string(),
            author_id: message.sender.clone(),
            variant: InteractionVariant::InfoCall,
            body: Some(body.to_string()),
            timestamp_ms: message.timestamp_ms,
            received_at_ms: now_ms,
            was_read: message.timestamp_ms <= thread.last_read_timestamp_ms,
            expires_in_seconds: None,
            expires_started_at_ms: None,
            server_hash: message.server_hash.clone(),
            quote: None,
            link_preview: None,
        };

        let mut result = match tx.insert_interaction(&interaction)? {
            InsertOutcome::Inserted(id) => {
                thread.last_message_timestamp_ms = Some(
                    thread
                        .last_message_timestamp_ms
                        .unwrap_or(0)
                        .max(message.timestamp_ms),
                );
                tx.put_thread(&thread)?;
                if interaction.was_read {
                    ApplyResult::inserted(id)
                } else {
                    ApplyResult::inserted_notifying(id)
                }
            }
            InsertOutcome::Duplicate(_) => return Err(ReceiveError::DuplicateControlMessage),
        };

        // The busy hang-up is data here; the caller sends it after commit
        if options.call_busy && matches!(call.kind, CallControlKind::Offer | CallControlKind::PreOffer)
        {
            result.post_commit_send.push(CallControlContent {
                call_id: call.call_id.clone(),
                kind: CallControlKind::EndCall,
                payload: b"busy".to_vec(),
            });
        }

        Ok(result)
    }

    fn apply_data_extraction(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        message: &DecodedMessage,
        extraction: &DataExtractionContent,
        now_ms: u64,
    ) -> Result<ApplyResult, ReceiveError> {
        let thread = self.require_thread(tx, thread_id)?;

        let body = match extraction.kind {
            crate::message::DataExtractionKind::Screenshot => "screenshot_taken",
            crate::message::DataExtractionKind::MediaSaved => "media_saved",
        };
        let interaction = Interaction {
            id: 0,
            thread_id: thread_id.to_string(),
            author_id: message.sender.clone(),
            variant: InteractionVariant::InfoDataExtraction,
            body: Some(body.to_string()),
            timestamp_ms: message.timestamp_ms,
            received_at_ms: now_ms,
            was_read: message.timestamp_ms <= thread.last_read_timestamp_ms,
            expires_in_seconds: None,
            expires_started_at_ms: None,
            server_hash: message.server_hash.clone(),
            quote: None,
            link_preview: None,
        };
        match tx.insert_interaction(&interaction)? {
            InsertOutcome::Inserted(id) => Ok(ApplyResult::inserted(id)),
            InsertOutcome::Duplicate(_) => Err(ReceiveError::DuplicateControlMessage),
        }
    }

    /// Receipts acknowledge this user's own sends; updates are idempotent
    fn apply_receipt(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        message: &DecodedMessage,
        receipt: &ReceiptContent,
    ) -> Result<ApplyResult, ReceiveError> {
        for &timestamp_ms in &receipt.timestamps_ms {
            let Some(target) =
                tx.interaction_at(thread_id, timestamp_ms, &self.user_public_key)?
            else {
                continue; // Receipt for something we no longer have
            };
            let mut state = tx
                .recipient_state(target.id, &message.sender)?
                .unwrap_or(RecipientState {
                    interaction_id: target.id,
                    recipient_id: message.sender.clone(),
                    state: DeliveryState::Sent,
                    read_timestamp_ms: None,
                    failure_text: None,
                });
            state.state = DeliveryState::Sent;
            if receipt.kind == ReceiptKind::Read && state.read_timestamp_ms.is_none() {
                state.read_timestamp_ms = Some(message.timestamp_ms);
            }
            tx.put_recipient_state(&state)?;
        }
        Ok(ApplyResult::empty())
    }

    /// An unsend tombstones the target, but only for its original author
    fn apply_unsend(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        message: &DecodedMessage,
        unsend: &UnsendContent,
    ) -> Result<ApplyResult, ReceiveError> {
        if message.sender != unsend.target_author {
            return Err(ReceiveError::InvalidMessage(
                "unsend from non-author".into(),
            ));
        }
        let mut target = tx
            .interaction_at(thread_id, unsend.target_timestamp_ms, &unsend.target_author)?
            .ok_or(ReceiveError::ObjectNotFound)?;

        let previous_variant = target.variant;
        target.variant = InteractionVariant::InfoMessageDeleted;
        target.body = None;
        target.quote = None;
        target.link_preview = None;
        tx.update_interaction(&target, previous_variant)?;

        for reaction in tx.reactions_for(target.id)? {
            tx.remove_reaction(target.id, &reaction.emoji, &reaction.author_id)?;
        }
        Ok(ApplyResult::empty())
    }

    // Helpers ----------------------------------------------------------------

    /// Resolve or create the destination thread. Never destructive: only
    /// 1:1 threads may materialize from network input; group and community
    /// threads require local config to exist already.
    fn resolve_thread(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        thread_kind: ThreadKind,
    ) -> Result<ThreadRecord, ReceiveError> {
        if let Some(thread) = tx.thread(thread_id)? {
            return Ok(thread);
        }
        if thread_kind == ThreadKind::OneToOne {
            let thread = ThreadRecord::new(thread_id, thread_kind);
            tx.put_thread(&thread)?;
            return Ok(thread);
        }
        Err(ReceiveError::NoThread)
    }

    fn require_thread(&self, tx: &StoreTx<'_>, thread_id: &str) -> Result<ThreadRecord, ReceiveError> {
        tx.thread(thread_id)?.ok_or(ReceiveError::NoThread)
    }

    fn update_profile(
        &self,
        tx: &StoreTx<'_>,
        message: &DecodedMessage,
        visible: &VisibleContent,
    ) -> Result<(), StoreError> {
        let Some(update) = &visible.profile else {
            return Ok(());
        };
        let mut profile = tx.profile(&message.sender)?.unwrap_or(ProfileRecord {
            id: message.sender.clone(),
            ..Default::default()
        });
        if update.display_name.is_some() {
            profile.display_name = update.display_name.clone();
        }
        if update.avatar_url.is_some() {
            profile.avatar_url = update.avatar_url.clone();
        }
        tx.put_profile(&profile)
    }

    fn merge_outgoing_duplicate(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        existing_id: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mut state = tx
            .recipient_state(existing_id, thread_id)?
            .unwrap_or(RecipientState {
                interaction_id: existing_id,
                recipient_id: thread_id.to_string(),
                state: DeliveryState::Sent,
                read_timestamp_ms: None,
                failure_text: None,
            });
        state.state = DeliveryState::Sent;
        state.failure_text = None;
        tx.put_recipient_state(&state)?;

        if let Some(mut interaction) = tx.interaction(existing_id)? {
            if !interaction.was_read {
                interaction.was_read = true;
                if interaction.expires_in_seconds.is_some()
                    && interaction.expires_started_at_ms.is_none()
                {
                    interaction.expires_started_at_ms = Some(now_ms);
                }
                tx.update_interaction(&interaction, interaction.variant)?;
            }
        }
        Ok(())
    }

    fn persist_attachments(
        &self,
        tx: &StoreTx<'_>,
        thread_id: &str,
        thread_kind: ThreadKind,
        interaction_id: u64,
        message: &DecodedMessage,
        visible: &VisibleContent,
    ) -> Result<(), StoreError> {
        if visible.attachments.is_empty() {
            return Ok(());
        }

        // Download-on-demand for untrusted 1:1 senders; everything else is
        // fetched eagerly. Enforced here, not in the UI.
        let trusted_sender = tx
            .profile(&message.sender)?
            .map(|p| p.is_trusted)
            .unwrap_or(false);
        let queue_downloads = trusted_sender || thread_kind != ThreadKind::OneToOne;

        for pointer in &visible.attachments {
            let record = AttachmentRecord {
                id: uuid::Uuid::new_v4().to_string(),
                interaction_id,
                pointer: pointer.clone(),
                download_queued: queue_downloads,
            };
            tx.put_attachment(&record)?;
            if queue_downloads {
                self.jobs.add(
                    Job::attachment_download(thread_id, interaction_id, pointer.clone()),
                    true,
                );
            }
        }
        Ok(())
    }
}

/// Merge the message's own expiry hint with the thread default and the
/// server-reported expiration. Disappear-after-read starts immediately when
/// the message is already read at insert.
fn compute_expiry(
    message: &DecodedMessage,
    visible: &VisibleContent,
    thread: &ThreadRecord,
    was_read: bool,
    now_ms: u64,
) -> (Option<u32>, Option<u64>) {
    let (expires_in, mode) = match visible.expires_in_seconds {
        Some(secs) => (Some(secs), visible.expiry_mode),
        None => (thread.expires_in_seconds, thread.expiry_mode),
    };
    let Some(secs) = expires_in else {
        return (None, None);
    };

    let mut started = match mode {
        ExpiryMode::AfterSend => Some(message.timestamp_ms),
        ExpiryMode::AfterRead if was_read => Some(now_ms),
        ExpiryMode::AfterRead | ExpiryMode::None => None,
    };

    // A server expiration earlier than our computed deadline wins; the
    // swarm will delete its copy then regardless of local policy
    if let (Some(local_start), Some(server_expiry)) = (started, message.server_expiration_ms) {
        let server_start = server_expiry.saturating_sub(u64::from(secs) * 1000);
        started = Some(local_start.min(server_start));
    }

    (Some(secs), started)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-message application result, accumulated into the batch outcome
struct ApplyResult {
    inserted: Vec<u64>,
    events: Vec<DeferredEvent>,
    typing: Vec<(String, bool)>,
    post_commit_send: Vec<CallControlContent>,
}

impl ApplyResult {
    fn empty() -> Self {
        Self {
            inserted: Vec::new(),
            events: Vec::new(),
            typing: Vec::new(),
            post_commit_send: Vec::new(),
        }
    }

    fn inserted(id: u64) -> Self {
        Self {
            inserted: vec![id],
            ..Self::empty()
        }
    }

    fn inserted_notifying(id: u64) -> Self {
        Self {
            inserted: vec![id],
            events: vec![DeferredEvent::NotifyMessage { interaction_id: id }],
            ..Self::empty()
        }
    }

    fn reaction(reaction: Reaction) -> Self {
        Self {
            events: vec![DeferredEvent::NotifyReaction { reaction }],
            ..Self::empty()
        }
    }

    fn typing(thread_id: &str, started: bool) -> Self {
        Self {
            typing: vec![(thread_id.to_string(), started)],
            ..Self::empty()
        }
    }
}
