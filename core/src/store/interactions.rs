// Interaction CRUD, uniqueness indexes, reactions and recipient states
//
// Uniqueness is what makes receive processing idempotent under
// at-least-once delivery: server-sourced messages are unique on server
// hash, outgoing messages on (thread, author, timestamp, variant).

use super::records::{
    self, AttachmentRecord, Interaction, InteractionVariant, Reaction, RecipientState,
};
use super::{decode, encode, StoreError, StoreTx};

/// Result of attempting to insert an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(u64),
    /// A row with the same identity already exists; its id is returned so
    /// the caller can merge recipient/read state idempotently.
    Duplicate(u64),
}

impl InsertOutcome {
    pub fn id(&self) -> u64 {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }
}

impl<'a> StoreTx<'a> {
    fn next_interaction_id(&self) -> Result<u64, StoreError> {
        let next = match self.backend().get(records::INTERACTION_ID_SEQ_KEY)? {
            Some(bytes) => decode::<u64>(&bytes)? + 1,
            None => 1,
        };
        self.backend()
            .put(records::INTERACTION_ID_SEQ_KEY, &encode(&next)?)?;
        Ok(next)
    }

    /// Insert an interaction, enforcing both uniqueness indexes. The `id`
    /// field of the argument is ignored; the assigned id is returned.
    pub fn insert_interaction(
        &self,
        interaction: &Interaction,
    ) -> Result<InsertOutcome, StoreError> {
        if let Some(hash) = interaction.server_hash.as_deref() {
            if let Some(existing) = self.interaction_id_by_server_hash(hash)? {
                return Ok(InsertOutcome::Duplicate(existing));
            }
        }

        let uniq_key = records::interaction_uniq_key(
            &interaction.thread_id,
            &interaction.author_id,
            interaction.timestamp_ms,
            interaction.variant.tag(),
        );
        if let Some(bytes) = self.backend().get(&uniq_key)? {
            return Ok(InsertOutcome::Duplicate(decode(&bytes)?));
        }

        let id = self.next_interaction_id()?;
        let mut stored = interaction.clone();
        stored.id = id;

        self.backend()
            .put(&records::interaction_key(id), &encode(&stored)?)?;
        self.backend().put(&uniq_key, &encode(&id)?)?;
        self.backend().put(
            &records::thread_message_key(&stored.thread_id, stored.timestamp_ms, id),
            &encode(&id)?,
        )?;
        self.backend().put(
            &records::interaction_tsa_key(
                &stored.thread_id,
                stored.timestamp_ms,
                &stored.author_id,
            ),
            &encode(&id)?,
        )?;
        if let Some(hash) = stored.server_hash.as_deref() {
            self.backend()
                .put(&records::interaction_hash_key(hash), &encode(&id)?)?;
        }

        Ok(InsertOutcome::Inserted(id))
    }

    pub fn interaction(&self, id: u64) -> Result<Option<Interaction>, StoreError> {
        match self.backend().get(&records::interaction_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Rewrite an interaction in place, fixing the uniqueness index when the
    /// variant changed (unsend turns a standard message into a tombstone).
    pub fn update_interaction(
        &self,
        interaction: &Interaction,
        previous_variant: InteractionVariant,
    ) -> Result<(), StoreError> {
        if previous_variant != interaction.variant {
            self.backend().remove(&records::interaction_uniq_key(
                &interaction.thread_id,
                &interaction.author_id,
                interaction.timestamp_ms,
                previous_variant.tag(),
            ))?;
            self.backend().put(
                &records::interaction_uniq_key(
                    &interaction.thread_id,
                    &interaction.author_id,
                    interaction.timestamp_ms,
                    interaction.variant.tag(),
                ),
                &encode(&interaction.id)?,
            )?;
        }
        self.backend().put(
            &records::interaction_key(interaction.id),
            &encode(interaction)?,
        )
    }

    fn interaction_id_by_server_hash(&self, hash: &str) -> Result<Option<u64>, StoreError> {
        match self.backend().get(&records::interaction_hash_key(hash))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn interaction_by_server_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Interaction>, StoreError> {
        match self.interaction_id_by_server_hash(hash)? {
            Some(id) => self.interaction(id),
            None => Ok(None),
        }
    }

    /// Look up the interaction a reaction or unsend targets
    pub fn interaction_at(
        &self,
        thread_id: &str,
        timestamp_ms: u64,
        author_id: &str,
    ) -> Result<Option<Interaction>, StoreError> {
        let key = records::interaction_tsa_key(thread_id, timestamp_ms, author_id);
        match self.backend().get(&key)? {
            Some(bytes) => self.interaction(decode(&bytes)?),
            None => Ok(None),
        }
    }

    /// All interactions in a thread, ordered by sent timestamp
    pub fn interactions_for_thread(
        &self,
        thread_id: &str,
    ) -> Result<Vec<Interaction>, StoreError> {
        let mut out = Vec::new();
        for (_, bytes) in self
            .backend()
            .scan_prefix(&records::thread_message_prefix(thread_id))?
        {
            let id: u64 = decode(&bytes)?;
            if let Some(interaction) = self.interaction(id)? {
                out.push(interaction);
            }
        }
        Ok(out)
    }

    /// Mark every unread interaction with sent timestamp strictly before
    /// `before_timestamp_ms` as read, starting disappear-after-read clocks.
    /// Returns the ids that changed.
    pub fn mark_read_before(
        &self,
        thread_id: &str,
        before_timestamp_ms: u64,
        now_ms: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let mut changed = Vec::new();
        for mut interaction in self.interactions_for_thread(thread_id)? {
            if interaction.timestamp_ms >= before_timestamp_ms || interaction.was_read {
                continue;
            }
            interaction.was_read = true;
            if interaction.expires_in_seconds.is_some()
                && interaction.expires_started_at_ms.is_none()
            {
                interaction.expires_started_at_ms = Some(now_ms);
            }
            self.backend().put(
                &records::interaction_key(interaction.id),
                &encode(&interaction)?,
            )?;
            changed.push(interaction.id);
        }
        Ok(changed)
    }

    /// Interactions whose disappearing deadline has passed
    pub fn expired_interactions(&self, now_ms: u64) -> Result<Vec<Interaction>, StoreError> {
        let mut out = Vec::new();
        for (_, bytes) in self.backend().scan_prefix(b"interaction/")? {
            let interaction: Interaction = decode(&bytes)?;
            if matches!(interaction.expires_at_ms(), Some(deadline) if deadline <= now_ms) {
                out.push(interaction);
            }
        }
        Ok(out)
    }

    // Reactions --------------------------------------------------------------

    /// Next sort id within (interaction, emoji); collision-free because the
    /// counter lives under the single writer lock.
    pub fn next_reaction_sort_id(
        &self,
        interaction_id: u64,
        emoji: &str,
    ) -> Result<u64, StoreError> {
        let key = records::reaction_seq_key(interaction_id, emoji);
        let next = match self.backend().get(&key)? {
            Some(bytes) => decode::<u64>(&bytes)? + 1,
            None => 1,
        };
        self.backend().put(&key, &encode(&next)?)?;
        Ok(next)
    }

    pub fn put_reaction(&self, reaction: &Reaction) -> Result<(), StoreError> {
        self.backend().put(
            &records::reaction_key(reaction.interaction_id, &reaction.emoji, &reaction.author_id),
            &encode(reaction)?,
        )
    }

    pub fn reaction(
        &self,
        interaction_id: u64,
        emoji: &str,
        author_id: &str,
    ) -> Result<Option<Reaction>, StoreError> {
        match self
            .backend()
            .get(&records::reaction_key(interaction_id, emoji, author_id))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_reaction(
        &self,
        interaction_id: u64,
        emoji: &str,
        author_id: &str,
    ) -> Result<(), StoreError> {
        self.backend()
            .remove(&records::reaction_key(interaction_id, emoji, author_id))
    }

    pub fn reactions_for(&self, interaction_id: u64) -> Result<Vec<Reaction>, StoreError> {
        let mut out = Vec::new();
        for (_, bytes) in self
            .backend()
            .scan_prefix(&records::reaction_prefix(interaction_id))?
        {
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    // Recipient states -------------------------------------------------------

    pub fn recipient_state(
        &self,
        interaction_id: u64,
        recipient_id: &str,
    ) -> Result<Option<RecipientState>, StoreError> {
        match self
            .backend()
            .get(&records::recipient_key(interaction_id, recipient_id))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_recipient_state(&self, state: &RecipientState) -> Result<(), StoreError> {
        self.backend().put(
            &records::recipient_key(state.interaction_id, &state.recipient_id),
            &encode(state)?,
        )
    }

    // Attachments ------------------------------------------------------------

    pub fn put_attachment(&self, attachment: &AttachmentRecord) -> Result<(), StoreError> {
        self.backend().put(
            &records::attachment_key(attachment.interaction_id, &attachment.id),
            &encode(attachment)?,
        )
    }

    pub fn attachments_for(
        &self,
        interaction_id: u64,
    ) -> Result<Vec<AttachmentRecord>, StoreError> {
        let mut out = Vec::new();
        for (_, bytes) in self
            .backend()
            .scan_prefix(&records::attachment_prefix(interaction_id))?
        {
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }
}
