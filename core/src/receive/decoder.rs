// Envelope decoding — classify, decrypt, parse, dedup
//
// Decoding is caught per message: one bad envelope never aborts the batch.
// Errors flagged `should_update_last_hash` still advance the namespace's
// pagination cursor so an already-handled message is never refetched.

use tracing::{debug, trace};

use crate::crypto::{Crypto, KeyContext};
use crate::envelope::{Envelope, EnvelopeKind, NamespaceResult, RawReceivedEnvelope};
use crate::error::ReceiveError;
use crate::message::{DecodedContent, DecodedMessage, ThreadKind, WireMessage};
use crate::store::StoreTx;
use crate::types::{PollTarget, Snode};

/// Outcome of decoding one poll response
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    /// Successfully decoded, deduplicated messages in arrival order
    pub decoded: Vec<DecodedMessage>,
    /// Per-message classifications for discarded envelopes
    pub errors: Vec<(String, ReceiveError)>,
    /// Whether any discarded duplicate still counted as forward progress
    pub had_valid_hash_update: bool,
}

pub struct EnvelopeDecoder<'a> {
    crypto: &'a dyn Crypto,
    /// The current user's account public key, for self-send detection
    user_public_key: &'a str,
}

impl<'a> EnvelopeDecoder<'a> {
    pub fn new(crypto: &'a dyn Crypto, user_public_key: &'a str) -> Self {
        Self {
            crypto,
            user_public_key,
        }
    }

    /// Decode every message in a poll response inside one storage write,
    /// marking hashes seen and advancing per-namespace last-hash cursors.
    pub fn decode_batch(
        &self,
        target: &PollTarget,
        node: &Snode,
        results: &[NamespaceResult],
        tx: &StoreTx<'_>,
    ) -> Result<DecodeOutcome, ReceiveError> {
        let mut outcome = DecodeOutcome::default();

        for result in results {
            // Cursor advances per message, stopping at the first envelope
            // that must be refetched (retryable storage trouble aside, that
            // set is empty today; the walk still only advances past handled
            // messages).
            let mut advanced_to: Option<&str> = None;

            for raw in &result.messages {
                match self.decode_one(target, node, raw, tx) {
                    Ok(message) => {
                        tx.mark_hash_seen(&raw.server_hash, &node.address)?;
                        advanced_to = Some(&raw.server_hash);
                        outcome.decoded.push(message);
                    }
                    Err(err) => {
                        debug!(
                            hash = %raw.server_hash,
                            namespace = result.namespace.tag(),
                            %err,
                            "Discarding envelope"
                        );
                        if err.should_update_last_hash() {
                            tx.mark_hash_seen(&raw.server_hash, &node.address)?;
                            advanced_to = Some(&raw.server_hash);
                        }
                        outcome.had_valid_hash_update |= err.had_valid_hash_update();
                        outcome.errors.push((raw.server_hash.clone(), err));
                    }
                }
            }

            if let Some(hash) = advanced_to {
                tx.set_last_hash(&target.id(), result.namespace.tag(), hash)?;
            }
        }

        trace!(
            decoded = outcome.decoded.len(),
            discarded = outcome.errors.len(),
            "Decoded poll batch"
        );
        Ok(outcome)
    }

    /// Decode a single raw envelope. Step order matters: classification,
    /// decryption, parsing, dedup, then the discard checks whose errors
    /// still advance read-state bookkeeping.
    pub fn decode_one(
        &self,
        target: &PollTarget,
        node: &Snode,
        raw: &RawReceivedEnvelope,
        tx: &StoreTx<'_>,
    ) -> Result<DecodedMessage, ReceiveError> {
        let envelope = Envelope::from_bytes(&raw.data)?;
        let kind = envelope.classify()?;

        let context = key_context(target, kind);
        let plaintext = self.crypto.decrypt(&envelope.ciphertext, &context)?;
        let content = WireMessage::from_bytes(&plaintext.content)?.parse()?;

        if let Some(first_node) = tx.seen_node_for_hash(&raw.server_hash)? {
            return Err(if first_node != node.address {
                ReceiveError::DuplicateFromDifferentNode
            } else if content.is_config() {
                ReceiveError::DuplicateControlMessage
            } else {
                ReceiveError::DuplicateMessage
            });
        }

        if let Some(profile) = tx.profile(&plaintext.sender)? {
            if profile.is_blocked {
                return Err(ReceiveError::SenderBlocked);
            }
        }

        // Config messages originate from the user's own devices, and a
        // closed-group echo of our own send must reach the reconciler so it
        // can merge recipient state idempotently. Everything else from self
        // is suppressed.
        let group_target = matches!(target, PollTarget::ClosedGroup { .. });
        if !content.is_config() && !group_target && self.is_self(&plaintext.sender, target) {
            return Err(ReceiveError::SelfSend);
        }

        let (thread_id, thread_kind) = resolve_thread(target, &plaintext.sender);

        if matches!(content, DecodedContent::Visible(_)) {
            if let Some(config) = tx.config(&thread_id)? {
                if matches!(config.deleted_before_ms, Some(cutoff) if envelope.timestamp_ms <= cutoff)
                {
                    return Err(ReceiveError::OutdatedRelativeToConfig);
                }
            }
        }

        Ok(DecodedMessage {
            thread_id,
            thread_kind,
            sender: plaintext.sender,
            timestamp_ms: envelope.timestamp_ms,
            server_hash: Some(raw.server_hash.clone()),
            namespace: raw.namespace,
            server_expiration_ms: raw.server_expiration_ms,
            content,
        })
    }

    fn is_self(&self, sender: &str, target: &PollTarget) -> bool {
        if sender == self.user_public_key {
            return true;
        }
        if let PollTarget::Community {
            server_public_key, ..
        } = target
        {
            return self
                .crypto
                .blinded_equivalent(self.user_public_key, sender, server_public_key);
        }
        false
    }
}

fn key_context(target: &PollTarget, kind: EnvelopeKind) -> KeyContext {
    match (target, kind) {
        (PollTarget::ClosedGroup { group_public_key }, _) => KeyContext::ClosedGroup {
            group_public_key: group_public_key.clone(),
        },
        (
            PollTarget::Community {
                server_public_key, ..
            },
            _,
        ) => KeyContext::Community {
            server_public_key: server_public_key.clone(),
        },
        (PollTarget::MainAccount { .. }, EnvelopeKind::ClosedGroupMessage) => {
            // Legacy group messages can arrive via the account swarm
            KeyContext::OneToOne
        }
        (PollTarget::MainAccount { .. }, EnvelopeKind::SessionMessage) => KeyContext::OneToOne,
    }
}

/// Every decoded message resolves to exactly one destination thread
fn resolve_thread(target: &PollTarget, sender: &str) -> (String, ThreadKind) {
    match target {
        PollTarget::MainAccount { .. } => (sender.to_string(), ThreadKind::OneToOne),
        PollTarget::ClosedGroup { group_public_key } => {
            (group_public_key.clone(), ThreadKind::ClosedGroup)
        }
        PollTarget::Community {
            server_url, room, ..
        } => (format!("{}/{}", server_url, room), ThreadKind::Community),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MockCrypto, Plaintext};
    use crate::envelope::ENVELOPE_KIND_SESSION;
    use crate::message::{VisibleContent, WireMessage, KIND_VISIBLE};
    use crate::store::records::ProfileRecord;
    use crate::store::Storage;
    use crate::types::Namespace;

    const USER: &str = "05me";

    fn raw_envelope(hash: &str, timestamp_ms: u64) -> RawReceivedEnvelope {
        let wire = WireMessage {
            kind: KIND_VISIBLE,
            payload: bincode::serialize(&VisibleContent::text("hey")).unwrap(),
        };
        let envelope = Envelope {
            kind: ENVELOPE_KIND_SESSION,
            timestamp_ms,
            ciphertext: wire.to_bytes().unwrap(),
        };
        RawReceivedEnvelope {
            data: envelope.to_bytes().unwrap(),
            server_hash: hash.to_string(),
            namespace: Namespace::Default,
            server_expiration_ms: None,
            server_timestamp_ms: timestamp_ms + 20,
        }
    }

    /// Crypto double whose "decryption" passes the ciphertext through and
    /// attributes it to a fixed sender.
    fn passthrough_crypto(sender: &str) -> MockCrypto {
        let sender = sender.to_string();
        let mut crypto = MockCrypto::new();
        crypto.expect_decrypt().returning(move |ciphertext, _| {
            Ok(Plaintext {
                sender: sender.clone(),
                content: ciphertext.to_vec(),
            })
        });
        crypto.expect_blinded_equivalent().return_const(false);
        crypto
    }

    fn account_target() -> PollTarget {
        PollTarget::MainAccount {
            public_key: USER.into(),
        }
    }

    #[tokio::test]
    async fn test_decode_batch_happy_path() {
        let storage = Storage::in_memory();
        let crypto = passthrough_crypto("05alice");
        let decoder = EnvelopeDecoder::new(&crypto, USER);
        let node = Snode::new("node-a:1", "pk");
        let results = vec![NamespaceResult {
            namespace: Namespace::Default,
            messages: vec![raw_envelope("h1", 100), raw_envelope("h2", 200)],
            last_hash: Some("h2".into()),
        }];

        let outcome = storage
            .write(|tx| {
                decoder
                    .decode_batch(&account_target(), &node, &results, tx)
                    .map_err(|e| crate::store::StoreError::Backend(e.to_string()))
            })
            .await
            .unwrap();

        assert_eq!(outcome.decoded.len(), 2);
        assert_eq!(outcome.decoded[0].thread_id, "05alice");
        assert!(outcome.errors.is_empty());

        let cursor = storage
            .read(|tx| tx.last_hash(&account_target().id(), "default"))
            .unwrap();
        assert_eq!(cursor.as_deref(), Some("h2"));
    }

    #[tokio::test]
    async fn test_same_node_duplicate() {
        let storage = Storage::in_memory();
        let crypto = passthrough_crypto("05alice");
        let decoder = EnvelopeDecoder::new(&crypto, USER);
        let node = Snode::new("node-a:1", "pk");
        let results = vec![NamespaceResult {
            namespace: Namespace::Default,
            messages: vec![raw_envelope("h1", 100)],
            last_hash: None,
        }];

        for expected_decoded in [1usize, 0] {
            let outcome = storage
                .write(|tx| {
                    decoder
                        .decode_batch(&account_target(), &node, &results, tx)
                        .map_err(|e| crate::store::StoreError::Backend(e.to_string()))
                })
                .await
                .unwrap();
            assert_eq!(outcome.decoded.len(), expected_decoded);
            if expected_decoded == 0 {
                assert_eq!(outcome.errors[0].1, ReceiveError::DuplicateMessage);
                assert!(!outcome.had_valid_hash_update);
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_from_different_node() {
        let storage = Storage::in_memory();
        let crypto = passthrough_crypto("05alice");
        let decoder = EnvelopeDecoder::new(&crypto, USER);
        let results = vec![NamespaceResult {
            namespace: Namespace::Default,
            messages: vec![raw_envelope("h1", 100)],
            last_hash: None,
        }];

        for (node, expect_dup) in [
            (Snode::new("node-a:1", "pk"), false),
            (Snode::new("node-b:1", "pk"), true),
        ] {
            let outcome = storage
                .write(|tx| {
                    decoder
                        .decode_batch(&account_target(), &node, &results, tx)
                        .map_err(|e| crate::store::StoreError::Backend(e.to_string()))
                })
                .await
                .unwrap();
            if expect_dup {
                assert_eq!(outcome.errors[0].1, ReceiveError::DuplicateFromDifferentNode);
                assert!(outcome.had_valid_hash_update);
            } else {
                assert_eq!(outcome.decoded.len(), 1);
            }
        }
    }

    #[tokio::test]
    async fn test_self_send_suppressed_but_cursor_advances() {
        let storage = Storage::in_memory();
        let crypto = passthrough_crypto(USER);
        let decoder = EnvelopeDecoder::new(&crypto, USER);
        let node = Snode::new("node-a:1", "pk");
        let results = vec![NamespaceResult {
            namespace: Namespace::Default,
            messages: vec![raw_envelope("h1", 100)],
            last_hash: None,
        }];

        let outcome = storage
            .write(|tx| {
                decoder
                    .decode_batch(&account_target(), &node, &results, tx)
                    .map_err(|e| crate::store::StoreError::Backend(e.to_string()))
            })
            .await
            .unwrap();

        assert!(outcome.decoded.is_empty());
        assert_eq!(outcome.errors[0].1, ReceiveError::SelfSend);
        let cursor = storage
            .read(|tx| tx.last_hash(&account_target().id(), "default"))
            .unwrap();
        assert_eq!(cursor.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn test_blocked_sender() {
        let storage = Storage::in_memory();
        storage
            .write(|tx| {
                tx.put_profile(&ProfileRecord {
                    id: "05alice".into(),
                    is_blocked: true,
                    ..Default::default()
                })
            })
            .await
            .unwrap();

        let crypto = passthrough_crypto("05alice");
        let decoder = EnvelopeDecoder::new(&crypto, USER);
        let node = Snode::new("node-a:1", "pk");

        let err = storage
            .read(|tx| {
                Ok(decoder
                    .decode_one(&account_target(), &node, &raw_envelope("h1", 100), tx)
                    .unwrap_err())
            })
            .unwrap();
        assert_eq!(err, ReceiveError::SenderBlocked);
    }

    #[tokio::test]
    async fn test_outdated_relative_to_config() {
        use crate::store::records::ConfigRecord;

        let storage = Storage::in_memory();
        storage
            .write(|tx| {
                tx.put_config(&ConfigRecord {
                    thread_id: "05alice".into(),
                    seqno: 3,
                    timestamp_ms: 500,
                    deleted_before_ms: Some(150),
                })
            })
            .await
            .unwrap();

        let crypto = passthrough_crypto("05alice");
        let decoder = EnvelopeDecoder::new(&crypto, USER);
        let node = Snode::new("node-a:1", "pk");

        let (old, new) = storage
            .read(|tx| {
                let old = decoder
                    .decode_one(&account_target(), &node, &raw_envelope("h1", 100), tx)
                    .unwrap_err();
                let new = decoder
                    .decode_one(&account_target(), &node, &raw_envelope("h2", 200), tx)
                    .is_ok();
                Ok((old, new))
            })
            .unwrap();
        assert_eq!(old, ReceiveError::OutdatedRelativeToConfig);
        assert!(new);
    }

    #[tokio::test]
    async fn test_decryption_failure_does_not_advance_cursor() {
        let storage = Storage::in_memory();
        let mut crypto = MockCrypto::new();
        crypto
            .expect_decrypt()
            .returning(|_, _| Err(ReceiveError::DecryptionFailed));
        crypto.expect_blinded_equivalent().return_const(false);
        let decoder = EnvelopeDecoder::new(&crypto, USER);
        let node = Snode::new("node-a:1", "pk");
        let results = vec![NamespaceResult {
            namespace: Namespace::Default,
            messages: vec![raw_envelope("h1", 100)],
            last_hash: None,
        }];

        let outcome = storage
            .write(|tx| {
                decoder
                    .decode_batch(&account_target(), &node, &results, tx)
                    .map_err(|e| crate::store::StoreError::Backend(e.to_string()))
            })
            .await
            .unwrap();

        assert_eq!(outcome.errors[0].1, ReceiveError::DecryptionFailed);
        assert!(storage
            .read(|tx| tx.last_hash(&account_target().id(), "default"))
            .unwrap()
            .is_none());
    }
}
