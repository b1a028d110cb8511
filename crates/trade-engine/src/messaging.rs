//! Peer messaging contract
//!
//! The transport itself (framing, onion routing, store-and-forward) lives
//! outside this crate; tasks only depend on the `PeerMessenger` trait and the
//! message types below. Every message carries a globally unique id the
//! receiver uses to suppress duplicate processing — a message already seen is
//! a no-op, not an error.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tx::PubKey;

/// Application-level acknowledgement timeout. After this the sender treats
/// the delivery as uncertain, not failed.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a send, after acknowledgement or mailbox confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Peer acknowledged the message
    Arrived,
    /// Peer offline; transport buffered the message in its mailbox
    StoredInMailbox,
    /// No acknowledgement within the timeout — delivery uncertain
    AckTimeout,
    /// Transport reported the send failed
    Failed(String),
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Arrived => write!(f, "arrived"),
            DeliveryOutcome::StoredInMailbox => write!(f, "stored in mailbox"),
            DeliveryOutcome::AckTimeout => write!(f, "ack timeout"),
            DeliveryOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositTxMessage {
    pub message_id: Uuid,
    pub trade_id: String,
    pub sender: String,
    /// Serialized `PartialDeposit` bytes
    pub tx_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatedPayoutSignatureMessage {
    pub message_id: Uuid,
    pub trade_id: String,
    pub sender: String,
    pub signer: PubKey,
    /// Base64-encoded signature over the payout tx digest
    pub signature_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatedPayoutPublishedMessage {
    pub message_id: Uuid,
    pub trade_id: String,
    pub sender: String,
    /// Serialized `SignedTransaction` bytes of the payout
    pub tx_bytes: Vec<u8>,
}

/// Protocol messages exchanged between trade counterparties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TradeMessage {
    DepositTx(DepositTxMessage),
    MediatedPayoutSignature(MediatedPayoutSignatureMessage),
    MediatedPayoutPublished(MediatedPayoutPublishedMessage),
}

impl TradeMessage {
    pub fn message_id(&self) -> Uuid {
        match self {
            TradeMessage::DepositTx(m) => m.message_id,
            TradeMessage::MediatedPayoutSignature(m) => m.message_id,
            TradeMessage::MediatedPayoutPublished(m) => m.message_id,
        }
    }

    pub fn trade_id(&self) -> &str {
        match self {
            TradeMessage::DepositTx(m) => &m.trade_id,
            TradeMessage::MediatedPayoutSignature(m) => &m.trade_id,
            TradeMessage::MediatedPayoutPublished(m) => &m.trade_id,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            TradeMessage::DepositTx(m) => &m.sender,
            TradeMessage::MediatedPayoutSignature(m) => &m.sender,
            TradeMessage::MediatedPayoutPublished(m) => &m.sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TradeMessage::DepositTx(_) => "DepositTx",
            TradeMessage::MediatedPayoutSignature(_) => "MediatedPayoutSignature",
            TradeMessage::MediatedPayoutPublished(_) => "MediatedPayoutPublished",
        }
    }

    /// Canonical payload for envelope signing (trade-wire scheme)
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            TradeMessage::DepositTx(m) => trade_wire::canonical_deposit_tx(
                &m.message_id.to_string(),
                &m.trade_id,
                &m.sender,
                &m.tx_bytes,
            ),
            TradeMessage::MediatedPayoutSignature(m) => trade_wire::canonical_payout_signature(
                &m.message_id.to_string(),
                &m.trade_id,
                &m.sender,
                &m.signer.to_hex(),
                m.signature_b64.as_bytes(),
            ),
            TradeMessage::MediatedPayoutPublished(m) => trade_wire::canonical_payout_published(
                &m.message_id.to_string(),
                &m.trade_id,
                &m.sender,
                &m.tx_bytes,
            ),
        }
    }
}

/// Messenger capability: at-least-once delivery with acknowledgement and a
/// mailbox fallback for offline peers.
///
/// Implementations report the outcome rather than erroring — transport faults
/// map to `DeliveryOutcome::Failed` so tasks can decide what is recoverable.
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    async fn send(&self, peer: &str, peer_key: &PubKey, message: TradeMessage) -> DeliveryOutcome;
}

/// Race a send against the acknowledgement timeout.
///
/// A late acknowledgement after the timeout already fired is discarded by the
/// messenger implementation — the oneshot receiver is gone by then.
pub async fn send_with_ack_timeout(
    messenger: &dyn PeerMessenger,
    peer: &str,
    peer_key: &PubKey,
    message: TradeMessage,
    ack_timeout: Duration,
) -> DeliveryOutcome {
    match tokio::time::timeout(ack_timeout, messenger.send(peer, peer_key, message)).await {
        Ok(outcome) => outcome,
        Err(_) => DeliveryOutcome::AckTimeout,
    }
}

/// Bounded first-seen set for message de-duplication.
///
/// Insertion order is kept so the oldest entry can be evicted when the
/// capacity is reached.
#[derive(Debug)]
pub struct SeenMessages {
    capacity: usize,
    ids: IndexSet<Uuid>,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: IndexSet::new(),
        }
    }

    /// Record a message id. Returns true the first time an id is seen.
    pub fn observe(&mut self, id: Uuid) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.ids.len() >= self.capacity {
            self.ids.shift_remove_index(0);
        }
        self.ids.insert(id);
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
