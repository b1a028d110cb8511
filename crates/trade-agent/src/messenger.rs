//! In-process reference messenger
//!
//! Point-to-point delivery over tokio channels with application-level
//! acknowledgement and a mailbox fallback for offline peers. Messages are
//! sealed with the sender's node key (trade-wire envelope) and verified by
//! the receiver before dispatch.
//!
//! Acknowledgements ride a oneshot per delivery: the sender races the ack
//! against its timeout, and an ack that arrives after the sender gave up
//! finds the receiver end dropped — it is logged and discarded, never
//! re-entering a finished sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use trade_engine::messaging::{DeliveryOutcome, PeerMessenger, TradeMessage};
use trade_engine::tx::PubKey;
use trade_wire::Envelope;

/// A sealed message in flight. `ack` is None for mailbox redeliveries.
pub struct Delivery {
    pub message: TradeMessage,
    pub envelope: Envelope,
    pub ack: Option<oneshot::Sender<()>>,
}

struct Peer {
    online: bool,
    inbox: mpsc::UnboundedSender<Delivery>,
    mailbox: Vec<(TradeMessage, Envelope)>,
}

/// Routing table shared by every in-process node
#[derive(Default)]
pub struct InProcessNetwork {
    peers: Mutex<HashMap<String, Peer>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a peer and hand back its inbox receiver
    pub fn register(&self, address: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().expect("network lock poisoned").insert(
            address.to_string(),
            Peer {
                online: true,
                inbox: tx,
                mailbox: Vec::new(),
            },
        );
        rx
    }

    pub fn set_online(&self, address: &str, online: bool) {
        if let Some(peer) = self
            .peers
            .lock()
            .expect("network lock poisoned")
            .get_mut(address)
        {
            peer.online = online;
        }
    }

    /// Redeliver mailbox contents to a peer that came back online.
    /// Mailbox deliveries carry no ack — the sender already moved on.
    pub fn flush_mailbox(&self, address: &str) {
        let mut peers = self.peers.lock().expect("network lock poisoned");
        let Some(peer) = peers.get_mut(address) else {
            return;
        };
        let buffered = std::mem::take(&mut peer.mailbox);
        if buffered.is_empty() {
            return;
        }
        info!("Flushing {} mailbox message(s) to {}", buffered.len(), address);
        for (message, envelope) in buffered {
            let _ = peer.inbox.send(Delivery { message, envelope, ack: None });
        }
    }

    pub fn mailbox_len(&self, address: &str) -> usize {
        self.peers
            .lock()
            .expect("network lock poisoned")
            .get(address)
            .map(|p| p.mailbox.len())
            .unwrap_or(0)
    }
}

/// Sender handle bound to one node's signing identity
pub struct ChannelMessenger {
    network: Arc<InProcessNetwork>,
    private_key: [u8; 32],
}

impl ChannelMessenger {
    pub fn new(network: Arc<InProcessNetwork>, private_key: [u8; 32]) -> Arc<Self> {
        Arc::new(Self { network, private_key })
    }
}

#[async_trait]
impl PeerMessenger for ChannelMessenger {
    async fn send(&self, peer: &str, _peer_key: &PubKey, message: TradeMessage) -> DeliveryOutcome {
        let envelope = trade_wire::seal(&self.private_key, &message.canonical_bytes());

        let ack_rx = {
            let mut peers = self.network.peers.lock().expect("network lock poisoned");
            let Some(entry) = peers.get_mut(peer) else {
                return DeliveryOutcome::Failed(format!("unknown peer address {}", peer));
            };

            if !entry.online {
                debug!("Peer {} offline, storing {} in mailbox", peer, message.kind());
                entry.mailbox.push((message, envelope));
                return DeliveryOutcome::StoredInMailbox;
            }

            let (ack_tx, ack_rx) = oneshot::channel();
            let delivery = Delivery { message, envelope, ack: Some(ack_tx) };
            if entry.inbox.send(delivery).is_err() {
                return DeliveryOutcome::Failed(format!("peer {} inbox closed", peer));
            }
            ack_rx
        };

        match ack_rx.await {
            Ok(()) => DeliveryOutcome::Arrived,
            Err(_) => DeliveryOutcome::Failed("peer dropped message before acknowledging".to_string()),
        }
    }
}

/// Acknowledge a delivery. A late ack (sender timed out and dropped its
/// receiver) is discarded with a debug log and has no further effect.
pub fn acknowledge(delivery: &mut Delivery) {
    if let Some(ack) = delivery.ack.take() {
        if ack.send(()).is_err() {
            debug!(
                "[{}] Late acknowledgement for {} discarded (sender timed out)",
                delivery.message.trade_id(),
                delivery.message.kind()
            );
        }
    }
}

/// Verify the envelope against the expected sender key; drops forgeries.
pub fn verify_delivery(delivery: &Delivery, expected_sender: &PubKey) -> bool {
    match trade_wire::open(
        &expected_sender.0,
        &delivery.message.canonical_bytes(),
        &delivery.envelope,
    ) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "[{}] Dropping {} message with bad envelope: {:#}",
                delivery.message.trade_id(),
                delivery.message.kind(),
                e
            );
            false
        }
    }
}
