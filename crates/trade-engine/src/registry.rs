//! Pending-trade registry
//!
//! Explicitly owned and passed by reference into whatever drives the
//! protocol — there is no global trade list. Holds the insertion-ordered set
//! of open trades, the message de-duplication window, and the deferred-close
//! queue.
//!
//! Closing a disputed trade removes it from this collection. Tasks therefore
//! never close synchronously from inside message processing: they enqueue the
//! close here, and the caller drains the queue after its iteration over the
//! pending trades has finished.

use indexmap::IndexMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messaging::SeenMessages;
use crate::trade::Trade;
use crate::types::{DisputeState, Phase};

pub struct TradeRegistry {
    trades: IndexMap<String, Trade>,
    seen: SeenMessages,
    deferred_closes: Vec<String>,
}

impl TradeRegistry {
    pub fn new(seen_capacity: usize) -> Self {
        Self {
            trades: IndexMap::new(),
            seen: SeenMessages::new(seen_capacity),
            deferred_closes: Vec::new(),
        }
    }

    pub fn insert(&mut self, trade: Trade) {
        self.trades.insert(trade.id.clone(), trade);
    }

    pub fn get(&self, trade_id: &str) -> Option<&Trade> {
        self.trades.get(trade_id)
    }

    pub fn take(&mut self, trade_id: &str) -> Option<Trade> {
        self.trades.shift_remove(trade_id)
    }

    pub fn contains(&self, trade_id: &str) -> bool {
        self.trades.contains_key(trade_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.trades.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.trades.values()
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// First-seen check for an incoming message id. Duplicates are a no-op
    /// for the caller.
    pub fn observe_message(&mut self, message_id: Uuid) -> bool {
        self.seen.observe(message_id)
    }

    /// Queue a trade for closing after the current dispatch completes
    pub fn defer_close(&mut self, trade_id: &str) {
        debug!("[{}] Close deferred to next tick", trade_id);
        self.deferred_closes.push(trade_id.to_string());
    }

    pub fn has_deferred_closes(&self) -> bool {
        !self.deferred_closes.is_empty()
    }

    /// Close queued trades: mark the dispute closed, remove them from the
    /// pending collection and hand them back for final persistence.
    pub fn process_deferred_closes(&mut self) -> Vec<Trade> {
        let mut closed = Vec::new();
        for trade_id in std::mem::take(&mut self.deferred_closes) {
            let Some(mut trade) = self.trades.shift_remove(&trade_id) else {
                warn!("[{}] Deferred close for unknown trade", trade_id);
                continue;
            };
            trade.advance_dispute_state(DisputeState::MediationClosed);
            trade.advance_phase(Phase::MediationClosed);
            closed.push(trade);
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_trade_pair;

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = TradeRegistry::new(16);
        let (maker, _) = test_trade_pair();
        registry.insert(maker);

        assert!(registry.contains("trade-1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec!["trade-1".to_string()]);
    }

    #[test]
    fn test_message_dedup() {
        let mut registry = TradeRegistry::new(16);
        let id = Uuid::new_v4();
        assert!(registry.observe_message(id));
        assert!(!registry.observe_message(id));
    }

    #[test]
    fn test_deferred_close_leaves_iteration_intact() {
        let mut registry = TradeRegistry::new(16);
        let (maker, mut other) = test_trade_pair();
        other.id = "trade-2".to_string();
        registry.insert(maker);
        registry.insert(other);

        // A close requested mid-iteration must not disturb the collection
        let mut visited = 0;
        let ids = registry.ids();
        for id in &ids {
            if id == "trade-1" {
                registry.defer_close(id);
            }
            assert!(registry.get(id).is_some());
            visited += 1;
        }
        assert_eq!(visited, 2);
        assert_eq!(registry.len(), 2);

        // The close lands one tick later
        let closed = registry.process_deferred_closes();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, "trade-1");
        assert_eq!(closed[0].dispute_state, DisputeState::MediationClosed);
        assert_eq!(closed[0].phase, Phase::MediationClosed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deferred_close_unknown_trade_is_harmless() {
        let mut registry = TradeRegistry::new(16);
        registry.defer_close("missing");
        assert!(registry.process_deferred_closes().is_empty());
    }
}
