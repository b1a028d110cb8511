//! Per-run working context
//!
//! The scratchpad of in-flight cryptographic artifacts shared by every task
//! of one trade's current protocol run. Rebuilt from the persisted trade at
//! the start of each run — including after a process restart — and owned
//! exclusively by the running task sequence. Never persisted itself.

use crate::trade::Trade;
use crate::tx::{PubKey, RawTransaction, SignatureShare, TxInput, TxOutput};
use crate::wallet::FundingReservation;

/// Everything this party has learned about the counterparty for this trade.
/// Mutated only by tasks that process an incoming message from that peer.
#[derive(Debug, Clone, Default)]
pub struct CounterpartyView {
    pub multisig_key: Option<PubKey>,
    pub funding_inputs: Vec<TxInput>,
    pub change_output: Option<TxOutput>,
    pub payout_address: Option<String>,
    pub deposit_signature: Option<SignatureShare>,
    pub payout_signature: Option<SignatureShare>,
}

#[derive(Debug, Clone, Default)]
pub struct TradeContext {
    pub trade_id: String,
    pub own_multisig_key: Option<PubKey>,
    pub reservation: Option<FundingReservation>,
    pub prepared_deposit_tx: Option<RawTransaction>,
    pub own_deposit_signature: Option<SignatureShare>,
    pub prepared_payout_tx: Option<RawTransaction>,
    pub own_payout_signature: Option<SignatureShare>,
    pub counterparty: CounterpartyView,
    /// Set by a task to request closing the trade one scheduling tick after
    /// the current message dispatch completes
    pub close_requested: bool,
}

impl TradeContext {
    /// Rebuild the context for a new run from the persisted trade state
    pub fn for_trade(trade: &Trade) -> Self {
        let peer_payout_address = if trade.is_maker() {
            &trade.contract.taker_payout_address
        } else {
            &trade.contract.maker_payout_address
        };

        Self {
            trade_id: trade.id.clone(),
            own_multisig_key: Some(trade.own_multisig_key()),
            counterparty: CounterpartyView {
                multisig_key: Some(trade.peer_multisig_key()),
                funding_inputs: trade.peer_funding_inputs.clone(),
                change_output: trade.peer_change_output.clone(),
                payout_address: Some(peer_payout_address.clone()),
                deposit_signature: None,
                payout_signature: None,
            },
            ..Default::default()
        }
    }
}
