//! The trade aggregate
//!
//! A `Trade` is created when an offer is taken, persisted immediately, and
//! from then on mutated exclusively by protocol tasks. State transitions go
//! through the `advance_*` methods, which enforce forward-only movement;
//! precondition guards (`expect_*`) return errors that tasks escalate as
//! fatal protocol violations instead of silently proceeding.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::Contract;
use crate::tx::{PubKey, SignedTransaction, TxInput, TxOutput};
use crate::types::{DisputeState, MediationResultState, Phase, Role, TradeStep};

pub type TradeId = String;

/// Human-readable fault annotation, appended on recoverable failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub role: Role,
    pub phase: Phase,
    pub step: TradeStep,
    pub dispute_state: DisputeState,
    pub mediation_result_state: MediationResultState,

    pub contract: Contract,
    /// Hash recorded at creation; re-checked before payout signing
    pub contract_hash: String,

    /// Escrow deposit transaction. Never replaced once set.
    pub deposit_tx: Option<SignedTransaction>,
    /// Set only when the broadcast was confirmed accepted
    pub deposit_txid: Option<String>,
    /// Final payout transaction. Never overwritten once set.
    pub payout_tx: Option<SignedTransaction>,
    /// Set only when the payout broadcast was confirmed accepted
    pub payout_txid: Option<String>,

    /// Mediator-determined split, present once mediation concluded
    pub buyer_payout_amount: Option<u64>,
    pub seller_payout_amount: Option<u64>,

    /// Counterparty funding inputs/change, exchanged during the offer handshake
    pub peer_funding_inputs: Vec<TxInput>,
    pub peer_change_output: Option<TxOutput>,

    pub peer_node_address: String,
    /// Key the counterparty signs its messages with
    pub peer_node_key: PubKey,
    /// Trade fee this party owes, and whether it was paid in the escrow currency
    pub trade_fee: u64,
    pub fee_paid_in_escrow_currency: bool,

    pub error_log: Vec<ErrorLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    pub fn new(id: TradeId, role: Role, contract: Contract, peer_node_address: String) -> Self {
        let contract_hash = contract.hash();
        let now = Utc::now();
        Self {
            id,
            role,
            phase: Phase::Init,
            step: TradeStep::Init,
            dispute_state: DisputeState::NoDispute,
            mediation_result_state: MediationResultState::Undefined,
            contract,
            contract_hash,
            deposit_tx: None,
            deposit_txid: None,
            payout_tx: None,
            payout_txid: None,
            buyer_payout_amount: None,
            seller_payout_amount: None,
            peer_funding_inputs: Vec::new(),
            peer_change_output: None,
            peer_node_address,
            peer_node_key: PubKey([0; 32]),
            trade_fee: 0,
            fee_paid_in_escrow_currency: false,
            error_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_buyer(&self) -> bool {
        self.role.is_buyer()
    }

    pub fn is_maker(&self) -> bool {
        self.role.is_maker()
    }

    /// Security deposit this party posts
    pub fn own_security_deposit(&self) -> u64 {
        if self.is_buyer() {
            self.contract.buyer_security_deposit
        } else {
            self.contract.seller_security_deposit
        }
    }

    pub fn own_multisig_key(&self) -> PubKey {
        self.contract.own_multisig_key(self.is_maker())
    }

    pub fn peer_multisig_key(&self) -> PubKey {
        self.contract.peer_multisig_key(self.is_maker())
    }

    pub fn total_escrow(&self) -> u64 {
        self.contract.total_escrow()
    }

    // ------------------------------------------------------------------
    // Monotonic transitions
    // ------------------------------------------------------------------

    /// Move to a later phase. Backward attempts are ignored with a warning —
    /// a trade never moves backward.
    pub fn advance_phase(&mut self, phase: Phase) {
        if phase.rank() <= self.phase.rank() {
            if phase != self.phase {
                warn!(
                    "[{}] Ignoring backward phase transition {} -> {}",
                    self.id, self.phase, phase
                );
            }
            return;
        }
        info!("[{}] Phase {} -> {}", self.id, self.phase, phase);
        self.phase = phase;
        self.touch();
    }

    pub fn advance_step(&mut self, step: TradeStep) {
        if step.rank() <= self.step.rank() {
            if step != self.step {
                warn!(
                    "[{}] Ignoring backward step transition {} -> {}",
                    self.id, self.step, step
                );
            }
            return;
        }
        info!("[{}] Step {} -> {}", self.id, self.step, step);
        self.step = step;
        self.touch();
    }

    pub fn advance_dispute_state(&mut self, state: DisputeState) {
        if state.rank() <= self.dispute_state.rank() {
            if state != self.dispute_state {
                warn!(
                    "[{}] Ignoring backward dispute transition {} -> {}",
                    self.id, self.dispute_state, state
                );
            }
            return;
        }
        info!("[{}] Dispute {} -> {}", self.id, self.dispute_state, state);
        self.dispute_state = state;
        self.touch();
    }

    pub fn advance_mediation_result_state(&mut self, state: MediationResultState) {
        if state.rank() <= self.mediation_result_state.rank() {
            if state != self.mediation_result_state {
                warn!(
                    "[{}] Ignoring backward mediation-result transition {} -> {}",
                    self.id, self.mediation_result_state, state
                );
            }
            return;
        }
        info!(
            "[{}] MediationResult {} -> {}",
            self.id, self.mediation_result_state, state
        );
        self.mediation_result_state = state;
        self.touch();
    }

    // ------------------------------------------------------------------
    // Transaction records
    // ------------------------------------------------------------------

    /// Record the deposit transaction. Once recorded it is never replaced.
    pub fn record_deposit_tx(&mut self, tx: SignedTransaction) {
        if let Some(existing) = &self.deposit_tx {
            if existing.txid() != tx.txid() {
                warn!(
                    "[{}] Refusing to replace recorded deposit tx {} with {}",
                    self.id,
                    existing.txid(),
                    tx.txid()
                );
            }
            return;
        }
        info!("[{}] Recorded deposit tx {}", self.id, tx.txid());
        self.deposit_tx = Some(tx);
        self.touch();
    }

    /// Record the payout transaction. Idempotent — an already-recorded payout
    /// (e.g. learned via chain scan before the peer's message arrived) is
    /// never overwritten.
    pub fn record_payout_tx(&mut self, tx: SignedTransaction) {
        if let Some(existing) = &self.payout_tx {
            if existing.txid() != tx.txid() {
                warn!(
                    "[{}] Refusing to replace recorded payout tx {} with {}",
                    self.id,
                    existing.txid(),
                    tx.txid()
                );
            }
            return;
        }
        info!("[{}] Recorded payout tx {}", self.id, tx.txid());
        self.payout_tx = Some(tx);
        self.touch();
    }

    pub fn set_mediation_split(&mut self, buyer_payout: u64, seller_payout: u64) {
        self.buyer_payout_amount = Some(buyer_payout);
        self.seller_payout_amount = Some(seller_payout);
        self.touch();
    }

    // ------------------------------------------------------------------
    // Precondition guards and invariants
    // ------------------------------------------------------------------

    pub fn expect_phase(&self, phase: Phase) -> Result<()> {
        if self.phase != phase {
            bail!(
                "Protocol violation: expected phase {}, trade is in {}",
                phase,
                self.phase
            );
        }
        Ok(())
    }

    pub fn expect_deposit_tx(&self) -> Result<&SignedTransaction> {
        self.deposit_tx
            .as_ref()
            .ok_or_else(|| anyhow!("Protocol violation: no deposit transaction recorded"))
    }

    pub fn expect_mediation_split(&self) -> Result<(u64, u64)> {
        match (self.buyer_payout_amount, self.seller_payout_amount) {
            (Some(buyer), Some(seller)) => Ok((buyer, seller)),
            _ => Err(anyhow!("Protocol violation: mediation payout split not set")),
        }
    }

    /// The recorded contract hash must still match the held contract.
    pub fn verify_contract_hash(&self) -> Result<()> {
        let current = self.contract.hash();
        if current != self.contract_hash {
            bail!(
                "Contract hash mismatch: recorded {}, current {}",
                self.contract_hash,
                current
            );
        }
        Ok(())
    }

    /// Payout amounts must reconstruct the escrowed total exactly. A mismatch
    /// is a data-integrity violation and is never silently corrected.
    pub fn check_payout_balance(&self, buyer_payout: u64, seller_payout: u64) -> Result<()> {
        let total = self.total_escrow();
        let sum = buyer_payout
            .checked_add(seller_payout)
            .ok_or_else(|| anyhow!("Payout amounts overflow"))?;
        if sum != total {
            bail!(
                "Payout amounts do not balance: buyer {} + seller {} = {} != escrowed {}",
                buyer_payout,
                seller_payout,
                sum,
                total
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure bookkeeping
    // ------------------------------------------------------------------

    pub fn append_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("[{}] {}", self.id, message);
        self.error_log.push(ErrorLogEntry { at: Utc::now(), message });
        self.touch();
    }

    /// Flag the trade failed after a fatal fault. Requires manual intervention.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.append_error(reason);
        self.advance_phase(Phase::Failed);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
