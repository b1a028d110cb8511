//! Wallet and signing capability consumed by the protocol tasks
//!
//! Funding reservations are a shared resource across trades: inputs reserved
//! for one trade must never be spendable by another until the corresponding
//! transaction is durably recorded or the trade is provably abandoned.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tx::{PubKey, RawTransaction, SignatureShare, SignedTransaction, TxInput, TxOutput};

/// Inputs and change locked in the wallet for one trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingReservation {
    pub trade_id: String,
    pub inputs: Vec<TxInput>,
    pub change_output: Option<TxOutput>,
    pub change_address: String,
    /// Multisig key the wallet bound to the reserved funding address
    pub multisig_key: PubKey,
}

impl FundingReservation {
    pub fn total_input_value(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }
}

/// Backend for wallet operations
///
/// Implementations:
/// - `InMemoryWallet` (trade-agent) — reference wallet for tests and local
///   simulation
/// - a production implementation would proxy a real wallet daemon
#[async_trait]
pub trait WalletBackend: Send + Sync {
    /// Reserve funding inputs and a change output covering `amount`.
    ///
    /// Idempotent per trade: a repeated call for the same trade returns the
    /// existing reservation, so a retried task sequence never double-reserves.
    async fn reserve_funding_inputs(&self, trade_id: &str, amount: u64) -> Result<FundingReservation>;

    /// Sign the transaction with the multisig key reserved for this trade
    async fn sign(&self, trade_id: &str, tx: &RawTransaction) -> Result<SignatureShare>;

    /// Broadcast a fully signed transaction, returning the accepted txid
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<String>;

    /// Swap the trade's reserved inputs back to the available pool.
    ///
    /// Called only after the corresponding transaction is durably recorded —
    /// never speculatively, or a second trade could double-spend them.
    async fn release_reservation(&self, trade_id: &str) -> Result<()>;
}
