//! In-memory reference wallet
//!
//! Implements the `WalletBackend` capability against a local UTXO pool and a
//! shared mock chain that verifies multisig signatures on broadcast. Trade
//! multisig keys are derived deterministically from the wallet seed and the
//! trade id, so a restarted wallet re-derives the same keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use trade_engine::tx::{PubKey, RawTransaction, SignatureShare, SignedTransaction, TxInput, TxOutput};
use trade_engine::wallet::{FundingReservation, WalletBackend};

/// Shared mock chain accepting fully signed transactions
#[derive(Default)]
pub struct MockChain {
    txs: Mutex<Vec<SignedTransaction>>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Validate every signature share against the tx digest and accept.
    /// Re-broadcasting an already accepted tx is a no-op returning its id.
    pub fn accept(&self, tx: &SignedTransaction) -> Result<String> {
        let txid = tx.txid();
        let mut txs = self.txs.lock().expect("chain lock poisoned");
        if txs.iter().any(|t| t.txid() == txid) {
            return Ok(txid);
        }

        if tx.signatures.is_empty() {
            bail!("Transaction {} has no signatures", txid);
        }
        let digest = Sha256::digest(tx.tx.canonical_bytes());
        for share in &tx.signatures {
            let key = VerifyingKey::from_bytes(&share.signer.0)
                .map_err(|e| anyhow!("Invalid signer key {}: {}", share.signer, e))?;
            let sig_bytes = BASE64
                .decode(&share.signature_b64)
                .map_err(|e| anyhow!("Invalid signature base64: {}", e))?;
            let sig_array: [u8; 64] = sig_bytes
                .try_into()
                .map_err(|_| anyhow!("Invalid signature length"))?;
            key.verify(&digest, &ed25519_dalek::Signature::from_bytes(&sig_array))
                .map_err(|_| anyhow!("Signature by {} does not verify", share.signer))?;
        }

        txs.push(tx.clone());
        Ok(txid)
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.txs
            .lock()
            .expect("chain lock poisoned")
            .iter()
            .any(|t| t.txid() == txid)
    }

    pub fn height(&self) -> usize {
        self.txs.lock().expect("chain lock poisoned").len()
    }
}

pub struct InMemoryWallet {
    name: String,
    seed: [u8; 32],
    chain: Arc<MockChain>,
    available: Mutex<Vec<TxInput>>,
    reservations: Mutex<HashMap<String, FundingReservation>>,
}

impl InMemoryWallet {
    pub fn new(name: &str, seed: [u8; 32], chain: Arc<MockChain>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            seed,
            chain,
            available: Mutex::new(Vec::new()),
            reservations: Mutex::new(HashMap::new()),
        })
    }

    /// Credit the wallet with a spendable output
    pub fn fund(&self, value: u64) {
        let mut available = self.available.lock().expect("wallet lock poisoned");
        let n = available.len();
        available.push(TxInput {
            prev_txid: hex::encode(Sha256::digest(format!("fund:{}:{}", self.name, n))),
            prev_vout: 0,
            value,
        });
    }

    pub fn available_balance(&self) -> u64 {
        self.available
            .lock()
            .expect("wallet lock poisoned")
            .iter()
            .map(|i| i.value)
            .sum()
    }

    fn trade_signing_key(&self, trade_id: &str) -> SigningKey {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(b":");
        hasher.update(trade_id.as_bytes());
        SigningKey::from_bytes(&hasher.finalize().into())
    }

    /// The multisig key this wallet binds to the trade's funding address
    pub fn multisig_key(&self, trade_id: &str) -> PubKey {
        PubKey(self.trade_signing_key(trade_id).verifying_key().to_bytes())
    }
}

#[async_trait]
impl WalletBackend for InMemoryWallet {
    async fn reserve_funding_inputs(&self, trade_id: &str, amount: u64) -> Result<FundingReservation> {
        // Idempotent: a retried sequence gets the reservation made earlier
        if let Some(existing) = self
            .reservations
            .lock()
            .expect("wallet lock poisoned")
            .get(trade_id)
        {
            debug!("[{}] Returning existing reservation", trade_id);
            return Ok(existing.clone());
        }

        let mut available = self.available.lock().expect("wallet lock poisoned");
        let mut selected = Vec::new();
        let mut total = 0u64;
        while total < amount {
            let Some(input) = available.pop() else {
                // Nothing consumed on failure — put the picks back
                available.extend(selected);
                bail!(
                    "Insufficient funds in wallet {}: need {}, short {}",
                    self.name,
                    amount,
                    amount - total
                );
            };
            total += input.value;
            selected.push(input);
        }
        drop(available);

        let change_address = format!("{}-change-{}", self.name, trade_id);
        let change_output = if total > amount {
            Some(TxOutput {
                address: change_address.clone(),
                value: total - amount,
            })
        } else {
            None
        };

        let reservation = FundingReservation {
            trade_id: trade_id.to_string(),
            inputs: selected,
            change_output,
            change_address,
            multisig_key: self.multisig_key(trade_id),
        };
        info!(
            "[{}] Reserved {} ({} input(s)) in wallet {}",
            trade_id,
            amount,
            reservation.inputs.len(),
            self.name
        );
        self.reservations
            .lock()
            .expect("wallet lock poisoned")
            .insert(trade_id.to_string(), reservation.clone());
        Ok(reservation)
    }

    async fn sign(&self, trade_id: &str, tx: &RawTransaction) -> Result<SignatureShare> {
        let key = self.trade_signing_key(trade_id);
        let digest = Sha256::digest(tx.canonical_bytes());
        let signature = key.sign(&digest);
        Ok(SignatureShare {
            signer: PubKey(key.verifying_key().to_bytes()),
            signature_b64: BASE64.encode(signature.to_bytes()),
        })
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<String> {
        self.chain.accept(tx)
    }

    async fn release_reservation(&self, trade_id: &str) -> Result<()> {
        if self
            .reservations
            .lock()
            .expect("wallet lock poisoned")
            .remove(trade_id)
            .is_some()
        {
            debug!("[{}] Reservation released in wallet {}", trade_id, self.name);
        }
        Ok(())
    }
}
