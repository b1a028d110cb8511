//! Shared fixtures and scripted backends for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::contract::Contract;
use crate::messaging::{DeliveryOutcome, PeerMessenger, TradeMessage};
use crate::runner::TaskDeps;
use crate::store::MemoryTradeStore;
use crate::trade::Trade;
use crate::tx::{PubKey, RawTransaction, SignatureShare, SignedTransaction, TxInput};
use crate::types::Role;
use crate::wallet::{FundingReservation, WalletBackend};

pub const MAKER_KEY: PubKey = PubKey([1; 32]);
pub const TAKER_KEY: PubKey = PubKey([2; 32]);

/// Contract fixture: maker is the buyer, 500k trade amount, 1M deposits each
pub fn test_contract() -> Contract {
    Contract {
        maker_node_address: "maker:1".to_string(),
        taker_node_address: "taker:1".to_string(),
        maker_payout_address: "addr-maker".to_string(),
        taker_payout_address: "addr-taker".to_string(),
        buyer_is_maker: true,
        trade_amount: 500_000,
        price: rust_decimal::Decimal::new(100, 0),
        currency_code: "USD".to_string(),
        buyer_security_deposit: 1_000_000,
        seller_security_deposit: 1_000_000,
        maker_multisig_key: MAKER_KEY,
        taker_multisig_key: TAKER_KEY,
    }
}

pub fn mock_input(tag: &str, trade_id: &str, value: u64) -> TxInput {
    TxInput {
        prev_txid: hex::encode(Sha256::digest(format!("utxo:{}:{}", tag, trade_id))),
        prev_vout: 0,
        value,
    }
}

/// Both sides of one trade, with the handshake-exchanged peer inputs seeded.
///
/// With tx_fee = 1_000: buyer/maker funds 1_002_000, seller/taker funds
/// 1_502_000 (deposit + trade amount + 2×fee).
pub fn test_trade_pair() -> (Trade, Trade) {
    let contract = test_contract();
    let mut maker = Trade::new(
        "trade-1".to_string(),
        Role::BuyerAsMaker,
        contract.clone(),
        "taker:1".to_string(),
    );
    let mut taker = Trade::new(
        "trade-1".to_string(),
        Role::SellerAsTaker,
        contract,
        "maker:1".to_string(),
    );

    maker.peer_funding_inputs = vec![mock_input("taker", "trade-1", 1_502_000)];
    taker.peer_funding_inputs = vec![mock_input("maker", "trade-1", 1_002_000)];
    (maker, taker)
}

/// Scripted wallet: deterministic reservations, optional broadcast failure
pub struct MockWallet {
    pub node_tag: String,
    pub multisig_key: PubKey,
    pub fail_broadcast: AtomicBool,
    pub broadcasts: Mutex<Vec<SignedTransaction>>,
    pub released: Mutex<Vec<String>>,
    pub reserved: Mutex<Vec<(String, u64)>>,
}

impl MockWallet {
    pub fn new(node_tag: &str, multisig_key: PubKey) -> Arc<Self> {
        Arc::new(Self {
            node_tag: node_tag.to_string(),
            multisig_key,
            fail_broadcast: AtomicBool::new(false),
            broadcasts: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            reserved: Mutex::new(Vec::new()),
        })
    }
}

pub fn maker_wallet() -> Arc<MockWallet> {
    MockWallet::new("maker", MAKER_KEY)
}

pub fn taker_wallet() -> Arc<MockWallet> {
    MockWallet::new("taker", TAKER_KEY)
}

#[async_trait]
impl WalletBackend for MockWallet {
    async fn reserve_funding_inputs(&self, trade_id: &str, amount: u64) -> Result<FundingReservation> {
        self.reserved
            .lock()
            .unwrap()
            .push((trade_id.to_string(), amount));
        Ok(FundingReservation {
            trade_id: trade_id.to_string(),
            inputs: vec![mock_input(&self.node_tag, trade_id, amount)],
            change_output: None,
            change_address: format!("change-{}", self.node_tag),
            multisig_key: self.multisig_key,
        })
    }

    async fn sign(&self, _trade_id: &str, tx: &RawTransaction) -> Result<SignatureShare> {
        Ok(SignatureShare {
            signer: self.multisig_key,
            signature_b64: format!("sig:{}:{}", self.multisig_key.to_hex(), tx.txid()),
        })
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<String> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(anyhow!("tx rejected by network"));
        }
        self.broadcasts.lock().unwrap().push(tx.clone());
        Ok(tx.txid())
    }

    async fn release_reservation(&self, trade_id: &str) -> Result<()> {
        self.released.lock().unwrap().push(trade_id.to_string());
        Ok(())
    }
}

/// Scripted messenger: pops queued outcomes (default Arrived), records sends
#[derive(Default)]
pub struct StubMessenger {
    pub outcomes: Mutex<VecDeque<DeliveryOutcome>>,
    pub sent: Mutex<Vec<TradeMessage>>,
}

impl StubMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_outcome(&self, outcome: DeliveryOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerMessenger for StubMessenger {
    async fn send(&self, _peer: &str, _peer_key: &PubKey, message: TradeMessage) -> DeliveryOutcome {
        self.sent.lock().unwrap().push(message);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DeliveryOutcome::Arrived)
    }
}

pub fn deps_with(wallet: Arc<MockWallet>, messenger: Arc<StubMessenger>) -> TaskDeps {
    TaskDeps {
        wallet,
        messenger,
        store: Arc::new(MemoryTradeStore::new()),
        config: EngineConfig::local("maker:1", [9; 32]),
    }
}

pub fn deps() -> TaskDeps {
    deps_with(maker_wallet(), StubMessenger::new())
}
