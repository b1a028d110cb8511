//! Local two-party simulation
//!
//! Wires two in-process nodes (maker/buyer and taker/seller) through the
//! reference backends and drives a complete trade: handshake, deposit
//! escrow, and optionally a mediated payout after a scripted dispute.
//! Everything observable in production — message acks, mailbox fallback,
//! checkpoint persistence, deferred closes — is exercised here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use trade_engine::config::EngineConfig;
use trade_engine::context::TradeContext;
use trade_engine::contract::Contract;
use trade_engine::deposit::{self, required_funding_amount};
use trade_engine::dispatch::dispatch_message;
use trade_engine::mediation;
use trade_engine::registry::TradeRegistry;
use trade_engine::runner::{TaskDeps, TaskRunner};
use trade_engine::store::MemoryTradeStore;
use trade_engine::trade::Trade;
use trade_engine::tx::PubKey;
use trade_engine::types::{DisputeState, Phase, Role};
use trade_engine::wallet::WalletBackend;

use crate::backend::{InMemoryWallet, MockChain};
use crate::messenger::{acknowledge, verify_delivery, ChannelMessenger, Delivery, InProcessNetwork};

const TRADE_AMOUNT: u64 = 500_000;
const SECURITY_DEPOSIT: u64 = 1_000_000;

struct Party {
    name: &'static str,
    address: String,
    node_key: PubKey,
    wallet: Arc<InMemoryWallet>,
    deps: TaskDeps,
    registry: Arc<Mutex<TradeRegistry>>,
}

impl Party {
    fn new(
        name: &'static str,
        address: &str,
        key_seed: [u8; 32],
        wallet_seed: [u8; 32],
        network: Arc<InProcessNetwork>,
        chain: Arc<MockChain>,
    ) -> Self {
        let signing_key = SigningKey::from_bytes(&key_seed);
        let node_key = PubKey(signing_key.verifying_key().to_bytes());
        let wallet = InMemoryWallet::new(name, wallet_seed, chain);
        wallet.fund(2_000_000);

        let config = EngineConfig::local(address, key_seed);
        let deps = TaskDeps {
            wallet: wallet.clone(),
            messenger: ChannelMessenger::new(network, key_seed),
            store: Arc::new(MemoryTradeStore::new()),
            config,
        };

        Self {
            name,
            address: address.to_string(),
            node_key,
            wallet,
            deps,
            registry: Arc::new(Mutex::new(TradeRegistry::new(256))),
        }
    }

    /// Consume the party's inbox: verify, ack, dispatch, drain closes
    fn spawn_loop(&self, mut inbox: tokio::sync::mpsc::UnboundedReceiver<Delivery>) {
        let registry = self.registry.clone();
        let deps = self.deps.clone();
        let name = self.name;
        tokio::spawn(async move {
            while let Some(mut delivery) = inbox.recv().await {
                let trade_id = delivery.message.trade_id().to_string();
                let expected_sender = {
                    registry.lock().await.get(&trade_id).map(|t| t.peer_node_key)
                };
                let Some(expected_sender) = expected_sender else {
                    warn!("[{}] {} got message for unknown trade", trade_id, name);
                    continue;
                };
                if !verify_delivery(&delivery, &expected_sender) {
                    continue;
                }
                acknowledge(&mut delivery);

                let mut registry = registry.lock().await;
                if let Err(e) = dispatch_message(&mut registry, &deps, delivery.message).await {
                    warn!("[{}] {} dispatch failed: {:#}", trade_id, name, e);
                }
                for closed in registry.process_deferred_closes() {
                    info!("[{}] {} closed trade via mediation", closed.id, name);
                    if let Err(e) = deps.store.persist(&closed) {
                        warn!("[{}] Failed to persist closed trade: {:#}", closed.id, e);
                    }
                }
            }
        });
    }

    async fn trade_phase(&self, trade_id: &str) -> Option<Phase> {
        self.registry.lock().await.get(trade_id).map(|t| t.phase)
    }

    async fn trade_open(&self, trade_id: &str) -> bool {
        self.registry.lock().await.contains(trade_id)
    }
}

pub async fn run_simulation(with_mediation: bool) -> Result<()> {
    let network = InProcessNetwork::new();
    let chain = MockChain::new();

    let maker = Party::new("maker", "maker.local:7777", [11; 32], [21; 32], network.clone(), chain.clone());
    let taker = Party::new("taker", "taker.local:7777", [12; 32], [22; 32], network.clone(), chain.clone());

    let maker_inbox = network.register(&maker.address);
    let taker_inbox = network.register(&taker.address);

    // ------------------------------------------------------------------
    // Offer handshake: fix the contract, exchange keys and funding inputs
    // ------------------------------------------------------------------
    let trade_id = format!("trade-{}", Uuid::new_v4());
    info!("Simulating trade {} (mediation: {})", trade_id, with_mediation);

    let contract = Contract {
        maker_node_address: maker.address.clone(),
        taker_node_address: taker.address.clone(),
        maker_payout_address: "payout-maker".to_string(),
        taker_payout_address: "payout-taker".to_string(),
        buyer_is_maker: true,
        trade_amount: TRADE_AMOUNT,
        price: Decimal::new(6412550, 2),
        currency_code: "EUR".to_string(),
        buyer_security_deposit: SECURITY_DEPOSIT,
        seller_security_deposit: SECURITY_DEPOSIT,
        maker_multisig_key: maker.wallet.multisig_key(&trade_id),
        taker_multisig_key: taker.wallet.multisig_key(&trade_id),
    };

    let mut maker_trade = Trade::new(
        trade_id.clone(),
        Role::BuyerAsMaker,
        contract.clone(),
        taker.address.clone(),
    );
    maker_trade.peer_node_key = taker.node_key;

    let mut taker_trade = Trade::new(
        trade_id.clone(),
        Role::SellerAsTaker,
        contract,
        maker.address.clone(),
    );
    taker_trade.peer_node_key = maker.node_key;

    // Each side reserves its funding and the handshake carries the inputs
    // and change to the other side.
    let tx_fee = maker.deps.config.tx_fee;
    let maker_reservation = maker
        .wallet
        .reserve_funding_inputs(&trade_id, required_funding_amount(&maker_trade, tx_fee))
        .await
        .context("Maker funding reservation failed")?;
    let taker_reservation = taker
        .wallet
        .reserve_funding_inputs(&trade_id, required_funding_amount(&taker_trade, tx_fee))
        .await
        .context("Taker funding reservation failed")?;

    maker_trade.peer_funding_inputs = taker_reservation.inputs.clone();
    maker_trade.peer_change_output = taker_reservation.change_output.clone();
    taker_trade.peer_funding_inputs = maker_reservation.inputs.clone();
    taker_trade.peer_change_output = maker_reservation.change_output.clone();

    maker.deps.store.persist(&maker_trade)?;
    taker.deps.store.persist(&taker_trade)?;
    maker.registry.lock().await.insert(maker_trade);
    taker.registry.lock().await.insert(taker_trade);

    maker.spawn_loop(maker_inbox);
    taker.spawn_loop(taker_inbox);

    // ------------------------------------------------------------------
    // Deposit: taker funds and sends, maker finalizes and broadcasts
    // ------------------------------------------------------------------
    run_sequence(&taker, &trade_id, deposit::funding_tasks()).await?;

    // The maker publishes, then announces the published tx back to the
    // taker — both sides must hold the deposit record before mediation.
    let mut published = false;
    for _ in 0..200 {
        if maker.trade_phase(&trade_id).await == Some(Phase::DepositPublished)
            && taker.trade_phase(&trade_id).await == Some(Phase::DepositPublished)
        {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    if !published {
        bail!("Timed out waiting for the deposit tx to publish on both sides");
    }
    info!("[{}] Deposit escrowed, chain height {}", trade_id, chain.height());

    if !with_mediation {
        info!("[{}] Simulation complete (deposit only)", trade_id);
        return Ok(());
    }

    // ------------------------------------------------------------------
    // Scripted dispute: the mediator awards the buyer the trade amount
    // back plus both deposits minus the seller's share
    // ------------------------------------------------------------------
    let buyer_payout = SECURITY_DEPOSIT + TRADE_AMOUNT;
    let seller_payout = SECURITY_DEPOSIT;
    for party in [&maker, &taker] {
        let mut registry = party.registry.lock().await;
        if let Some(mut trade) = registry.take(&trade_id) {
            trade.advance_dispute_state(DisputeState::MediationRequested);
            trade.set_mediation_split(buyer_payout, seller_payout);
            party.deps.store.persist(&trade)?;
            registry.insert(trade);
        }
    }
    info!(
        "[{}] Mediator decided split: buyer {}, seller {}",
        trade_id, buyer_payout, seller_payout
    );

    // Taker signs and sends its signature; maker finalizes, broadcasts and
    // notifies; both sides close one tick after processing.
    run_sequence(&taker, &trade_id, mediation::signer_tasks()).await?;

    let mut closed = false;
    for _ in 0..200 {
        if !maker.trade_open(&trade_id).await && !taker.trade_open(&trade_id).await {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    if !closed {
        bail!("Timed out waiting for both sides to close the mediated trade");
    }

    info!(
        "[{}] Mediated payout complete: chain height {}, maker wallet {}, taker wallet {}",
        trade_id,
        chain.height(),
        maker.wallet.available_balance(),
        taker.wallet.available_balance(),
    );
    Ok(())
}

/// Run a task sequence for a registry-held trade and put it back
async fn run_sequence<T: trade_engine::runner::ProtocolTask>(
    party: &Party,
    trade_id: &str,
    tasks: Vec<T>,
) -> Result<()> {
    let mut registry = party.registry.lock().await;
    let Some(mut trade) = registry.take(trade_id) else {
        bail!("Trade {} not found in {} registry", trade_id, party.name);
    };
    let mut ctx = TradeContext::for_trade(&trade);
    let report = TaskRunner::run(&tasks, &mut trade, &mut ctx, &party.deps).await;
    registry.insert(trade);
    drop(registry);

    if let Some(failure) = report.failure {
        bail!(
            "{} sequence failed at {}: {}",
            party.name,
            failure.task,
            failure.reason
        );
    }
    Ok(())
}
