//! Incoming message dispatch and startup resume
//!
//! External triggers enter the engine here: a received protocol message
//! starts the matching task sequence for its trade, and process start replays
//! the persisted pending trades so interrupted sequences continue from their
//! last checkpoint.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::context::TradeContext;
use crate::deposit::{self, DepositTask};
use crate::mediation;
use crate::messaging::TradeMessage;
use crate::registry::TradeRegistry;
use crate::runner::{RunReport, TaskDeps, TaskRunner};
use crate::trade::Trade;
use crate::types::{Phase, TradeStep};

/// Route an incoming peer message to its trade's task sequence.
///
/// A message id already seen is suppressed as a no-op. The working context is
/// rebuilt from the persisted trade for every dispatch. Close requests raised
/// by the sequence are queued on the registry and take effect only when the
/// caller drains them — one scheduling tick after this dispatch.
pub async fn dispatch_message(
    registry: &mut TradeRegistry,
    deps: &TaskDeps,
    message: TradeMessage,
) -> Result<Option<RunReport>> {
    if !registry.observe_message(message.message_id()) {
        debug!(
            "[{}] Duplicate {} message {}, ignoring",
            message.trade_id(),
            message.kind(),
            message.message_id()
        );
        return Ok(None);
    }

    let trade_id = message.trade_id().to_string();
    let Some(mut trade) = registry.take(&trade_id) else {
        warn!(
            "[{}] {} message for unknown trade, ignoring",
            trade_id,
            message.kind()
        );
        return Ok(None);
    };

    if trade.phase == Phase::Failed {
        warn!(
            "[{}] {} message for failed trade, ignoring",
            trade_id,
            message.kind()
        );
        registry.insert(trade);
        return Ok(None);
    }

    info!("[{}] Processing {} message", trade_id, message.kind());
    let mut ctx = TradeContext::for_trade(&trade);

    let report = match message {
        TradeMessage::DepositTx(msg) => {
            // The payload variant decides which side of the protocol this is:
            // a partial starts the finalize sequence, a published tx is the
            // finalizer's announcement back to the funding side.
            match crate::tx::DepositPayload::from_bytes(&msg.tx_bytes) {
                Ok(crate::tx::DepositPayload::Partial(_)) => {
                    TaskRunner::run(&deposit::finalize_tasks(msg), &mut trade, &mut ctx, deps).await
                }
                Ok(crate::tx::DepositPayload::Published(_)) => {
                    TaskRunner::run(
                        &deposit::published_deposit_tasks(msg),
                        &mut trade,
                        &mut ctx,
                        deps,
                    )
                    .await
                }
                Err(e) => {
                    warn!("[{}] Dropping undecodable deposit message: {:#}", trade_id, e);
                    registry.insert(trade);
                    return Ok(None);
                }
            }
        }
        TradeMessage::MediatedPayoutSignature(msg) => {
            TaskRunner::run(&mediation::finalizer_tasks(msg), &mut trade, &mut ctx, deps).await
        }
        TradeMessage::MediatedPayoutPublished(msg) => {
            TaskRunner::run(&mediation::published_tasks(msg), &mut trade, &mut ctx, deps).await
        }
    };

    let close_requested = ctx.close_requested;
    registry.insert(trade);
    if close_requested {
        registry.defer_close(&trade_id);
    }

    Ok(Some(report))
}

/// Decide what a freshly restored trade still has to do.
///
/// Only the funding side re-runs its sequence. A deposit message already
/// dispatched (step at or past `DepositTxSent`) is never re-sent — the
/// original may still arrive or surface from the peer's mailbox, and a
/// duplicate would be suppressed there anyway.
pub fn resume_tasks(trade: &Trade) -> Option<Vec<DepositTask>> {
    if trade.phase != Phase::Init {
        return None;
    }
    // The finalizing side acts on the peer's message, not on a timer
    if trade.is_maker() {
        return None;
    }
    if trade.step.rank() >= TradeStep::DepositTxSent.rank() {
        info!(
            "[{}] Resumed at step {}, waiting for delivery confirmation instead of re-sending",
            trade.id, trade.step
        );
        return None;
    }
    Some(deposit::funding_tasks())
}

/// Reload pending trades at process start and continue their sequences.
pub async fn resume_pending(registry: &mut TradeRegistry, deps: &TaskDeps) -> Result<Vec<RunReport>> {
    let pending = deps.store.load_pending()?;
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    info!("Resuming {} pending trade(s)", pending.len());
    for trade in pending {
        registry.insert(trade);
    }

    let mut reports = Vec::new();
    for trade_id in registry.ids() {
        let Some(mut trade) = registry.take(&trade_id) else {
            continue;
        };
        if let Some(tasks) = resume_tasks(&trade) {
            let mut ctx = TradeContext::for_trade(&trade);
            let report = TaskRunner::run(&tasks, &mut trade, &mut ctx, deps).await;
            reports.push(report);
        }
        registry.insert(trade);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TaskRunner;
    use crate::testutil::*;
    use crate::types::{DisputeState, MediationResultState};

    async fn taker_deposit_message() -> crate::messaging::DepositTxMessage {
        let (_, mut taker) = test_trade_pair();
        let messenger = StubMessenger::new();
        let mut deps = deps_with(taker_wallet(), messenger.clone());
        deps.config.node_address = "taker:1".to_string();
        let mut ctx = TradeContext::for_trade(&taker);
        let report =
            TaskRunner::run(&deposit::funding_tasks(), &mut taker, &mut ctx, &deps).await;
        assert!(report.succeeded());

        let sent = messenger.sent.lock().unwrap().clone();
        match sent.into_iter().next().unwrap() {
            TradeMessage::DepositTx(msg) => msg,
            other => panic!("unexpected message {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_dispatch_deposit_message_publishes() {
        let msg = taker_deposit_message().await;

        let (maker, _) = test_trade_pair();
        let mut registry = TradeRegistry::new(16);
        registry.insert(maker);

        let wallet = maker_wallet();
        let deps = deps_with(wallet.clone(), StubMessenger::new());
        let report = dispatch_message(&mut registry, &deps, TradeMessage::DepositTx(msg))
            .await
            .unwrap()
            .expect("message should be processed");

        assert!(report.succeeded(), "failure: {:?}", report.failure);
        let trade = registry.get("trade-1").unwrap();
        assert_eq!(trade.phase, Phase::DepositPublished);
        assert_eq!(wallet.broadcasts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_is_noop() {
        let msg = taker_deposit_message().await;

        let (maker, _) = test_trade_pair();
        let mut registry = TradeRegistry::new(16);
        registry.insert(maker);
        let wallet = maker_wallet();
        let deps = deps_with(wallet.clone(), StubMessenger::new());

        let first = dispatch_message(&mut registry, &deps, TradeMessage::DepositTx(msg.clone()))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = dispatch_message(&mut registry, &deps, TradeMessage::DepositTx(msg))
            .await
            .unwrap();
        assert!(second.is_none(), "duplicate must be suppressed");
        assert_eq!(wallet.broadcasts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_message_for_unknown_trade_ignored() {
        let msg = taker_deposit_message().await;
        let mut registry = TradeRegistry::new(16);
        let deps = deps_with(maker_wallet(), StubMessenger::new());

        let report = dispatch_message(&mut registry, &deps, TradeMessage::DepositTx(msg))
            .await
            .unwrap();
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn test_resume_does_not_resend_sent_deposit() {
        // Scenario: process restarted after sending the deposit tx message
        // but before receiving acknowledgement
        let (_, mut taker) = test_trade_pair();
        taker.advance_step(TradeStep::DepositTxSigned);
        taker.advance_step(TradeStep::DepositTxSent);

        let messenger = StubMessenger::new();
        let deps = deps_with(taker_wallet(), messenger.clone());
        deps.store.persist(&taker).unwrap();

        let mut registry = TradeRegistry::new(16);
        let reports = resume_pending(&mut registry, &deps).await.unwrap();

        assert!(reports.is_empty());
        assert_eq!(messenger.sent_count(), 0, "must not re-send a duplicate deposit tx");
        assert!(registry.contains("trade-1"));
        // Context is reconstructable from the persisted trade
        let ctx = TradeContext::for_trade(registry.get("trade-1").unwrap());
        assert_eq!(ctx.trade_id, "trade-1");
        assert!(!ctx.counterparty.funding_inputs.is_empty());
    }

    #[tokio::test]
    async fn test_resume_restarts_interrupted_funding() {
        // Restarted before the message went out: the sequence re-runs
        let (_, mut taker) = test_trade_pair();
        taker.advance_step(TradeStep::FundingReserved);

        let messenger = StubMessenger::new();
        let mut deps = deps_with(taker_wallet(), messenger.clone());
        deps.config.node_address = "taker:1".to_string();
        deps.store.persist(&taker).unwrap();

        let mut registry = TradeRegistry::new(16);
        let reports = resume_pending(&mut registry, &deps).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert!(reports[0].succeeded());
        assert_eq!(messenger.sent_count(), 1);
        assert_eq!(
            registry.get("trade-1").unwrap().step,
            TradeStep::DepositTxArrived
        );
    }

    #[tokio::test]
    async fn test_published_message_defers_close() {
        // Prepare a taker with mediation concluded and payout known to maker
        let (mut maker, mut taker) = test_trade_pair();
        for trade in [&mut maker, &mut taker] {
            trade.advance_dispute_state(DisputeState::MediationRequested);
            trade.set_mediation_split(2_000_000, 500_000);
        }

        // Record deposit on both via the real deposit path is exercised
        // elsewhere; here a minimal recorded payout message is enough.
        let payout = crate::tx::SignedTransaction {
            tx: crate::tx::RawTransaction {
                inputs: vec![],
                outputs: vec![
                    crate::tx::TxOutput { address: "addr-maker".to_string(), value: 2_000_000 },
                    crate::tx::TxOutput { address: "addr-taker".to_string(), value: 500_000 },
                ],
            },
            signatures: vec![],
        };
        let msg = crate::messaging::MediatedPayoutPublishedMessage {
            message_id: uuid::Uuid::new_v4(),
            trade_id: "trade-1".to_string(),
            sender: "maker:1".to_string(),
            tx_bytes: payout.to_bytes(),
        };

        let mut registry = TradeRegistry::new(16);
        registry.insert(taker);
        let deps = deps_with(taker_wallet(), StubMessenger::new());

        let report = dispatch_message(
            &mut registry,
            &deps,
            TradeMessage::MediatedPayoutPublished(msg),
        )
        .await
        .unwrap()
        .expect("processed");
        assert!(report.succeeded(), "failure: {:?}", report.failure);

        // Still present right after dispatch — close is deferred one tick
        assert!(registry.contains("trade-1"));
        assert!(registry.has_deferred_closes());
        assert_eq!(
            registry.get("trade-1").unwrap().mediation_result_state,
            MediationResultState::PayoutPublishedMsgArrived
        );

        let closed = registry.process_deferred_closes();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].dispute_state, DisputeState::MediationClosed);
        assert!(!registry.contains("trade-1"));
    }
}
