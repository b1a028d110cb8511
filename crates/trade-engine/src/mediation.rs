//! Mediated payout coordinator
//!
//! Fallback path after a mediator has determined the split of the escrowed
//! funds. Both parties sign a payout transaction paying exactly that split,
//! exchange signatures, one side finalizes and broadcasts, and both sides
//! are notified of completion.
//!
//! The amount invariant — buyer payout + seller payout must equal the total
//! escrow — is checked before any signature is produced and again before
//! finalization. A violation is a data-integrity fault, never corrected.

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::TradeContext;
use crate::messaging::{
    send_with_ack_timeout, DeliveryOutcome, MediatedPayoutPublishedMessage,
    MediatedPayoutSignatureMessage, TradeMessage,
};
use crate::runner::{ProtocolTask, TaskDeps, TaskOutcome};
use crate::trade::Trade;
use crate::tx::{RawTransaction, SignatureShare, SignedTransaction, TxInput, TxOutput};
use crate::types::{MediationResultState, Phase};

/// Closed set of mediated payout steps
pub enum MediationTask {
    SignMediatedPayoutTx,
    SendMediatedPayoutSignature,
    ProcessMediatedPayoutSignature(MediatedPayoutSignatureMessage),
    FinalizeMediatedPayoutTx,
    SendPayoutPublishedMessage,
    ProcessPayoutPublished(MediatedPayoutPublishedMessage),
}

/// Sequence for the side that signs first and sends its signature
pub fn signer_tasks() -> Vec<MediationTask> {
    vec![
        MediationTask::SignMediatedPayoutTx,
        MediationTask::SendMediatedPayoutSignature,
    ]
}

/// Sequence for the finalizing side, triggered by the peer's signature
pub fn finalizer_tasks(message: MediatedPayoutSignatureMessage) -> Vec<MediationTask> {
    vec![
        MediationTask::SignMediatedPayoutTx,
        MediationTask::ProcessMediatedPayoutSignature(message),
        MediationTask::FinalizeMediatedPayoutTx,
        MediationTask::SendPayoutPublishedMessage,
    ]
}

/// Sequence for processing a payout-published notification
pub fn published_tasks(message: MediatedPayoutPublishedMessage) -> Vec<MediationTask> {
    vec![MediationTask::ProcessPayoutPublished(message)]
}

/// Build the payout transaction spending the deposit's multisig output.
///
/// Output order is buyer first, seller second — the order the multisig script
/// expects. The escrow output exceeds the payouts by 2× the transaction fee,
/// which becomes the miner fee here.
pub fn build_payout_tx(
    trade: &Trade,
    buyer_payout: u64,
    seller_payout: u64,
) -> anyhow::Result<RawTransaction> {
    let deposit = trade.expect_deposit_tx()?;
    let escrow_output = deposit
        .tx
        .outputs
        .first()
        .ok_or_else(|| anyhow!("Deposit tx has no outputs"))?;

    Ok(RawTransaction {
        inputs: vec![TxInput {
            prev_txid: deposit.txid(),
            prev_vout: 0,
            value: escrow_output.value,
        }],
        outputs: vec![
            TxOutput {
                address: trade.contract.buyer_payout_address().to_string(),
                value: buyer_payout,
            },
            TxOutput {
                address: trade.contract.seller_payout_address().to_string(),
                value: seller_payout,
            },
        ],
    })
}

impl MediationTask {
    async fn sign_payout_tx(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        if !trade.dispute_state.in_mediation() {
            return TaskOutcome::Fatal(anyhow!(
                "Mediated payout requested but trade is not in mediation (dispute state {})",
                trade.dispute_state
            ));
        }

        let (buyer_payout, seller_payout) = match trade.expect_mediation_split() {
            Ok(split) => split,
            Err(e) => return TaskOutcome::Fatal(e),
        };

        // Checked before any signature exists — an unbalanced split must
        // abort without producing one.
        if let Err(e) = trade.check_payout_balance(buyer_payout, seller_payout) {
            return TaskOutcome::Fatal(e);
        }
        if let Err(e) = trade.verify_contract_hash() {
            return TaskOutcome::Fatal(e);
        }

        let tx = match build_payout_tx(trade, buyer_payout, seller_payout) {
            Ok(tx) => tx,
            Err(e) => return TaskOutcome::Fatal(e.context("Failed to build payout tx")),
        };

        let share = match deps.wallet.sign(&trade.id, &tx).await {
            Ok(share) => share,
            Err(e) => return TaskOutcome::Recoverable(e.context("Failed to sign payout tx")),
        };

        info!(
            "[{}] Mediated payout tx signed (buyer {}, seller {})",
            trade.id, buyer_payout, seller_payout
        );
        ctx.prepared_payout_tx = Some(tx);
        ctx.own_payout_signature = Some(share);
        trade.advance_mediation_result_state(MediationResultState::PayoutTxSigned);
        TaskOutcome::Complete
    }

    async fn send_signature(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        let Some(share) = ctx.own_payout_signature.clone() else {
            return TaskOutcome::Fatal(anyhow!("No payout signature to send"));
        };

        let message = TradeMessage::MediatedPayoutSignature(MediatedPayoutSignatureMessage {
            message_id: Uuid::new_v4(),
            trade_id: trade.id.clone(),
            sender: deps.config.node_address.clone(),
            signer: share.signer,
            signature_b64: share.signature_b64,
        });

        trade.advance_mediation_result_state(MediationResultState::SigMsgSent);
        let outcome = send_with_ack_timeout(
            deps.messenger.as_ref(),
            &trade.peer_node_address,
            &trade.peer_node_key,
            message,
            deps.config.ack_timeout(),
        )
        .await;

        match outcome {
            DeliveryOutcome::Arrived => {
                trade.advance_mediation_result_state(MediationResultState::SigMsgArrived);
                TaskOutcome::Complete
            }
            DeliveryOutcome::StoredInMailbox => {
                trade.advance_mediation_result_state(MediationResultState::SigMsgInMailbox);
                TaskOutcome::Complete
            }
            DeliveryOutcome::AckTimeout => {
                trade.append_error(
                    "Payout signature message delivery uncertain: no acknowledgement within timeout",
                );
                TaskOutcome::Complete
            }
            DeliveryOutcome::Failed(reason) => {
                trade.advance_mediation_result_state(MediationResultState::SigMsgSendFailed);
                TaskOutcome::Recoverable(anyhow!(
                    "Failed to send payout signature message: {}",
                    reason
                ))
            }
        }
    }

    fn process_signature(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        message: &MediatedPayoutSignatureMessage,
    ) -> TaskOutcome {
        let peer_key = trade.peer_multisig_key();
        if message.signer != peer_key {
            return TaskOutcome::Fatal(anyhow!(
                "Payout signature from unexpected key {}, expected {}",
                message.signer,
                peer_key
            ));
        }

        debug!("[{}] Recorded counterparty payout signature", trade.id);
        ctx.counterparty.payout_signature = Some(SignatureShare {
            signer: message.signer,
            signature_b64: message.signature_b64.clone(),
        });
        TaskOutcome::Complete
    }

    async fn finalize(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        if trade.payout_txid.is_some() {
            info!("[{}] Payout tx already published, nothing to do", trade.id);
            return TaskOutcome::Complete;
        }

        let signed = match &trade.payout_tx {
            Some(recorded) => recorded.clone(),
            None => {
                let (buyer_payout, seller_payout) = match trade.expect_mediation_split() {
                    Ok(split) => split,
                    Err(e) => return TaskOutcome::Fatal(e),
                };
                // Re-validated here: the context was rebuilt since signing and
                // the split could have been corrupted in between.
                if let Err(e) = trade.check_payout_balance(buyer_payout, seller_payout) {
                    return TaskOutcome::Fatal(e);
                }

                let Some(tx) = ctx.prepared_payout_tx.clone() else {
                    return TaskOutcome::Fatal(anyhow!("Payout tx not prepared before finalize"));
                };
                let (Some(own), Some(peer)) = (
                    ctx.own_payout_signature.clone(),
                    ctx.counterparty.payout_signature.clone(),
                ) else {
                    return TaskOutcome::Fatal(anyhow!("Missing signature share for payout finalize"));
                };

                let signed = match SignedTransaction::assemble(
                    tx,
                    vec![own, peer],
                    trade.contract.multisig_keys(),
                ) {
                    Ok(s) => s,
                    Err(e) => return TaskOutcome::Fatal(e.context("Failed to assemble payout tx")),
                };
                trade.record_payout_tx(signed.clone());
                trade.advance_phase(Phase::PayoutPublished);
                trade.advance_mediation_result_state(MediationResultState::PayoutTxPublished);

                // The multisig funding entry goes back to the general pool
                // now that the spending tx is durably recorded.
                if let Err(e) = deps.wallet.release_reservation(&trade.id).await {
                    trade.append_error(format!("Failed to release multisig reservation: {:#}", e));
                }
                signed
            }
        };

        let broadcast = tokio::time::timeout(
            deps.config.broadcast_timeout(),
            deps.wallet.broadcast(&signed),
        )
        .await;

        match broadcast {
            Ok(Ok(txid)) => {
                info!("[{}] Payout tx {} published", trade.id, txid);
                trade.payout_txid = Some(txid);
                TaskOutcome::Complete
            }
            Ok(Err(e)) => TaskOutcome::Recoverable(e.context("Payout broadcast rejected")),
            Err(_) => TaskOutcome::Recoverable(anyhow!(
                "Payout broadcast outcome unknown: timed out after {}s",
                deps.config.broadcast_timeout_secs
            )),
        }
    }

    async fn send_published(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        let Some(payout) = trade.payout_tx.clone() else {
            return TaskOutcome::Fatal(anyhow!("No payout tx recorded before publish notification"));
        };

        let message = TradeMessage::MediatedPayoutPublished(MediatedPayoutPublishedMessage {
            message_id: Uuid::new_v4(),
            trade_id: trade.id.clone(),
            sender: deps.config.node_address.clone(),
            tx_bytes: payout.to_bytes(),
        });

        trade.advance_mediation_result_state(MediationResultState::PayoutPublishedMsgSent);
        let outcome = send_with_ack_timeout(
            deps.messenger.as_ref(),
            &trade.peer_node_address,
            &trade.peer_node_key,
            message,
            deps.config.ack_timeout(),
        )
        .await;

        let result = match outcome {
            DeliveryOutcome::Arrived => {
                trade.advance_mediation_result_state(MediationResultState::PayoutPublishedMsgArrived);
                TaskOutcome::Complete
            }
            DeliveryOutcome::StoredInMailbox => {
                trade
                    .advance_mediation_result_state(MediationResultState::PayoutPublishedMsgInMailbox);
                TaskOutcome::Complete
            }
            DeliveryOutcome::AckTimeout => {
                trade.append_error(
                    "Payout published message delivery uncertain: no acknowledgement within timeout",
                );
                TaskOutcome::Complete
            }
            DeliveryOutcome::Failed(reason) => {
                trade
                    .advance_mediation_result_state(MediationResultState::PayoutPublishedMsgSendFailed);
                TaskOutcome::Recoverable(anyhow!(
                    "Failed to send payout published message: {}",
                    reason
                ))
            }
        };

        if matches!(result, TaskOutcome::Complete) {
            // Closing is deferred one scheduling tick: the caller may be
            // iterating the pending-trades collection right now.
            ctx.close_requested = true;
        }
        result
    }

    fn process_published(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        message: &MediatedPayoutPublishedMessage,
    ) -> TaskOutcome {
        // Idempotent: a payout already recorded (repeat delivery, or learned
        // from a chain scan before the message arrived) is never overwritten.
        if trade.payout_tx.is_some() {
            debug!("[{}] Payout already recorded, updating state only", trade.id);
            trade.advance_mediation_result_state(MediationResultState::PayoutPublishedMsgArrived);
            ctx.close_requested = true;
            return TaskOutcome::Complete;
        }

        let incoming = match SignedTransaction::from_bytes(&message.tx_bytes) {
            Ok(tx) => tx,
            Err(e) => return TaskOutcome::Fatal(e.context("Malformed payout published message")),
        };

        // The peer's payout must still pay out exactly what was escrowed
        if incoming.tx.total_output_value() != trade.total_escrow() {
            return TaskOutcome::Fatal(anyhow!(
                "Published payout pays {} but escrow holds {}",
                incoming.tx.total_output_value(),
                trade.total_escrow()
            ));
        }

        trade.record_payout_tx(incoming);
        trade.advance_phase(Phase::PayoutPublished);
        trade.advance_mediation_result_state(MediationResultState::PayoutPublishedMsgArrived);
        ctx.close_requested = true;
        TaskOutcome::Complete
    }
}

#[async_trait]
impl ProtocolTask for MediationTask {
    fn name(&self) -> &'static str {
        match self {
            MediationTask::SignMediatedPayoutTx => "SignMediatedPayoutTx",
            MediationTask::SendMediatedPayoutSignature => "SendMediatedPayoutSignature",
            MediationTask::ProcessMediatedPayoutSignature(_) => "ProcessMediatedPayoutSignature",
            MediationTask::FinalizeMediatedPayoutTx => "FinalizeMediatedPayoutTx",
            MediationTask::SendPayoutPublishedMessage => "SendPayoutPublishedMessage",
            MediationTask::ProcessPayoutPublished(_) => "ProcessPayoutPublished",
        }
    }

    async fn run(&self, trade: &mut Trade, ctx: &mut TradeContext, deps: &TaskDeps) -> TaskOutcome {
        match self {
            MediationTask::SignMediatedPayoutTx => self.sign_payout_tx(trade, ctx, deps).await,
            MediationTask::SendMediatedPayoutSignature => self.send_signature(trade, ctx, deps).await,
            MediationTask::ProcessMediatedPayoutSignature(message) => {
                self.process_signature(trade, ctx, message)
            }
            MediationTask::FinalizeMediatedPayoutTx => self.finalize(trade, ctx, deps).await,
            MediationTask::SendPayoutPublishedMessage => self.send_published(trade, ctx, deps).await,
            MediationTask::ProcessPayoutPublished(message) => {
                self.process_published(trade, ctx, message)
            }
        }
    }
}
