//! Deposit transaction coordinator
//!
//! Builds the shared 2-of-2 multisig escrow transaction from both parties'
//! funding inputs, collects both signatures, and publishes it. Both sides
//! construct the transaction independently from the handshake-exchanged
//! inputs and compare digests — the finalizer never trusts the peer's bytes
//! beyond the signature share it needs.
//!
//! Flow (funding side):    reserve → record → build+sign → send to peer
//! Flow (finalizing side): reserve → record → build+sign → process peer msg
//!                         → combine, broadcast, release reservation
//!                         → announce the published tx back to the peer

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::TradeContext;
use crate::messaging::{send_with_ack_timeout, DeliveryOutcome, DepositTxMessage, TradeMessage};
use crate::runner::{ProtocolTask, TaskDeps, TaskOutcome};
use crate::trade::Trade;
use crate::tx::{
    multisig_address, sort_inputs, DepositPayload, PartialDeposit, RawTransaction,
    SignedTransaction, TxOutput,
};
use crate::types::{Phase, TradeStep};

/// Closed set of deposit protocol steps
pub enum DepositTask {
    ReserveFundingInputs,
    RecordFundingReservation,
    BuildAndSignDepositTx,
    ProcessDepositTxMessage(DepositTxMessage),
    SendDepositTxToPeer,
    FinalizeAndBroadcastDepositTx,
    SendDepositPublishedToPeer,
}

/// Task sequence for the side that sends its signature to the finalizer
pub fn funding_tasks() -> Vec<DepositTask> {
    vec![
        DepositTask::ReserveFundingInputs,
        DepositTask::RecordFundingReservation,
        DepositTask::BuildAndSignDepositTx,
        DepositTask::SendDepositTxToPeer,
    ]
}

/// Task sequence for the finalizing side, triggered by the peer's message
pub fn finalize_tasks(message: DepositTxMessage) -> Vec<DepositTask> {
    vec![
        DepositTask::ReserveFundingInputs,
        DepositTask::RecordFundingReservation,
        DepositTask::BuildAndSignDepositTx,
        DepositTask::ProcessDepositTxMessage(message),
        DepositTask::FinalizeAndBroadcastDepositTx,
        DepositTask::SendDepositPublishedToPeer,
    ]
}

/// Sequence for the funding side receiving the published deposit back
pub fn published_deposit_tasks(message: DepositTxMessage) -> Vec<DepositTask> {
    vec![DepositTask::ProcessDepositTxMessage(message)]
}

/// Funding input amount this party must reserve.
///
/// The seller additionally funds the trade amount; 2× the transaction fee
/// covers this party's share of the deposit and the eventual payout fees.
/// A trade fee already paid in the escrow currency is credited.
pub fn required_funding_amount(trade: &Trade, tx_fee: u64) -> u64 {
    let mut amount = trade.own_security_deposit();
    if !trade.is_buyer() {
        amount += trade.contract.trade_amount;
    }
    amount += 2 * tx_fee;
    let fee_credit = if trade.fee_paid_in_escrow_currency {
        trade.trade_fee
    } else {
        0
    };
    amount.saturating_sub(fee_credit)
}

/// Build the unsigned deposit transaction both parties must agree on.
///
/// Inputs are the union of both parties' reserved inputs in deterministic
/// order; output 0 is the multisig escrow (total escrow + 2× fee, funding the
/// payout transaction's fee), followed by any change outputs sorted by
/// address. Whatever remains is the miner fee.
pub fn build_deposit_tx(trade: &Trade, ctx: &TradeContext, tx_fee: u64) -> Result<RawTransaction> {
    let reservation = ctx
        .reservation
        .as_ref()
        .ok_or_else(|| anyhow!("No funding reservation in working context"))?;
    if ctx.counterparty.funding_inputs.is_empty() {
        bail!("No counterparty funding inputs recorded");
    }

    let mut inputs = reservation.inputs.clone();
    inputs.extend(ctx.counterparty.funding_inputs.iter().cloned());
    sort_inputs(&mut inputs);

    let [key_a, key_b] = trade.contract.multisig_keys();
    let escrow = TxOutput {
        address: multisig_address(&key_a, &key_b),
        value: trade.total_escrow() + 2 * tx_fee,
    };

    let mut change: Vec<TxOutput> = reservation
        .change_output
        .iter()
        .chain(ctx.counterparty.change_output.iter())
        .filter(|o| o.value > 0)
        .cloned()
        .collect();
    change.sort_by(|a, b| a.address.cmp(&b.address));

    let mut outputs = vec![escrow];
    outputs.extend(change);

    let tx = RawTransaction { inputs, outputs };
    if tx.total_input_value() < tx.total_output_value() {
        bail!(
            "Deposit inputs {} do not cover outputs {}",
            tx.total_input_value(),
            tx.total_output_value()
        );
    }
    Ok(tx)
}

impl DepositTask {
    async fn reserve_funding_inputs(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        // Funding only makes sense before the payout stage; a later phase
        // reaching this task is a protocol violation, not a retry case.
        if trade.phase.rank() > Phase::DepositPublished.rank() {
            return TaskOutcome::Fatal(anyhow!(
                "Protocol violation: funding requested in phase {}",
                trade.phase
            ));
        }

        let amount = required_funding_amount(trade, deps.config.tx_fee);
        debug!("[{}] Reserving {} for funding", trade.id, amount);
        match deps.wallet.reserve_funding_inputs(&trade.id, amount).await {
            Ok(reservation) => {
                ctx.reservation = Some(reservation);
                TaskOutcome::Complete
            }
            Err(e) => TaskOutcome::Recoverable(e.context("Failed to reserve funding inputs")),
        }
    }

    fn record_funding_reservation(&self, trade: &mut Trade, ctx: &mut TradeContext) -> TaskOutcome {
        let Some(reservation) = &ctx.reservation else {
            return TaskOutcome::Fatal(anyhow!("No funding reservation to record"));
        };
        info!(
            "[{}] Funding reserved: {} input(s), change to {}",
            trade.id,
            reservation.inputs.len(),
            reservation.change_address
        );
        trade.advance_step(TradeStep::FundingReserved);
        TaskOutcome::Complete
    }

    async fn build_and_sign(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        let Some(reservation) = ctx.reservation.clone() else {
            return TaskOutcome::Fatal(anyhow!("No funding reservation in working context"));
        };

        // The key the wallet bound to the reserved funding address must match
        // the key recorded in the contract. A mismatch signals a corrupted or
        // attacked session, never a retryable condition.
        let own_key = trade.own_multisig_key();
        if reservation.multisig_key != own_key {
            return TaskOutcome::Fatal(anyhow!(
                "Multisig key mismatch: wallet bound {}, contract records {}",
                reservation.multisig_key,
                own_key
            ));
        }

        let tx = match build_deposit_tx(trade, ctx, deps.config.tx_fee) {
            Ok(tx) => tx,
            Err(e) => return TaskOutcome::Fatal(e.context("Failed to build deposit tx")),
        };

        let share = match deps.wallet.sign(&trade.id, &tx).await {
            Ok(share) => share,
            Err(e) => return TaskOutcome::Recoverable(e.context("Failed to sign deposit tx")),
        };

        info!("[{}] Deposit tx {} built and signed", trade.id, tx.txid());
        ctx.prepared_deposit_tx = Some(tx);
        ctx.own_deposit_signature = Some(share);
        trade.advance_step(TradeStep::DepositTxSigned);
        TaskOutcome::Complete
    }

    async fn process_deposit_tx_message(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
        message: &DepositTxMessage,
    ) -> TaskOutcome {
        match DepositPayload::from_bytes(&message.tx_bytes) {
            Ok(DepositPayload::Partial(partial)) => self.process_partial(trade, ctx, partial),
            Ok(DepositPayload::Published(signed)) => {
                self.process_published(trade, deps, signed).await
            }
            Err(e) => TaskOutcome::Fatal(e.context("Malformed deposit tx message")),
        }
    }

    fn process_partial(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        partial: PartialDeposit,
    ) -> TaskOutcome {
        let Some(own_tx) = &ctx.prepared_deposit_tx else {
            return TaskOutcome::Fatal(anyhow!("Deposit tx not prepared before processing peer message"));
        };

        // Never adopt the peer's transaction — compare digests against our
        // own independent construction.
        if partial.tx.txid() != own_tx.txid() {
            return TaskOutcome::Fatal(anyhow!(
                "Deposit tx mismatch: peer built {}, we built {}",
                partial.tx.txid(),
                own_tx.txid()
            ));
        }

        let peer_key = trade.peer_multisig_key();
        if partial.signature.signer != peer_key {
            return TaskOutcome::Fatal(anyhow!(
                "Deposit signature from unexpected key {}, expected {}",
                partial.signature.signer,
                peer_key
            ));
        }

        debug!("[{}] Recorded counterparty deposit signature", trade.id);
        ctx.counterparty.deposit_signature = Some(partial.signature);
        TaskOutcome::Complete
    }

    /// Funding side learns the published deposit from the finalizer
    async fn process_published(
        &self,
        trade: &mut Trade,
        deps: &TaskDeps,
        signed: SignedTransaction,
    ) -> TaskOutcome {
        // Idempotent: repeat delivery of an already-recorded deposit is a no-op
        if trade.deposit_tx.is_some() {
            debug!("[{}] Deposit already recorded, ignoring repeat", trade.id);
            return TaskOutcome::Complete;
        }

        // The escrow output must commit to our multisig address and amount
        let [key_a, key_b] = trade.contract.multisig_keys();
        let expected_address = multisig_address(&key_a, &key_b);
        let Some(escrow) = signed.tx.outputs.first() else {
            return TaskOutcome::Fatal(anyhow!("Published deposit has no outputs"));
        };
        if escrow.address != expected_address {
            return TaskOutcome::Fatal(anyhow!(
                "Published deposit escrows to {}, expected {}",
                escrow.address,
                expected_address
            ));
        }
        if escrow.value < trade.total_escrow() {
            return TaskOutcome::Fatal(anyhow!(
                "Published deposit escrows {} but the contract requires {}",
                escrow.value,
                trade.total_escrow()
            ));
        }

        let mut signers: Vec<_> = signed.signatures.iter().map(|s| s.signer).collect();
        signers.sort();
        let mut expected = vec![key_a, key_b];
        expected.sort();
        if signers != expected {
            return TaskOutcome::Fatal(anyhow!("Published deposit not signed by both trade keys"));
        }

        let txid = signed.txid();
        trade.record_deposit_tx(signed);
        trade.deposit_txid = Some(txid.clone());
        trade.advance_step(TradeStep::DepositTxPublished);
        trade.advance_phase(Phase::DepositPublished);
        info!("[{}] Published deposit tx {} recorded from peer", trade.id, txid);

        // Our reserved inputs are spent in the recorded tx — the reservation
        // entry goes back to the wallet's bookkeeping
        if let Err(e) = deps.wallet.release_reservation(&trade.id).await {
            trade.append_error(format!("Failed to release funding reservation: {:#}", e));
        }
        TaskOutcome::Complete
    }

    async fn send_deposit_tx(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        let (Some(tx), Some(signature)) = (
            ctx.prepared_deposit_tx.clone(),
            ctx.own_deposit_signature.clone(),
        ) else {
            return TaskOutcome::Fatal(anyhow!("Deposit tx not signed before send"));
        };

        let payload = DepositPayload::Partial(PartialDeposit { tx, signature });
        let message = TradeMessage::DepositTx(DepositTxMessage {
            message_id: Uuid::new_v4(),
            trade_id: trade.id.clone(),
            sender: deps.config.node_address.clone(),
            tx_bytes: payload.to_bytes(),
        });

        trade.advance_step(TradeStep::DepositTxSent);
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
                trade.advance_step(TradeStep::DepositTxArrived);
                TaskOutcome::Complete
            }
            DeliveryOutcome::StoredInMailbox => {
                trade.advance_step(TradeStep::DepositTxInMailbox);
                TaskOutcome::Complete
            }
            DeliveryOutcome::AckTimeout => {
                // Delivery uncertain, not failed — the message may still land
                trade.append_error(
                    "Deposit tx message delivery uncertain: no acknowledgement within timeout",
                );
                TaskOutcome::Complete
            }
            DeliveryOutcome::Failed(reason) => {
                trade.advance_step(TradeStep::DepositTxSendFailed);
                TaskOutcome::Recoverable(anyhow!("Failed to send deposit tx message: {}", reason))
            }
        }
    }

    async fn finalize_and_broadcast(
        &self,
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> TaskOutcome {
        if trade.deposit_txid.is_some() {
            info!("[{}] Deposit tx already published, nothing to do", trade.id);
            return TaskOutcome::Complete;
        }

        // Reuse the recorded transaction on retry; assemble it only once.
        // Recording before the broadcast outcome is known means a re-entrant
        // caller sees that a transaction object exists and cannot trigger a
        // second, diverging broadcast.
        let signed = match &trade.deposit_tx {
            Some(recorded) => recorded.clone(),
            None => {
                let Some(tx) = ctx.prepared_deposit_tx.clone() else {
                    return TaskOutcome::Fatal(anyhow!("Deposit tx not prepared before finalize"));
                };
                let (Some(own), Some(peer)) = (
                    ctx.own_deposit_signature.clone(),
                    ctx.counterparty.deposit_signature.clone(),
                ) else {
                    return TaskOutcome::Fatal(anyhow!("Missing signature share for deposit finalize"));
                };

                let signed = match SignedTransaction::assemble(
                    tx,
                    vec![own, peer],
                    trade.contract.multisig_keys(),
                ) {
                    Ok(s) => s,
                    Err(e) => return TaskOutcome::Fatal(e.context("Failed to assemble deposit tx")),
                };
                trade.record_deposit_tx(signed.clone());
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
                trade.deposit_txid = Some(txid.clone());
                trade.advance_step(TradeStep::DepositTxPublished);
                trade.advance_phase(Phase::DepositPublished);
                info!("[{}] Deposit tx {} published", trade.id, txid);

                // The reserved inputs are now spent — swap the reservation
                // back so the wallet stops excluding them from balances.
                if let Err(e) = deps.wallet.release_reservation(&trade.id).await {
                    trade.append_error(format!("Failed to release funding reservation: {:#}", e));
                }
                TaskOutcome::Complete
            }
            Ok(Err(e)) => TaskOutcome::Recoverable(e.context("Deposit broadcast rejected")),
            Err(_) => TaskOutcome::Recoverable(anyhow!(
                "Deposit broadcast outcome unknown: timed out after {}s",
                deps.config.broadcast_timeout_secs
            )),
        }
    }

    /// Send the fully signed, published deposit back to the funding side so
    /// both parties hold the record the payout protocols spend from.
    async fn send_deposit_published(&self, trade: &mut Trade, deps: &TaskDeps) -> TaskOutcome {
        let Some(signed) = trade.deposit_tx.clone() else {
            return TaskOutcome::Fatal(anyhow!("No recorded deposit tx to announce"));
        };

        let payload = DepositPayload::Published(signed);
        let message = TradeMessage::DepositTx(DepositTxMessage {
            message_id: Uuid::new_v4(),
            trade_id: trade.id.clone(),
            sender: deps.config.node_address.clone(),
            tx_bytes: payload.to_bytes(),
        });

        let outcome = send_with_ack_timeout(
            deps.messenger.as_ref(),
            &trade.peer_node_address,
            &trade.peer_node_key,
            message,
            deps.config.ack_timeout(),
        )
        .await;

        match outcome {
            DeliveryOutcome::Arrived | DeliveryOutcome::StoredInMailbox => TaskOutcome::Complete,
            DeliveryOutcome::AckTimeout => {
                trade.append_error(
                    "Deposit published message delivery uncertain: no acknowledgement within timeout",
                );
                TaskOutcome::Complete
            }
            DeliveryOutcome::Failed(reason) => TaskOutcome::Recoverable(anyhow!(
                "Failed to send deposit published message: {}",
                reason
            )),
        }
    }
}

#[async_trait]
impl ProtocolTask for DepositTask {
    fn name(&self) -> &'static str {
        match self {
            DepositTask::ReserveFundingInputs => "ReserveFundingInputs",
            DepositTask::RecordFundingReservation => "RecordFundingReservation",
            DepositTask::BuildAndSignDepositTx => "BuildAndSignDepositTx",
            DepositTask::ProcessDepositTxMessage(_) => "ProcessDepositTxMessage",
            DepositTask::SendDepositTxToPeer => "SendDepositTxToPeer",
            DepositTask::FinalizeAndBroadcastDepositTx => "FinalizeAndBroadcastDepositTx",
            DepositTask::SendDepositPublishedToPeer => "SendDepositPublishedToPeer",
        }
    }

    async fn run(&self, trade: &mut Trade, ctx: &mut TradeContext, deps: &TaskDeps) -> TaskOutcome {
        match self {
            DepositTask::ReserveFundingInputs => self.reserve_funding_inputs(trade, ctx, deps).await,
            DepositTask::RecordFundingReservation => self.record_funding_reservation(trade, ctx),
            DepositTask::BuildAndSignDepositTx => self.build_and_sign(trade, ctx, deps).await,
            DepositTask::ProcessDepositTxMessage(message) => {
                self.process_deposit_tx_message(trade, ctx, deps, message).await
            }
            DepositTask::SendDepositTxToPeer => self.send_deposit_tx(trade, ctx, deps).await,
            DepositTask::FinalizeAndBroadcastDepositTx => {
                self.finalize_and_broadcast(trade, ctx, deps).await
            }
            DepositTask::SendDepositPublishedToPeer => {
                self.send_deposit_published(trade, deps).await
            }
        }
    }
}
