//! Trade lifecycle state types
//!
//! All four state dimensions are monotonic: a trade only moves forward through
//! `Phase` and `TradeStep`, and the dispute/mediation markers never regress.
//! Transitions are triggered exclusively by protocol tasks.

use serde::{Deserialize, Serialize};

/// Coarse trade lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Trade created, deposit not yet on the network
    Init,
    /// Deposit transaction broadcast accepted
    DepositPublished,
    /// Deposit transaction reached confirmation depth
    DepositConfirmed,
    /// Payout transaction recorded/broadcast
    PayoutPublished,
    /// Funds moved out of the trade wallet
    Withdrawn,
    /// Fatal protocol or data-integrity failure; manual intervention required
    Failed,
    /// Dispute resolved through mediation
    MediationClosed,
}

impl Phase {
    /// Ordering rank for monotonicity checks. Terminal branches rank above
    /// every linear phase so a closed trade can never be re-opened.
    pub fn rank(self) -> u8 {
        match self {
            Phase::Init => 0,
            Phase::DepositPublished => 1,
            Phase::DepositConfirmed => 2,
            Phase::PayoutPublished => 3,
            Phase::Withdrawn => 4,
            Phase::Failed => 10,
            Phase::MediationClosed => 11,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Withdrawn | Phase::Failed | Phase::MediationClosed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Init => write!(f, "Init"),
            Phase::DepositPublished => write!(f, "DepositPublished"),
            Phase::DepositConfirmed => write!(f, "DepositConfirmed"),
            Phase::PayoutPublished => write!(f, "PayoutPublished"),
            Phase::Withdrawn => write!(f, "Withdrawn"),
            Phase::Failed => write!(f, "Failed"),
            Phase::MediationClosed => write!(f, "MediationClosed"),
        }
    }
}

/// Fine-grained protocol checkpoint, advanced by the deposit coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStep {
    Init,
    /// Funding inputs and change reserved in the wallet
    FundingReserved,
    /// Own share of the deposit transaction signed
    DepositTxSigned,
    /// Deposit tx message dispatched, delivery outcome pending
    DepositTxSent,
    /// Transport reported the send failed; message may be retried
    DepositTxSendFailed,
    /// Peer was offline, message buffered in its mailbox
    DepositTxInMailbox,
    /// Peer acknowledged arrival
    DepositTxArrived,
    /// Deposit transaction broadcast by the finalizing side
    DepositTxPublished,
}

impl TradeStep {
    pub fn rank(self) -> u8 {
        match self {
            TradeStep::Init => 0,
            TradeStep::FundingReserved => 1,
            TradeStep::DepositTxSigned => 2,
            TradeStep::DepositTxSent => 3,
            TradeStep::DepositTxSendFailed => 4,
            TradeStep::DepositTxInMailbox => 5,
            TradeStep::DepositTxArrived => 6,
            TradeStep::DepositTxPublished => 7,
        }
    }
}

impl std::fmt::Display for TradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStep::Init => write!(f, "Init"),
            TradeStep::FundingReserved => write!(f, "FundingReserved"),
            TradeStep::DepositTxSigned => write!(f, "DepositTxSigned"),
            TradeStep::DepositTxSent => write!(f, "DepositTxSent"),
            TradeStep::DepositTxSendFailed => write!(f, "DepositTxSendFailed"),
            TradeStep::DepositTxInMailbox => write!(f, "DepositTxInMailbox"),
            TradeStep::DepositTxArrived => write!(f, "DepositTxArrived"),
            TradeStep::DepositTxPublished => write!(f, "DepositTxPublished"),
        }
    }
}

/// Dispute lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeState {
    NoDispute,
    /// This side opened mediation
    MediationRequested,
    /// The counterparty opened mediation
    MediationStartedByPeer,
    /// Mediation concluded and the trade was closed
    MediationClosed,
}

impl DisputeState {
    pub fn rank(self) -> u8 {
        match self {
            DisputeState::NoDispute => 0,
            DisputeState::MediationRequested => 1,
            DisputeState::MediationStartedByPeer => 2,
            DisputeState::MediationClosed => 3,
        }
    }

    pub fn in_mediation(self) -> bool {
        matches!(
            self,
            DisputeState::MediationRequested | DisputeState::MediationStartedByPeer
        )
    }
}

impl std::fmt::Display for DisputeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisputeState::NoDispute => write!(f, "NoDispute"),
            DisputeState::MediationRequested => write!(f, "MediationRequested"),
            DisputeState::MediationStartedByPeer => write!(f, "MediationStartedByPeer"),
            DisputeState::MediationClosed => write!(f, "MediationClosed"),
        }
    }
}

/// Progress of the mediated payout exchange.
///
/// Every delivery outcome gets its own value so support diagnostics can tell
/// "never sent" from "sent, outcome unknown" from "peer confirmed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediationResultState {
    Undefined,
    /// Own signature over the proposed payout produced
    PayoutTxSigned,
    SigMsgSent,
    SigMsgSendFailed,
    SigMsgInMailbox,
    SigMsgArrived,
    /// Fully signed payout transaction recorded on the trade
    PayoutTxPublished,
    PayoutPublishedMsgSent,
    PayoutPublishedMsgSendFailed,
    PayoutPublishedMsgInMailbox,
    PayoutPublishedMsgArrived,
    /// Payout learned from a chain scan before any message arrived
    PayoutTxSeenInNetwork,
}

impl MediationResultState {
    pub fn rank(self) -> u8 {
        match self {
            MediationResultState::Undefined => 0,
            MediationResultState::PayoutTxSigned => 1,
            MediationResultState::SigMsgSent => 2,
            MediationResultState::SigMsgSendFailed => 3,
            MediationResultState::SigMsgInMailbox => 4,
            MediationResultState::SigMsgArrived => 5,
            MediationResultState::PayoutTxPublished => 6,
            MediationResultState::PayoutPublishedMsgSent => 7,
            MediationResultState::PayoutPublishedMsgSendFailed => 8,
            MediationResultState::PayoutPublishedMsgInMailbox => 9,
            MediationResultState::PayoutPublishedMsgArrived => 10,
            MediationResultState::PayoutTxSeenInNetwork => 11,
        }
    }
}

impl std::fmt::Display for MediationResultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MediationResultState::Undefined => "Undefined",
            MediationResultState::PayoutTxSigned => "PayoutTxSigned",
            MediationResultState::SigMsgSent => "SigMsgSent",
            MediationResultState::SigMsgSendFailed => "SigMsgSendFailed",
            MediationResultState::SigMsgInMailbox => "SigMsgInMailbox",
            MediationResultState::SigMsgArrived => "SigMsgArrived",
            MediationResultState::PayoutTxPublished => "PayoutTxPublished",
            MediationResultState::PayoutPublishedMsgSent => "PayoutPublishedMsgSent",
            MediationResultState::PayoutPublishedMsgSendFailed => "PayoutPublishedMsgSendFailed",
            MediationResultState::PayoutPublishedMsgInMailbox => "PayoutPublishedMsgInMailbox",
            MediationResultState::PayoutPublishedMsgArrived => "PayoutPublishedMsgArrived",
            MediationResultState::PayoutTxSeenInNetwork => "PayoutTxSeenInNetwork",
        };
        write!(f, "{}", name)
    }
}

/// This party's role in the trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    BuyerAsMaker,
    BuyerAsTaker,
    SellerAsMaker,
    SellerAsTaker,
}

impl Role {
    pub fn is_buyer(self) -> bool {
        matches!(self, Role::BuyerAsMaker | Role::BuyerAsTaker)
    }

    pub fn is_maker(self) -> bool {
        matches!(self, Role::BuyerAsMaker | Role::SellerAsMaker)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::BuyerAsMaker => write!(f, "buyer/maker"),
            Role::BuyerAsTaker => write!(f, "buyer/taker"),
            Role::SellerAsMaker => write!(f, "seller/maker"),
            Role::SellerAsTaker => write!(f, "seller/taker"),
        }
    }
}
