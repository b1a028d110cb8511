//! Trade execution core for a peer-to-peer escrow exchange
//!
//! Two mutually distrusting counterparties cooperatively construct, sign and
//! publish the transactions that escrow and later release funds — no
//! custodian. Every protocol step runs as a task in a strictly sequential
//! per-trade runner with uniform fault handling and checkpoint persistence,
//! so any step can fail, be retried, or be resumed by a restarted process.
//!
//! Key components:
//! - Task engine with fail-fast sequencing (`runner`)
//! - Deposit transaction coordinator (`deposit`)
//! - Mediated payout coordinator (`mediation`)
//! - Pluggable wallet, messenger and persistence backends
//!   (`wallet`, `messaging`, `store`)

pub mod config;
pub mod context;
pub mod contract;
pub mod deposit;
pub mod dispatch;
pub mod logging;
pub mod mediation;
pub mod messaging;
pub mod registry;
pub mod runner;
pub mod store;
pub mod trade;
pub mod tx;
pub mod types;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testutil;
