//! Sequential task execution engine
//!
//! Every protocol run is an ordered list of tasks executed strictly one at a
//! time; awaiting a task is the only suspension point. The first failure
//! aborts the remaining tasks (fail-fast) and is reported exactly once.
//! Side effects already committed to the trade or context are not rolled
//! back — each committed step is individually safe to have happened.
//!
//! The trade is persisted after every completed task, so a restarted process
//! resumes from the last checkpoint.

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::context::TradeContext;
use crate::messaging::PeerMessenger;
use crate::store::TradeStore;
use crate::trade::Trade;
use crate::wallet::WalletBackend;

/// Terminal outcome of a single task invocation — exactly one per run
pub enum TaskOutcome {
    Complete,
    /// The trade is not corrupted; the same sequence can be retried later
    Recoverable(Error),
    /// Data-integrity or protocol violation; the trade is flagged failed
    Fatal(Error),
}

/// Capabilities handed to every task
#[derive(Clone)]
pub struct TaskDeps {
    pub wallet: Arc<dyn WalletBackend>,
    pub messenger: Arc<dyn PeerMessenger>,
    pub store: Arc<dyn TradeStore>,
    pub config: EngineConfig,
}

/// One atomic protocol step.
///
/// Concrete steps are closed enums (`DepositTask`, `MediationTask`) whose
/// `run` dispatches exhaustively, so adding a step forces every match to be
/// updated.
#[async_trait]
pub trait ProtocolTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, trade: &mut Trade, ctx: &mut TradeContext, deps: &TaskDeps) -> TaskOutcome;
}

#[derive(Debug)]
pub struct TaskFailure {
    pub task: &'static str,
    pub reason: String,
    pub fatal: bool,
}

/// Result of one sequence run
#[derive(Debug)]
pub struct RunReport {
    pub trade_id: String,
    pub completed: Vec<&'static str>,
    pub failure: Option<TaskFailure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct TaskRunner;

impl TaskRunner {
    /// Execute `tasks` in order against one trade.
    ///
    /// On `Recoverable` the fault is appended to the trade's error log; on
    /// `Fatal` the trade is flagged failed. Either way the remaining tasks
    /// are skipped and the failure appears exactly once in the report.
    pub async fn run<T: ProtocolTask>(
        tasks: &[T],
        trade: &mut Trade,
        ctx: &mut TradeContext,
        deps: &TaskDeps,
    ) -> RunReport {
        let mut report = RunReport {
            trade_id: trade.id.clone(),
            completed: Vec::new(),
            failure: None,
        };

        for task in tasks {
            debug!("[{}] Running task {}", trade.id, task.name());

            match task.run(trade, ctx, deps).await {
                TaskOutcome::Complete => {
                    if let Err(e) = deps.store.persist(trade) {
                        trade.append_error(format!("Checkpoint persist failed: {:#}", e));
                        report.failure = Some(TaskFailure {
                            task: task.name(),
                            reason: format!("{:#}", e),
                            fatal: false,
                        });
                        break;
                    }
                    report.completed.push(task.name());
                }
                TaskOutcome::Recoverable(e) => {
                    trade.append_error(format!("{}: {:#}", task.name(), e));
                    report.failure = Some(TaskFailure {
                        task: task.name(),
                        reason: format!("{:#}", e),
                        fatal: false,
                    });
                    break;
                }
                TaskOutcome::Fatal(e) => {
                    error!("[{}] Fatal failure in {}: {:#}", trade.id, task.name(), e);
                    trade.fail(format!("{}: {:#}", task.name(), e));
                    report.failure = Some(TaskFailure {
                        task: task.name(),
                        reason: format!("{:#}", e),
                        fatal: true,
                    });
                    break;
                }
            }
        }

        if report.failure.is_some() {
            // Best-effort checkpoint of the failure bookkeeping itself
            if let Err(e) = deps.store.persist(trade) {
                error!("[{}] Failed to persist after failure: {:#}", trade.id, e);
            }
        } else {
            info!(
                "[{}] Sequence complete ({} task(s))",
                trade.id,
                report.completed.len()
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{deps, test_trade_pair};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::types::Phase;

    enum Script {
        Ok,
        Recoverable,
        Fatal,
    }

    struct ScriptedTask {
        name: &'static str,
        script: Script,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProtocolTask for ScriptedTask {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _trade: &mut Trade, _ctx: &mut TradeContext, _deps: &TaskDeps) -> TaskOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Ok => TaskOutcome::Complete,
                Script::Recoverable => TaskOutcome::Recoverable(anyhow::anyhow!("send failed")),
                Script::Fatal => TaskOutcome::Fatal(anyhow::anyhow!("amounts do not balance")),
            }
        }
    }

    fn task(name: &'static str, script: Script) -> (ScriptedTask, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (ScriptedTask { name, script, runs: runs.clone() }, runs)
    }

    #[tokio::test]
    async fn test_all_tasks_complete_in_order() {
        let (mut trade, _) = test_trade_pair();
        let mut ctx = TradeContext::for_trade(&trade);
        let deps = deps();

        let (a, runs_a) = task("a", Script::Ok);
        let (b, runs_b) = task("b", Script::Ok);
        let report = TaskRunner::run(&[a, b], &mut trade, &mut ctx, &deps).await;

        assert!(report.succeeded());
        assert_eq!(report.completed, vec!["a", "b"]);
        assert_eq!(runs_a.load(Ordering::SeqCst), 1);
        assert_eq!(runs_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_tasks() {
        let (mut trade, _) = test_trade_pair();
        let mut ctx = TradeContext::for_trade(&trade);
        let deps = deps();

        let (a, _) = task("a", Script::Ok);
        let (b, runs_b) = task("b", Script::Recoverable);
        let (c, runs_c) = task("c", Script::Ok);
        let report = TaskRunner::run(&[a, b, c], &mut trade, &mut ctx, &deps).await;

        let failure = report.failure.expect("expected failure");
        assert_eq!(failure.task, "b");
        assert!(!failure.fatal);
        assert_eq!(runs_b.load(Ordering::SeqCst), 1);
        assert_eq!(runs_c.load(Ordering::SeqCst), 0, "task after failure must never run");

        // Recoverable: trade annotated but not failed
        assert_eq!(trade.error_log.len(), 1);
        assert_ne!(trade.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_fatal_failure_flags_trade() {
        let (mut trade, _) = test_trade_pair();
        let mut ctx = TradeContext::for_trade(&trade);
        let deps = deps();

        let (a, _) = task("a", Script::Fatal);
        let (b, runs_b) = task("b", Script::Ok);
        let report = TaskRunner::run(&[a, b], &mut trade, &mut ctx, &deps).await;

        let failure = report.failure.expect("expected failure");
        assert!(failure.fatal);
        assert_eq!(trade.phase, Phase::Failed);
        assert_eq!(runs_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_persisted_per_task() {
        let (mut trade, _) = test_trade_pair();
        let mut ctx = TradeContext::for_trade(&trade);
        let deps = deps();

        let (a, _) = task("a", Script::Ok);
        let report = TaskRunner::run(&[a], &mut trade, &mut ctx, &deps).await;
        assert!(report.succeeded());

        let pending = deps.store.load_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, trade.id);
    }

    #[tokio::test]
    async fn test_empty_sequence_succeeds() {
        let (mut trade, _) = test_trade_pair();
        let mut ctx = TradeContext::for_trade(&trade);
        let deps = deps();

        let report = TaskRunner::run::<ScriptedTask>(&[], &mut trade, &mut ctx, &deps).await;
        assert!(report.succeeded());
        assert!(report.completed.is_empty());
    }
}
