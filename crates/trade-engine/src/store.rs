//! Trade persistence
//!
//! Trades are checkpointed after every task so a restarted process can
//! rebuild working contexts for in-flight trades. The file store writes one
//! JSON document per trade, atomically (write to .tmp, then rename), with a
//! format version checked on load. Corrupt or version-mismatched files are
//! skipped with a warning, never a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::trade::Trade;

/// Current trade file format version
const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredTrade {
    version: u32,
    /// ISO 8601 timestamp when the checkpoint was written
    saved_at: String,
    trade: Trade,
}

/// Persistence capability consumed by the task runner
pub trait TradeStore: Send + Sync {
    fn persist(&self, trade: &Trade) -> Result<()>;

    /// Load all non-terminal trades. Used once at process start to
    /// reconstruct working contexts for in-flight trades.
    fn load_pending(&self) -> Result<Vec<Trade>>;

    /// Drop a closed trade's record
    fn remove(&self, trade_id: &str) -> Result<()>;
}

/// One JSON file per trade under a data directory
pub struct FileTradeStore {
    dir: PathBuf,
}

impl FileTradeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create trade store dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, trade_id: &str) -> PathBuf {
        self.dir.join(format!("trade-{}.json", trade_id))
    }

    fn load_file(path: &Path) -> Option<Trade> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to read trade file {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<StoredTrade>(&data) {
            Ok(stored) => {
                if stored.version != STORE_VERSION {
                    warn!(
                        "Trade file {} version {} != expected {}, skipping",
                        path.display(),
                        stored.version,
                        STORE_VERSION
                    );
                    return None;
                }
                Some(stored.trade)
            }
            Err(e) => {
                warn!("Failed to parse trade file {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl TradeStore for FileTradeStore {
    fn persist(&self, trade: &Trade) -> Result<()> {
        let stored = StoredTrade {
            version: STORE_VERSION,
            saved_at: chrono::Utc::now().to_rfc3339(),
            trade: trade.clone(),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        let path = self.path_for(&trade.id);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to rename into {}", path.display()))?;
        Ok(())
    }

    fn load_pending(&self) -> Result<Vec<Trade>> {
        let mut trades = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read trade store dir {}", self.dir.display()))?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(trade) = Self::load_file(&path) {
                if trade.phase.is_terminal() {
                    continue;
                }
                trades.push(trade);
            }
        }

        // Deterministic startup order regardless of directory iteration order
        trades.sort_by(|a, b| a.id.cmp(&b.id));
        if !trades.is_empty() {
            info!("Loaded {} pending trade(s) from {}", trades.len(), self.dir.display());
        }
        Ok(trades)
    }

    fn remove(&self, trade_id: &str) -> Result<()> {
        let path = self.path_for(trade_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// In-memory store for tests and local simulation
#[derive(Default)]
pub struct MemoryTradeStore {
    trades: Mutex<HashMap<String, Trade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TradeStore for MemoryTradeStore {
    fn persist(&self, trade: &Trade) -> Result<()> {
        self.trades
            .lock()
            .expect("trade store lock poisoned")
            .insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    fn load_pending(&self) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .lock()
            .expect("trade store lock poisoned")
            .values()
            .filter(|t| !t.phase.is_terminal())
            .cloned()
            .collect();
        trades.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(trades)
    }

    fn remove(&self, trade_id: &str) -> Result<()> {
        self.trades
            .lock()
            .expect("trade store lock poisoned")
            .remove(trade_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::tests::test_trade;
    use crate::types::{Phase, Role, TradeStep};

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTradeStore::new(dir.path()).unwrap();

        let mut trade = test_trade(Role::BuyerAsMaker);
        trade.advance_step(TradeStep::FundingReserved);
        store.persist(&trade).unwrap();

        let loaded = store.load_pending().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, trade.id);
        assert_eq!(loaded[0].step, TradeStep::FundingReserved);
        assert_eq!(loaded[0].contract_hash, trade.contract_hash);
    }

    #[test]
    fn test_file_store_skips_terminal_trades() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTradeStore::new(dir.path()).unwrap();

        let mut failed = test_trade(Role::BuyerAsMaker);
        failed.id = "trade-failed".to_string();
        failed.fail("boom");
        store.persist(&failed).unwrap();

        let pending = test_trade(Role::SellerAsTaker);
        store.persist(&pending).unwrap();

        let loaded = store.load_pending().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, pending.id);
        assert_eq!(loaded[0].phase, Phase::Init);
    }

    #[test]
    fn test_file_store_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTradeStore::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("trade-bogus.json"), "{not json").unwrap();
        store.persist(&test_trade(Role::BuyerAsMaker)).unwrap();

        let loaded = store.load_pending().unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_file_store_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTradeStore::new(dir.path()).unwrap();

        let trade = test_trade(Role::BuyerAsMaker);
        store.persist(&trade).unwrap();
        store.remove(&trade.id).unwrap();
        assert!(store.load_pending().unwrap().is_empty());
        // Removing again is a no-op
        store.remove(&trade.id).unwrap();
    }

    #[test]
    fn test_persist_overwrites_checkpoint() {
        let store = MemoryTradeStore::new();
        let mut trade = test_trade(Role::BuyerAsMaker);
        store.persist(&trade).unwrap();
        trade.advance_step(TradeStep::DepositTxSigned);
        store.persist(&trade).unwrap();

        let loaded = store.load_pending().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].step, TradeStep::DepositTxSigned);
    }
}
