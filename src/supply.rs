//! Supply ledger for the capped primary token.
//!
//! One authoritative counter per token symbol. Reservations are a single
//! conditional check-and-increment in storage; there is no rollback
//! primitive, so callers mutate balances only after a successful
//! reservation.

use std::sync::Arc;

use serde::Serialize;

use crate::error::LedgerResult;
use crate::storage::AirdropStorage;

#[derive(Debug, Clone, Serialize)]
pub struct SupplyRecord {
    pub symbol: String,
    pub total_supply: f64,
    pub circulating_supply: f64,
}

impl SupplyRecord {
    pub fn remaining(&self) -> f64 {
        self.total_supply - self.circulating_supply
    }
}

#[derive(Clone)]
pub struct SupplyLedger {
    storage: Arc<AirdropStorage>,
}

impl SupplyLedger {
    pub fn new(storage: Arc<AirdropStorage>) -> Self {
        Self { storage }
    }

    /// Current supply figures; creates the record on first read.
    pub fn snapshot(&self) -> LedgerResult<SupplyRecord> {
        self.storage.supply_snapshot()
    }

    /// Reserve `amount` from the remaining supply and add it to
    /// circulation. Returns the new remaining supply, or
    /// `SupplyExhausted` without any state change.
    pub fn reserve_and_commit(&self, amount: f64) -> LedgerResult<f64> {
        self.storage.reserve_and_commit(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining() {
        let record = SupplyRecord {
            symbol: "DiFi".to_string(),
            total_supply: 100_000_000.0,
            circulating_supply: 250.5,
        };
        assert_eq!(record.remaining(), 100_000_000.0 - 250.5);
    }

    #[test]
    fn test_reserve_through_ledger() {
        let storage = Arc::new(AirdropStorage::in_memory().unwrap());
        let ledger = SupplyLedger::new(storage);

        let remaining = ledger.reserve_and_commit(0.25).unwrap();
        assert_eq!(remaining, 100_000_000.0 - 0.25);

        let snapshot = ledger.snapshot().unwrap();
        assert_eq!(snapshot.circulating_supply, 0.25);
    }
}
