//! Time-gated mining of the primary token.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::LedgerResult;
use crate::storage::AirdropStorage;

/// DiFi credited per successful mine.
pub const MINE_DIFI_AMOUNT: f64 = 0.25;

/// Fixed cooldown between successive mines per user.
pub const MINE_INTERVAL_HOURS: i64 = 12;

#[derive(Debug, Clone, Serialize)]
pub struct MineReceipt {
    pub mined: f64,
    pub difi_balance: f64,
    pub last_mine_at: DateTime<Utc>,
    pub remaining_supply: f64,
}

#[derive(Clone)]
pub struct MiningGate {
    storage: Arc<AirdropStorage>,
}

impl MiningGate {
    pub fn new(storage: Arc<AirdropStorage>) -> Self {
        Self { storage }
    }

    /// Mine once for `user_id`. Fails with `CooldownActive` (remaining
    /// time decomposed h/m/s) inside the window, `SupplyExhausted` when
    /// the pool cannot cover the amount; neither failure mutates the user.
    pub fn mine(&self, user_id: &str) -> LedgerResult<MineReceipt> {
        self.mine_at(user_id, Utc::now())
    }

    pub fn mine_at(&self, user_id: &str, now: DateTime<Utc>) -> LedgerResult<MineReceipt> {
        let receipt = self.storage.mine_commit(
            user_id,
            MINE_DIFI_AMOUNT,
            Duration::hours(MINE_INTERVAL_HOURS),
            now,
        )?;
        info!(
            "User {} mined {} DiFi ({} remaining in pool)",
            user_id, receipt.mined, receipt.remaining_supply
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::error::LedgerError;
    use crate::storage::NewUser;

    fn setup(total_supply: f64) -> (Arc<AirdropStorage>, MiningGate, String) {
        let storage = Arc::new(
            AirdropStorage::in_memory_with(TokenConfig {
                symbol: "DiFi".to_string(),
                total_supply,
            })
            .unwrap(),
        );
        let user = storage
            .create_user(&NewUser {
                username: "miner".to_string(),
                email: "miner@example.com".to_string(),
                referred_by: None,
            })
            .unwrap();
        (storage.clone(), MiningGate::new(storage), user.id)
    }

    #[test]
    fn test_first_mine_succeeds_immediately() {
        let (storage, gate, user_id) = setup(100.0);
        let now = Utc::now();

        let receipt = gate.mine_at(&user_id, now).unwrap();
        assert_eq!(receipt.mined, MINE_DIFI_AMOUNT);
        assert_eq!(receipt.difi_balance, 0.25);
        assert_eq!(receipt.last_mine_at, now);

        let user = storage.user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(user.last_mine_at, Some(now));
    }

    #[test]
    fn test_cooldown_boundaries() {
        let (_storage, gate, user_id) = setup(100.0);
        let t0 = Utc::now();
        gate.mine_at(&user_id, t0).unwrap();

        // 11h59m later: one minute still to wait.
        let err = gate
            .mine_at(&user_id, t0 + Duration::minutes(11 * 60 + 59))
            .unwrap_err();
        match err {
            LedgerError::CooldownActive {
                hours,
                minutes,
                seconds,
            } => assert_eq!((hours, minutes, seconds), (0, 1, 0)),
            other => panic!("unexpected error: {other:?}"),
        }

        // 12h01m later: eligible.
        let receipt = gate
            .mine_at(&user_id, t0 + Duration::minutes(12 * 60 + 1))
            .unwrap();
        assert_eq!(receipt.difi_balance, 0.5);
    }

    #[test]
    fn test_supply_exhausted_leaves_user_unchanged() {
        let (storage, gate, user_id) = setup(0.10);

        let err = gate.mine(&user_id).unwrap_err();
        assert!(matches!(err, LedgerError::SupplyExhausted));

        let user = storage.user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(user.difi_balance, 0.0);
        assert!(user.last_mine_at.is_none());
    }

    #[test]
    fn test_unknown_user() {
        let (_storage, gate, _user_id) = setup(100.0);
        let err = gate.mine("no-such-user").unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound));
    }

    #[test]
    fn test_concurrent_mines_never_overdraw_supply() {
        // Pool covers exactly two mines; four users race for them.
        let storage = Arc::new(
            AirdropStorage::in_memory_with(TokenConfig {
                symbol: "DiFi".to_string(),
                total_supply: 0.5,
            })
            .unwrap(),
        );
        let user_ids: Vec<String> = (0..4)
            .map(|i| {
                storage
                    .create_user(&NewUser {
                        username: format!("miner{i}"),
                        email: format!("miner{i}@example.com"),
                        referred_by: None,
                    })
                    .unwrap()
                    .id
            })
            .collect();

        let gate = MiningGate::new(storage.clone());
        let handles: Vec<_> = user_ids
            .into_iter()
            .map(|id| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.mine(&id).is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 2);

        let snapshot = storage.supply_snapshot().unwrap();
        assert_eq!(snapshot.circulating_supply, snapshot.total_supply);
    }
}
