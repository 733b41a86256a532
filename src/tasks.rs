//! One-time airdrop task rewards.
//!
//! Tasks are created and edited by administrators; a user claims each
//! task at most once. The reward paid is the value read inside the claim
//! transaction, so an admin edit committing before the claim wins and a
//! later claim pays the edited amount.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LedgerResult;
use crate::storage::AirdropStorage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub link: String,
    pub platform: String,
    pub reward: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub description: Option<String>,
    pub link: String,
    pub platform: String,
    pub reward: f64,
}

/// Field mask for admin task edits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub platform: Option<String>,
    pub reward: Option<f64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimReceipt {
    pub task_name: String,
    pub reward: f64,
    pub difi_balance: f64,
    pub remaining_supply: f64,
}

#[derive(Clone)]
pub struct TaskLedger {
    storage: Arc<AirdropStorage>,
}

impl TaskLedger {
    pub fn new(storage: Arc<AirdropStorage>) -> Self {
        Self { storage }
    }

    pub fn list(&self) -> LedgerResult<Vec<Task>> {
        self.storage.list_tasks()
    }

    /// Claim a task reward once. Fails with `AlreadyClaimed` on a repeat,
    /// `TaskNotFound` for an unknown id, `SupplyExhausted` when the pool
    /// cannot cover the reward; failures leave balances untouched.
    pub fn claim(&self, user_id: &str, task_id: &str) -> LedgerResult<ClaimReceipt> {
        let receipt = self.storage.claim_task_commit(user_id, task_id)?;
        info!(
            "User {} claimed task \"{}\" for {} DiFi",
            user_id, receipt.task_name, receipt.reward
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

    fn setup(total_supply: f64) -> (Arc<AirdropStorage>, TaskLedger) {
        let storage = Arc::new(
            AirdropStorage::in_memory_with(TokenConfig {
                symbol: "DiFi".to_string(),
                total_supply,
            })
            .unwrap(),
        );
        (storage.clone(), TaskLedger::new(storage))
    }

    fn user(storage: &AirdropStorage, name: &str) -> String {
        storage
            .create_user(&NewUser {
                username: name.to_string(),
                email: format!("{name}@example.com"),
                referred_by: None,
            })
            .unwrap()
            .id
    }

    fn task(storage: &AirdropStorage, reward: f64) -> Task {
        storage
            .create_task(&NewTask {
                name: "Join our Telegram".to_string(),
                description: Some("Join and say hi".to_string()),
                link: "https://t.me/dialfi".to_string(),
                platform: "Telegram".to_string(),
                reward,
            })
            .unwrap()
    }

    #[test]
    fn test_claim_twice_fails_second_time() {
        let (storage, ledger) = setup(100.0);
        let user_id = user(&storage, "claimer");
        let task = task(&storage, 0.25);

        let receipt = ledger.claim(&user_id, &task.id).unwrap();
        assert_eq!(receipt.reward, 0.25);

        let err = ledger.claim(&user_id, &task.id).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyClaimed));

        let u = storage.user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(u.difi_balance, 0.25);
    }

    #[test]
    fn test_independent_users_claim_same_task() {
        let (storage, ledger) = setup(100.0);
        let a = user(&storage, "alice");
        let b = user(&storage, "bob");
        let task = task(&storage, 0.5);

        ledger.claim(&a, &task.id).unwrap();
        ledger.claim(&b, &task.id).unwrap();

        let snapshot = storage.supply_snapshot().unwrap();
        assert_eq!(snapshot.circulating_supply, 1.0);
    }

    #[test]
    fn test_reward_snapshot_at_claim_time() {
        let (storage, ledger) = setup(100.0);
        let a = user(&storage, "early");
        let b = user(&storage, "late");
        let task = task(&storage, 0.25);

        let receipt = ledger.claim(&a, &task.id).unwrap();
        assert_eq!(receipt.reward, 0.25);

        storage
            .update_task(
                &task.id,
                &TaskUpdate {
                    reward: Some(1.0),
                    ..Default::default()
                },
            )
            .unwrap();

        // A claim after the edit pays the edited reward.
        let receipt = ledger.claim(&b, &task.id).unwrap();
        assert_eq!(receipt.reward, 1.0);
    }

    #[test]
    fn test_supply_exhausted_claim() {
        let (storage, ledger) = setup(0.10);
        let user_id = user(&storage, "claimer");
        let task = task(&storage, 0.25);

        let err = ledger.claim(&user_id, &task.id).unwrap_err();
        assert!(matches!(err, LedgerError::SupplyExhausted));

        let u = storage.user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(u.difi_balance, 0.0);
        assert!(storage.completed_task_ids(&user_id).unwrap().is_empty());
    }
}
