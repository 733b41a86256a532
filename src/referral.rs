//! Referral bonus accrual.
//!
//! A referrer earns a fixed one-time Dpower bonus when a referred user
//! registers. Dpower is uncapped, so the grant is not gated by supply.
//! An unknown referral code is not an error: registration proceeds
//! without a referrer association.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::LedgerResult;
use crate::storage::{AirdropStorage, User};

/// Dpower granted to the referrer per referred registration.
pub const REFERRAL_DPOWER_BONUS: i64 = 2000;

#[derive(Clone)]
pub struct ReferralAccrual {
    storage: Arc<AirdropStorage>,
}

impl ReferralAccrual {
    pub fn new(storage: Arc<AirdropStorage>) -> Self {
        Self { storage }
    }

    /// Look up the referrer for a supplied code. `None` means the code is
    /// unknown and the caller should register the new user without an
    /// association.
    pub fn resolve_referrer(&self, code: &str) -> LedgerResult<Option<User>> {
        let referrer = self.storage.user_by_referral_code(code)?;
        if referrer.is_none() {
            warn!(
                "Referral code '{}' not found. New user registered without a referrer.",
                code
            );
        }
        Ok(referrer)
    }

    /// Credit the one-time bonus; returns the referrer's new Dpower
    /// balance.
    pub fn credit_referrer(&self, referrer: &User) -> LedgerResult<i64> {
        let balance = self
            .storage
            .credit_dpower(&referrer.id, REFERRAL_DPOWER_BONUS)?;
        info!(
            "Referral bonus of {} Dpower given to referrer {} ({})",
            REFERRAL_DPOWER_BONUS, referrer.username, referrer.referral_code
        );
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewUser;

    #[test]
    fn test_referrer_credited_once_per_registration() {
        let storage = Arc::new(AirdropStorage::in_memory().unwrap());
        let accrual = ReferralAccrual::new(storage.clone());

        let referrer = storage
            .create_user(&NewUser {
                username: "referrer".to_string(),
                email: "referrer@example.com".to_string(),
                referred_by: None,
            })
            .unwrap();

        let resolved = accrual
            .resolve_referrer(&referrer.referral_code)
            .unwrap()
            .unwrap();
        storage
            .create_user(&NewUser {
                username: "friend".to_string(),
                email: "friend@example.com".to_string(),
                referred_by: Some(resolved.referral_code.clone()),
            })
            .unwrap();
        let balance = accrual.credit_referrer(&resolved).unwrap();
        assert_eq!(balance, REFERRAL_DPOWER_BONUS);

        let referrer = storage.user_by_id(&referrer.id).unwrap().unwrap();
        assert_eq!(referrer.dpower_balance, REFERRAL_DPOWER_BONUS);
    }

    #[test]
    fn test_unknown_code_resolves_to_none() {
        let storage = Arc::new(AirdropStorage::in_memory().unwrap());
        let accrual = ReferralAccrual::new(storage.clone());

        assert!(accrual.resolve_referrer("nope").unwrap().is_none());

        // Registration still proceeds, just without an association.
        let user = storage
            .create_user(&NewUser {
                username: "solo".to_string(),
                email: "solo@example.com".to_string(),
                referred_by: None,
            })
            .unwrap();
        assert!(user.referred_by.is_none());
    }
}
