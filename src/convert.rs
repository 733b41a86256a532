//! Conversion of secondary points into the primary token.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::{LedgerError, LedgerResult};
use crate::storage::AirdropStorage;

/// Minimum conversion unit: whole multiples of this many Dpower.
pub const DPOWER_CONVERSION_AMOUNT: i64 = 250;

/// DiFi earned per conversion unit.
pub const DPOWER_CONVERSION_RATE_DIFI: f64 = 0.25;

#[derive(Debug, Clone, Serialize)]
pub struct ConvertReceipt {
    pub converted_points: i64,
    pub tokens_earned: f64,
    pub difi_balance: f64,
    pub dpower_balance: i64,
    pub remaining_supply: f64,
}

#[derive(Clone)]
pub struct ConversionEngine {
    storage: Arc<AirdropStorage>,
}

impl ConversionEngine {
    pub fn new(storage: Arc<AirdropStorage>) -> Self {
        Self { storage }
    }

    /// Convert `points_amount` Dpower into DiFi at the fixed rate.
    /// The amount must be a positive whole multiple of 250; the user must
    /// hold at least that many points and the pool must cover the DiFi.
    pub fn convert(&self, user_id: &str, points_amount: i64) -> LedgerResult<ConvertReceipt> {
        if points_amount <= 0 || points_amount % DPOWER_CONVERSION_AMOUNT != 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "Invalid Dpower amount. Must be a positive multiple of {}.",
                DPOWER_CONVERSION_AMOUNT
            )));
        }

        let tokens_earned =
            (points_amount / DPOWER_CONVERSION_AMOUNT) as f64 * DPOWER_CONVERSION_RATE_DIFI;

        let receipt = self
            .storage
            .convert_commit(user_id, points_amount, tokens_earned)?;
        info!(
            "User {} converted {} Dpower to {} DiFi",
            user_id, points_amount, tokens_earned
        );
        Ok(receipt)
    }
}
