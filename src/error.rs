//! Error kinds for ledger operations.
//!
//! Every failure a ledger operation can report is enumerated here; the
//! Display strings are the user-visible messages. Internal failures
//! (storage, gateway) are mapped to generic messages at the HTTP layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Mining attempted before the cooldown elapsed. Retryable once the
    /// remaining time has passed.
    #[error("You can mine again in {hours}h {minutes}m {seconds}s.")]
    CooldownActive {
        hours: i64,
        minutes: i64,
        seconds: i64,
    },

    /// The remaining DiFi supply cannot cover the requested amount.
    #[error("Not enough DiFi remaining in the supply pool.")]
    SupplyExhausted,

    /// User input failed validation (conversion amount, USD amount).
    #[error("{0}")]
    InvalidAmount(String),

    #[error("Insufficient Dpower balance.")]
    InsufficientBalance,

    #[error("Task already claimed.")]
    AlreadyClaimed,

    #[error("Task not found.")]
    TaskNotFound,

    /// Webhook signature did not match the HMAC of the payload.
    #[error("Invalid signature.")]
    InvalidSignature,

    /// Webhook referenced an invoice id we never issued. Logged and
    /// dropped, never retried.
    #[error("Payment order not found.")]
    OrderNotFound,

    #[error("User not found.")]
    UserNotFound,

    /// A user with the same username or email already exists.
    #[error("A user with that username or email already exists.")]
    UserExists,

    #[error("This account is blocked.")]
    AccountBlocked,

    /// Authenticated user lacks admin rights.
    #[error("Admin access required.")]
    Forbidden,

    /// External input did not match the expected shape (missing fields,
    /// unknown payment status). Rejected before any ledger state changes.
    #[error("Malformed request payload.")]
    InvalidPayload,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("payment gateway error: {0}")]
    Gateway(String),
}

impl LedgerError {
    /// Build a `CooldownActive` from the remaining wait, decomposed into
    /// whole hours/minutes/seconds.
    pub fn cooldown(remaining: chrono::Duration) -> Self {
        let secs = remaining.num_seconds().max(0);
        LedgerError::CooldownActive {
            hours: secs / 3600,
            minutes: (secs % 3600) / 60,
            seconds: secs % 60,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_decomposition() {
        let err = LedgerError::cooldown(chrono::Duration::seconds(3 * 3600 + 25 * 60 + 7));
        match err {
            LedgerError::CooldownActive {
                hours,
                minutes,
                seconds,
            } => {
                assert_eq!(hours, 3);
                assert_eq!(minutes, 25);
                assert_eq!(seconds, 7);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cooldown_never_negative() {
        let err = LedgerError::cooldown(chrono::Duration::seconds(-5));
        match err {
            LedgerError::CooldownActive {
                hours,
                minutes,
                seconds,
            } => {
                assert_eq!((hours, minutes, seconds), (0, 0, 0));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
