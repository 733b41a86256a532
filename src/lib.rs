//! DialFi Airdrop - backend for the DiFi token airdrop platform
//!
//! Users accrue DiFi (the capped primary token) and Dpower (the uncapped
//! point currency) and an administrator manages users and tasks.
//!
//! # How users earn
//!
//! 1. Mining: 0.25 DiFi per mine, one mine every 12 hours
//! 2. Tasks: a one-time DiFi reward per completed social task
//! 3. Referrals: 2000 Dpower to the referrer per referred registration
//! 4. Purchase: Dpower bought through a crypto payment gateway
//! 5. Conversion: 250 Dpower -> 0.25 DiFi, drawn from the same pool
//!
//! # Ledger rules
//!
//! - Every DiFi credit first reserves from a single capped supply counter
//!   (atomic check-and-increment; concurrent requests can never jointly
//!   overdraw the pool)
//! - Mining is rate limited per user by a fixed cooldown
//! - Gateway payment notifications are HMAC-verified and credited exactly
//!   once per order, no matter how often or in what order they arrive
//! - Admin balance overrides bypass supply accounting by design

pub mod admin;
pub mod config;
pub mod convert;
pub mod error;
pub mod gateway;
pub mod migrations;
pub mod mining;
pub mod payments;
pub mod referral;
pub mod server;
pub mod storage;
pub mod supply;
pub mod tasks;

pub use config::Config;
pub use convert::ConversionEngine;
pub use error::{LedgerError, LedgerResult};
pub use gateway::{NowPaymentsClient, PaymentGateway};
pub use mining::MiningGate;
pub use payments::{PaymentService, PaymentStatus};
pub use referral::ReferralAccrual;
pub use storage::AirdropStorage;
pub use supply::SupplyLedger;
pub use tasks::TaskLedger;
