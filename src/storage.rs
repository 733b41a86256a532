//! SQLite storage for the airdrop ledger
//!
//! All SQL lives here. Compound ledger mutations (mine, convert, claim,
//! webhook credit) run inside a single transaction behind the connection
//! mutex, so the guard check, the supply reservation and the paired
//! balance write commit or fail together. The mutex is also the
//! serialization point for the singleton supply row: two concurrent
//! requests can never jointly overdraw the remaining supply.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::convert::ConvertReceipt;
use crate::error::{LedgerError, LedgerResult};
use crate::migrations::Migrator;
use crate::mining::MineReceipt;
use crate::payments::{NewPaymentOrder, PaymentOrder, PaymentStatus, WebhookOutcome};
use crate::supply::SupplyRecord;
use crate::tasks::{ClaimReceipt, NewTask, Task, TaskUpdate};

const REFERRAL_CODE_LEN: usize = 10;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub difi_balance: f64,
    pub dpower_balance: i64,
    pub referral_code: String,
    pub referred_by: Option<String>,
    pub last_mine_at: Option<DateTime<Utc>>,
    pub is_admin: bool,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    /// Referral code of the referring user, already resolved by the caller.
    pub referred_by: Option<String>,
}

/// Field mask for administrative user updates. Balance overrides write the
/// user record directly and never pass through the supply ledger.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminUserUpdate {
    pub difi_balance: Option<f64>,
    pub dpower_balance: Option<i64>,
    pub is_admin: Option<bool>,
    pub is_blocked: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DifiLeaderboardRow {
    pub username: String,
    pub difi_balance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DpowerLeaderboardRow {
    pub username: String,
    pub dpower_balance: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferrerRow {
    pub username: String,
    pub referral_code: String,
    pub difi_balance: f64,
    pub dpower_balance: i64,
    pub referral_count: i64,
}

// ============================================================================
// STORAGE
// ============================================================================

pub struct AirdropStorage {
    conn: Mutex<Connection>,
    token: TokenConfig,
}

impl AirdropStorage {
    pub fn new(path: impl AsRef<Path>, token: TokenConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
            token,
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(TokenConfig {
            symbol: "DiFi".to_string(),
            total_supply: 100_000_000.0,
        })
    }

    pub fn in_memory_with(token: TokenConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
            token,
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Migrator::new().run(&conn)
    }

    // ========================================================================
    // USERS
    // ========================================================================

    pub fn create_user(&self, new: &NewUser) -> LedgerResult<User> {
        let conn = self.conn.lock().unwrap();
        let email = new.email.trim().to_lowercase();
        let username = new.username.trim().to_string();

        let taken: bool = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1 OR email = ?2",
            params![username, email],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )?;
        if taken {
            return Err(LedgerError::UserExists);
        }

        let id = Uuid::new_v4().to_string();
        let referral_code = generate_referral_code(&conn)?;
        let created_at = Utc::now();

        conn.execute(
            "INSERT INTO users (id, username, email, referral_code, referred_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                username,
                email,
                referral_code,
                new.referred_by,
                created_at.to_rfc3339(),
            ],
        )?;

        info!("Registered user {} ({})", username, id);
        user_by_id_inner(&conn, &id)?.ok_or(LedgerError::UserNotFound)
    }

    pub fn user_by_id(&self, id: &str) -> LedgerResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        user_by_id_inner(&conn, id)
    }

    pub fn user_by_referral_code(&self, code: &str) -> LedgerResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                &format!("{USER_SELECT} WHERE referral_code = ?1"),
                params![code],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> LedgerResult<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{USER_SELECT} ORDER BY created_at DESC"))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Case-insensitive search on username or email.
    pub fn search_users(&self, query: &str) -> LedgerResult<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("%{}%", query);
        let mut stmt = conn.prepare(&format!(
            "{USER_SELECT} WHERE username LIKE ?1 OR email LIKE ?1 ORDER BY created_at DESC"
        ))?;
        let users = stmt
            .query_map(params![pattern], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn count_users(&self) -> LedgerResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn admin_update_user(&self, id: &str, update: &AdminUserUpdate) -> LedgerResult<User> {
        let conn = self.conn.lock().unwrap();
        let user = user_by_id_inner(&conn, id)?.ok_or(LedgerError::UserNotFound)?;

        conn.execute(
            "UPDATE users SET difi_balance = ?1, dpower_balance = ?2, is_admin = ?3, is_blocked = ?4
             WHERE id = ?5",
            params![
                update.difi_balance.unwrap_or(user.difi_balance),
                update.dpower_balance.unwrap_or(user.dpower_balance),
                update.is_admin.unwrap_or(user.is_admin),
                update.is_blocked.unwrap_or(user.is_blocked),
                id,
            ],
        )?;

        user_by_id_inner(&conn, id)?.ok_or(LedgerError::UserNotFound)
    }

    pub fn delete_user(&self, id: &str) -> LedgerResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(LedgerError::UserNotFound);
        }
        Ok(())
    }

    /// Credit secondary points directly (referral bonus). Not gated by
    /// supply: Dpower is uncapped.
    pub fn credit_dpower(&self, user_id: &str, amount: i64) -> LedgerResult<i64> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE users SET dpower_balance = dpower_balance + ?1 WHERE id = ?2",
            params![amount, user_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::UserNotFound);
        }
        let balance = conn.query_row(
            "SELECT dpower_balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    pub fn completed_task_ids(&self, user_id: &str) -> LedgerResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT task_id FROM task_claims WHERE user_id = ?1 ORDER BY claimed_at")?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ========================================================================
    // LEADERBOARDS
    // ========================================================================

    pub fn top_by_difi(&self, limit: i64) -> LedgerResult<Vec<DifiLeaderboardRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT username, difi_balance FROM users ORDER BY difi_balance DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(DifiLeaderboardRow {
                    username: row.get(0)?,
                    difi_balance: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn top_by_dpower(&self, limit: i64) -> LedgerResult<Vec<DpowerLeaderboardRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT username, dpower_balance FROM users ORDER BY dpower_balance DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(DpowerLeaderboardRow {
                    username: row.get(0)?,
                    dpower_balance: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn top_referrers(&self, limit: i64) -> LedgerResult<Vec<ReferrerRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT u.username, u.referral_code, u.difi_balance, u.dpower_balance,
                       (SELECT COUNT(*) FROM users r WHERE r.referred_by = u.referral_code)
                           AS referral_count
                FROM users u
            )
            WHERE referral_count > 0
            ORDER BY referral_count DESC
            LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ReferrerRow {
                    username: row.get(0)?,
                    referral_code: row.get(1)?,
                    difi_balance: row.get(2)?,
                    dpower_balance: row.get(3)?,
                    referral_count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // SUPPLY
    // ========================================================================

    /// Current supply figures; the singleton row is created lazily on
    /// first read.
    pub fn supply_snapshot(&self) -> LedgerResult<SupplyRecord> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        ensure_supply(&tx, &self.token)?;
        let record = supply_record(&tx, &self.token.symbol)?;
        tx.commit()?;
        Ok(record)
    }

    /// Atomic check-and-increment against the fixed cap. Fails with
    /// `SupplyExhausted` when the remaining supply cannot cover `amount`;
    /// on success returns the new remaining supply. There is no rollback
    /// primitive: callers mutate balances only after this succeeds.
    pub fn reserve_and_commit(&self, amount: f64) -> LedgerResult<f64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        ensure_supply(&tx, &self.token)?;
        reserve_supply(&tx, &self.token.symbol, amount)?;
        let record = supply_record(&tx, &self.token.symbol)?;
        tx.commit()?;
        Ok(record.remaining())
    }

    // ========================================================================
    // MINING
    // ========================================================================

    /// Cooldown guard, supply reservation and balance write in one
    /// transaction. A failed reservation leaves the user untouched.
    pub fn mine_commit(
        &self,
        user_id: &str,
        amount: f64,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> LedgerResult<MineReceipt> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT last_mine_at, is_blocked FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, bool>(1)?,
                    ))
                },
            )
            .optional()?;
        let (last_mine_at, is_blocked) = row.ok_or(LedgerError::UserNotFound)?;
        if is_blocked {
            return Err(LedgerError::AccountBlocked);
        }

        if let Some(last) = last_mine_at {
            let last = parse_ts(&last);
            let next_eligible_at = last + cooldown;
            if now < next_eligible_at {
                return Err(LedgerError::cooldown(next_eligible_at - now));
            }
        }

        ensure_supply(&tx, &self.token)?;
        reserve_supply(&tx, &self.token.symbol, amount)?;

        tx.execute(
            "UPDATE users SET difi_balance = difi_balance + ?1, last_mine_at = ?2 WHERE id = ?3",
            params![amount, now.to_rfc3339(), user_id],
        )?;

        let difi_balance: f64 = tx.query_row(
            "SELECT difi_balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        let remaining_supply = supply_record(&tx, &self.token.symbol)?.remaining();
        tx.commit()?;

        Ok(MineReceipt {
            mined: amount,
            difi_balance,
            last_mine_at: now,
            remaining_supply,
        })
    }

    // ========================================================================
    // CONVERSION
    // ========================================================================

    /// Balance guard, supply reservation and the paired balance writes in
    /// one transaction.
    pub fn convert_commit(
        &self,
        user_id: &str,
        points: i64,
        tokens: f64,
    ) -> LedgerResult<ConvertReceipt> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT dpower_balance, is_blocked FROM users WHERE id = ?1",
                params![user_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        let (dpower_balance, is_blocked) = row.ok_or(LedgerError::UserNotFound)?;
        if is_blocked {
            return Err(LedgerError::AccountBlocked);
        }
        if dpower_balance < points {
            return Err(LedgerError::InsufficientBalance);
        }

        ensure_supply(&tx, &self.token)?;
        reserve_supply(&tx, &self.token.symbol, tokens)?;

        tx.execute(
            "UPDATE users SET dpower_balance = dpower_balance - ?1,
                              difi_balance = difi_balance + ?2
             WHERE id = ?3",
            params![points, tokens, user_id],
        )?;

        let (difi_balance, dpower_balance): (f64, i64) = tx.query_row(
            "SELECT difi_balance, dpower_balance FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let remaining_supply = supply_record(&tx, &self.token.symbol)?.remaining();
        tx.commit()?;

        Ok(ConvertReceipt {
            converted_points: points,
            tokens_earned: tokens,
            difi_balance,
            dpower_balance,
            remaining_supply,
        })
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    pub fn create_task(&self, new: &NewTask) -> LedgerResult<Task> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO airdrop_tasks (id, name, description, link, platform, reward, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                id,
                new.name,
                new.description,
                new.link,
                new.platform,
                new.reward,
                Utc::now().to_rfc3339(),
            ],
        )?;
        info!("Created task {} ({} DiFi)", new.name, new.reward);
        task_by_id_inner(&conn, &id)?.ok_or(LedgerError::TaskNotFound)
    }

    pub fn task_by_id(&self, id: &str) -> LedgerResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        task_by_id_inner(&conn, id)
    }

    pub fn list_tasks(&self) -> LedgerResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{TASK_SELECT} ORDER BY created_at"))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn update_task(&self, id: &str, update: &TaskUpdate) -> LedgerResult<Task> {
        let conn = self.conn.lock().unwrap();
        let task = task_by_id_inner(&conn, id)?.ok_or(LedgerError::TaskNotFound)?;

        conn.execute(
            "UPDATE airdrop_tasks
             SET name = ?1, description = ?2, link = ?3, platform = ?4, reward = ?5, is_active = ?6
             WHERE id = ?7",
            params![
                update.name.clone().unwrap_or(task.name),
                update.description.clone().or(task.description),
                update.link.clone().unwrap_or(task.link),
                update.platform.clone().unwrap_or(task.platform),
                update.reward.unwrap_or(task.reward),
                update.is_active.unwrap_or(task.is_active),
                id,
            ],
        )?;

        task_by_id_inner(&conn, id)?.ok_or(LedgerError::TaskNotFound)
    }

    pub fn delete_task(&self, id: &str) -> LedgerResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM airdrop_tasks WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(LedgerError::TaskNotFound);
        }
        Ok(())
    }

    /// (total, active) task counts.
    pub fn count_tasks(&self) -> LedgerResult<(i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM airdrop_tasks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }

    /// One-time task reward. The duplicate-claim check, the reward
    /// snapshot read, the supply reservation and the balance write are a
    /// single transaction.
    pub fn claim_task_commit(&self, user_id: &str, task_id: &str) -> LedgerResult<ClaimReceipt> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let is_blocked: bool = tx
            .query_row(
                "SELECT is_blocked FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(LedgerError::UserNotFound)?;
        if is_blocked {
            return Err(LedgerError::AccountBlocked);
        }

        let task = tx
            .query_row(
                "SELECT name, reward FROM airdrop_tasks WHERE id = ?1",
                params![task_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;
        let (task_name, reward) = task.ok_or(LedgerError::TaskNotFound)?;

        let already: bool = tx.query_row(
            "SELECT COUNT(*) FROM task_claims WHERE user_id = ?1 AND task_id = ?2",
            params![user_id, task_id],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )?;
        if already {
            return Err(LedgerError::AlreadyClaimed);
        }

        ensure_supply(&tx, &self.token)?;
        reserve_supply(&tx, &self.token.symbol, reward)?;

        tx.execute(
            "INSERT INTO task_claims (user_id, task_id, claimed_at) VALUES (?1, ?2, ?3)",
            params![user_id, task_id, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "UPDATE users SET difi_balance = difi_balance + ?1 WHERE id = ?2",
            params![reward, user_id],
        )?;

        let difi_balance: f64 = tx.query_row(
            "SELECT difi_balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        let remaining_supply = supply_record(&tx, &self.token.symbol)?.remaining();
        tx.commit()?;

        Ok(ClaimReceipt {
            task_name,
            reward,
            difi_balance,
            remaining_supply,
        })
    }

    // ========================================================================
    // PAYMENT ORDERS
    // ========================================================================

    pub fn insert_payment_order(&self, new: &NewPaymentOrder) -> LedgerResult<PaymentOrder> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO payment_orders
                (id, user_id, gateway_invoice_id, status, amount_usd, dpower_to_credit,
                 pay_currency, pay_address, pay_amount, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                new.user_id,
                new.gateway_invoice_id,
                new.status.as_str(),
                new.amount_usd,
                new.dpower_to_credit,
                new.pay_currency,
                new.pay_address,
                new.pay_amount,
                now,
            ],
        )?;
        payment_order_by_invoice_inner(&conn, &new.gateway_invoice_id)?
            .ok_or(LedgerError::OrderNotFound)
    }

    pub fn payment_order_by_invoice(
        &self,
        gateway_invoice_id: &str,
    ) -> LedgerResult<Option<PaymentOrder>> {
        let conn = self.conn.lock().unwrap();
        payment_order_by_invoice_inner(&conn, gateway_invoice_id)
    }

    /// Apply a verified gateway notification to its order.
    ///
    /// Terminal orders are the idempotence boundary: redelivery of any
    /// notification for an order already in a terminal state is a no-op.
    /// For a `finished` status, the Dpower credit and the status
    /// transition commit together; if the owning user is gone the order
    /// flips to `failed` with an audit message and nothing is credited.
    pub fn apply_payment_notification(
        &self,
        gateway_invoice_id: &str,
        reported: PaymentStatus,
        raw_payload: &str,
    ) -> LedgerResult<WebhookOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let order = tx
            .query_row(
                "SELECT id, user_id, status, dpower_to_credit FROM payment_orders
                 WHERE gateway_invoice_id = ?1",
                params![gateway_invoice_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let (order_id, user_id, current, dpower_to_credit) =
            order.ok_or(LedgerError::OrderNotFound)?;

        let current = PaymentStatus::parse(&current).ok_or(LedgerError::InvalidPayload)?;
        if current.is_terminal() {
            // Duplicate or late retry: acknowledge, change nothing.
            return Ok(WebhookOutcome::AlreadyFinal { status: current });
        }

        let now = Utc::now().to_rfc3339();

        if reported == PaymentStatus::Finished {
            let credited = tx.execute(
                "UPDATE users SET dpower_balance = dpower_balance + ?1 WHERE id = ?2",
                params![dpower_to_credit, user_id],
            )?;

            if credited == 1 {
                tx.execute(
                    "UPDATE payment_orders
                     SET status = ?1, webhook_payload = ?2, message = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![
                        PaymentStatus::Finished.as_str(),
                        raw_payload,
                        format!("Credited {} Dpower", dpower_to_credit),
                        now,
                        order_id,
                    ],
                )?;
                tx.commit()?;
                return Ok(WebhookOutcome::Credited {
                    user_id,
                    dpower_credited: dpower_to_credit,
                });
            }

            // Owning user is gone: never credit silently, flip to failed
            // and keep the payload for audit.
            warn!(
                "User {} missing for payment order {}; marking failed",
                user_id, order_id
            );
            tx.execute(
                "UPDATE payment_orders
                 SET status = ?1, webhook_payload = ?2, message = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    PaymentStatus::Failed.as_str(),
                    raw_payload,
                    "User not found. Dpower not credited.",
                    now,
                    order_id,
                ],
            )?;
            tx.commit()?;
            return Ok(WebhookOutcome::CreditFailedUserMissing);
        }

        tx.execute(
            "UPDATE payment_orders
             SET status = ?1, webhook_payload = ?2, updated_at = ?3
             WHERE id = ?4",
            params![reported.as_str(), raw_payload, now, order_id],
        )?;
        tx.commit()?;
        Ok(WebhookOutcome::StatusUpdated { status: reported })
    }
}

// ============================================================================
// ROW MAPPING + SQL HELPERS
// ============================================================================

const USER_SELECT: &str = "SELECT id, username, email, difi_balance, dpower_balance, \
     referral_code, referred_by, last_mine_at, is_admin, is_blocked, created_at FROM users";

const TASK_SELECT: &str =
    "SELECT id, name, description, link, platform, reward, is_active, created_at FROM airdrop_tasks";

const ORDER_SELECT: &str = "SELECT id, user_id, gateway_invoice_id, status, amount_usd, \
     dpower_to_credit, pay_currency, pay_address, pay_amount, webhook_payload, message, \
     created_at, updated_at FROM payment_orders";

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        difi_balance: row.get(3)?,
        dpower_balance: row.get(4)?,
        referral_code: row.get(5)?,
        referred_by: row.get(6)?,
        last_mine_at: row.get::<_, Option<String>>(7)?.map(|s| parse_ts(&s)),
        is_admin: row.get(8)?,
        is_blocked: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        link: row.get(3)?,
        platform: row.get(4)?,
        reward: row.get(5)?,
        is_active: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentOrder> {
    Ok(PaymentOrder {
        id: row.get(0)?,
        user_id: row.get(1)?,
        gateway_invoice_id: row.get(2)?,
        status: PaymentStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(PaymentStatus::Failed),
        amount_usd: row.get(4)?,
        dpower_to_credit: row.get(5)?,
        pay_currency: row.get(6)?,
        pay_address: row.get(7)?,
        pay_amount: row.get(8)?,
        webhook_payload: row.get(9)?,
        message: row.get(10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?),
        updated_at: parse_ts(&row.get::<_, String>(12)?),
    })
}

fn user_by_id_inner(conn: &Connection, id: &str) -> LedgerResult<Option<User>> {
    let user = conn
        .query_row(
            &format!("{USER_SELECT} WHERE id = ?1"),
            params![id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

fn task_by_id_inner(conn: &Connection, id: &str) -> LedgerResult<Option<Task>> {
    let task = conn
        .query_row(
            &format!("{TASK_SELECT} WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

fn payment_order_by_invoice_inner(
    conn: &Connection,
    gateway_invoice_id: &str,
) -> LedgerResult<Option<PaymentOrder>> {
    let order = conn
        .query_row(
            &format!("{ORDER_SELECT} WHERE gateway_invoice_id = ?1"),
            params![gateway_invoice_id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

/// Lazily create the singleton supply row for the configured token.
fn ensure_supply(tx: &Transaction<'_>, token: &TokenConfig) -> LedgerResult<()> {
    tx.execute(
        "INSERT OR IGNORE INTO token_supply (symbol, total_supply, circulating_supply)
         VALUES (?1, ?2, 0)",
        params![token.symbol, token.total_supply],
    )?;
    Ok(())
}

/// The conditional check-and-increment. Exactly one statement: the WHERE
/// clause rejects reservations the remaining supply cannot cover, and the
/// MIN clamp keeps circulating_supply from ever exceeding total_supply.
fn reserve_supply(tx: &Transaction<'_>, symbol: &str, amount: f64) -> LedgerResult<()> {
    let updated = tx.execute(
        "UPDATE token_supply
         SET circulating_supply = MIN(circulating_supply + ?1, total_supply)
         WHERE symbol = ?2 AND total_supply - circulating_supply >= ?1",
        params![amount, symbol],
    )?;
    if updated == 0 {
        return Err(LedgerError::SupplyExhausted);
    }
    Ok(())
}

fn supply_record(tx: &Transaction<'_>, symbol: &str) -> LedgerResult<SupplyRecord> {
    let record = tx.query_row(
        "SELECT symbol, total_supply, circulating_supply FROM token_supply WHERE symbol = ?1",
        params![symbol],
        |row| {
            Ok(SupplyRecord {
                symbol: row.get(0)?,
                total_supply: row.get(1)?,
                circulating_supply: row.get(2)?,
            })
        },
    )?;
    Ok(record)
}

fn generate_referral_code(conn: &Connection) -> LedgerResult<String> {
    loop {
        let code: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REFERRAL_CODE_LEN)
            .map(char::from)
            .collect();
        let taken: bool = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE referral_code = ?1",
            params![code],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )?;
        if !taken {
            return Ok(code);
        }
    }
}
