// Entitlement store
//
// Durable SQLite repository of accounts, balances, referral edges, payment
// requests, and subscription tokens. This layer is the single source of
// truth for money and token existence: payment status transitions are
// guarded in SQL so concurrent writers can never double-credit, and debits
// are one conditional UPDATE so a balance can never go negative.

use serde::Serialize;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::money::Amount;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
  user_id TEXT PRIMARY KEY,
  balance INTEGER NOT NULL DEFAULT 0,
  referrer_id TEXT
);

CREATE TABLE IF NOT EXISTS payments (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  provider TEXT NOT NULL,
  amount INTEGER NOT NULL,
  currency TEXT NOT NULL,
  status INTEGER NOT NULL DEFAULT 0,
  pay_url TEXT NOT NULL DEFAULT '',
  plan_days INTEGER NOT NULL,
  net_amount INTEGER,
  token TEXT,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
  token TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  client_id TEXT NOT NULL,
  expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS referral_earnings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  referrer_id TEXT NOT NULL,
  referred_id TEXT NOT NULL,
  amount INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
";

/// Payment lifecycle. Transitions advance one step at a time and never
/// reverse; the guards live in the SQL statements below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Credited,
}

impl PaymentStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            PaymentStatus::Pending => 0,
            PaymentStatus::Confirmed => 1,
            PaymentStatus::Credited => 2,
        }
    }

    fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(PaymentStatus::Pending),
            1 => Ok(PaymentStatus::Confirmed),
            2 => Ok(PaymentStatus::Credited),
            other => Err(Error::PersistFailed(format!(
                "unknown payment status {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub amount: Amount,
    pub currency: String,
    pub status: PaymentStatus,
    pub pay_url: String,
    pub plan_days: i64,
    pub net_amount: Option<Amount>,
    pub token: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub token: String,
    pub user_id: String,
    pub client_id: String,
    pub expires_at: i64,
}

/// Outcome of the conditional credit. Exactly one caller per payment ever
/// observes `Credited`; everyone else racing on the same id gets
/// `AlreadyCredited` and must not apply side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited,
    AlreadyCredited,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReferralStats {
    pub count: i64,
    pub total: Amount,
}

#[derive(Clone)]
pub struct EntitlementStore {
    pool: SqlitePool,
}

impl EntitlementStore {
    /// Open (or create) the database and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        // Each connection to an in-memory database is a separate database,
        // so those pools are pinned to a single connection.
        let pool = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect(url)
                .await?
        } else {
            SqlitePool::connect(url).await?
        };
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // ---- accounts ----

    /// Idempotent account creation. The referrer binds on first contact
    /// only; later calls never overwrite it. Self-referrals are dropped.
    pub async fn ensure_account(&self, user_id: &str, referrer: Option<&str>) -> Result<()> {
        let referrer = referrer.filter(|r| *r != user_id);
        sqlx::query(
            "INSERT INTO accounts (user_id, balance, referrer_id) VALUES (?, 0, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(referrer)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn balance(&self, user_id: &str) -> Result<Amount> {
        let row = sqlx::query("SELECT balance FROM accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.get::<i64, _>(0)),
            None => Err(Error::NotFound("account")),
        }
    }

    pub async fn referrer(&self, user_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT referrer_id FROM accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>(0)))
    }

    pub async fn credit_balance(&self, user_id: &str, amount: Amount) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET balance = balance + ? WHERE user_id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("account"));
        }
        Ok(())
    }

    /// Strict debit: a single guarded UPDATE, so concurrent debits can
    /// neither lose updates nor take the balance negative.
    pub async fn debit_balance(&self, user_id: &str, amount: Amount) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = balance - ? WHERE user_id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let balance = self.balance(user_id).await?;
        Err(Error::InsufficientFunds {
            balance,
            required: amount,
        })
    }

    // ---- payments ----

    /// Upsert by payment id. Re-recording with the same or an earlier
    /// status is a no-op; only a one-step-later status is applied, which
    /// enforces the pending -> confirmed -> credited table in storage.
    pub async fn record_payment(&self, request: &PaymentRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO payments (id, user_id, provider, amount, currency, status, pay_url, plan_days, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status
             WHERE excluded.status = payments.status + 1",
        )
        .bind(&request.id)
        .bind(&request.user_id)
        .bind(&request.provider)
        .bind(request.amount)
        .bind(&request.currency)
        .bind(request.status.as_i64())
        .bind(&request.pay_url)
        .bind(request.plan_days)
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn payment(&self, id: &str) -> Result<Option<PaymentRequest>> {
        let row = sqlx::query(
            "SELECT id, user_id, provider, amount, currency, status, pay_url, plan_days,
                    net_amount, token, created_at
             FROM payments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(payment_from_row).transpose()
    }

    /// Advance pending -> confirmed. A payment already past pending is left
    /// untouched.
    pub async fn confirm_payment(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE payments SET status = ? WHERE id = ? AND status = ?")
            .bind(PaymentStatus::Confirmed.as_i64())
            .bind(id)
            .bind(PaymentStatus::Pending.as_i64())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 && self.payment(id).await?.is_none() {
            return Err(Error::NotFound("payment"));
        }
        Ok(())
    }

    /// Atomic credit: one transaction carrying the confirmed -> credited
    /// compare-and-set plus the balance credit. Racing callers observe the
    /// status already advanced and get `AlreadyCredited` with no side
    /// effects.
    pub async fn credit_payment(&self, id: &str, net: Amount) -> Result<CreditOutcome> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE payments SET status = ?, net_amount = ? WHERE id = ? AND status = ?",
        )
        .bind(PaymentStatus::Credited.as_i64())
        .bind(net)
        .bind(id)
        .bind(PaymentStatus::Confirmed.as_i64())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.payment(id).await? {
                Some(payment) if payment.status == PaymentStatus::Credited => {
                    Ok(CreditOutcome::AlreadyCredited)
                }
                Some(payment) => Err(Error::PersistFailed(format!(
                    "payment {id} cannot be credited from status {:?}",
                    payment.status
                ))),
                None => Err(Error::NotFound("payment")),
            };
        }

        let row = sqlx::query("SELECT user_id FROM payments WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let user_id: String = row.get(0);
        sqlx::query("UPDATE accounts SET balance = balance + ? WHERE user_id = ?")
            .bind(net)
            .bind(&user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CreditOutcome::Credited)
    }

    /// Remember which token a credited payment produced. A NULL here is the
    /// marker the recovery pass looks for.
    pub async fn mark_payment_issued(&self, id: &str, token: &str) -> Result<()> {
        sqlx::query("UPDATE payments SET token = ? WHERE id = ?")
            .bind(token)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Credited payments that never produced a subscription token, e.g.
    /// because the process died between crediting and issuing.
    pub async fn credited_without_token(&self) -> Result<Vec<PaymentRequest>> {
        let rows = sqlx::query(
            "SELECT id, user_id, provider, amount, currency, status, pay_url, plan_days,
                    net_amount, token, created_at
             FROM payments WHERE status = ? AND token IS NULL",
        )
        .bind(PaymentStatus::Credited.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| payment_from_row(row)).collect()
    }

    // ---- subscriptions ----

    pub async fn insert_subscription(&self, sub: &Subscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions (token, user_id, client_id, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&sub.token)
        .bind(&sub.user_id)
        .bind(&sub.client_id)
        .bind(sub.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn subscription(&self, token: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT token, user_id, client_id, expires_at FROM subscriptions WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Subscription {
            token: row.get(0),
            user_id: row.get(1),
            client_id: row.get(2),
            expires_at: row.get(3),
        }))
    }

    pub async fn delete_subscription(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM subscriptions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn expired_subscriptions(&self, now: i64) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            "SELECT token, user_id, client_id, expires_at FROM subscriptions WHERE expires_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Subscription {
                token: row.get(0),
                user_id: row.get(1),
                client_id: row.get(2),
                expires_at: row.get(3),
            })
            .collect())
    }

    // ---- referrals ----

    pub async fn append_referral_earning(
        &self,
        referrer_id: &str,
        referred_id: &str,
        amount: Amount,
        created_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO referral_earnings (referrer_id, referred_id, amount, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(referrer_id)
        .bind(referred_id)
        .bind(amount)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn referral_stats(&self, user_id: &str) -> Result<ReferralStats> {
        let row = sqlx::query(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM referral_earnings WHERE referrer_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ReferralStats {
            count: row.get(0),
            total: row.get(1),
        })
    }
}

fn payment_from_row(row: SqliteRow) -> Result<PaymentRequest> {
    Ok(PaymentRequest {
        id: row.get(0),
        user_id: row.get(1),
        provider: row.get(2),
        amount: row.get(3),
        currency: row.get(4),
        status: PaymentStatus::from_i64(row.get(5))?,
        pay_url: row.get(6),
        plan_days: row.get(7),
        net_amount: row.get(8),
        token: row.get(9),
        created_at: row.get(10),
    })
}
