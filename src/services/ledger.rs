use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::queries;

/// Outcome of a debit attempt. Insufficiency is a business result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debit {
    Applied { remaining: i64 },
    Insufficient,
}

impl Debit {
    pub fn is_applied(&self) -> bool {
        matches!(self, Debit::Applied { .. })
    }
}

/// Per-workspace prepaid verification credits.
///
/// Implementations must serialize debits against one balance so that two
/// callers racing for the last credit cannot both succeed, and a rejected
/// debit must leave the balance untouched.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn debit(&self, workspace_id: Uuid, amount: i64) -> Result<Debit, LedgerError>;

    async fn balance(&self, workspace_id: Uuid) -> Result<i64, LedgerError>;

    /// Add credits (top-ups from the billing side).
    async fn grant(&self, workspace_id: Uuid, amount: i64) -> Result<i64, LedgerError>;
}

/// Ledger backed by the `workspace_credits` table.
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn debit(&self, workspace_id: Uuid, amount: i64) -> Result<Debit, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let remaining = queries::debit_credits(&self.pool, workspace_id, amount).await?;
        Ok(match remaining {
            Some(remaining) => Debit::Applied { remaining },
            None => Debit::Insufficient,
        })
    }

    async fn balance(&self, workspace_id: Uuid) -> Result<i64, LedgerError> {
        Ok(queries::credit_balance(&self.pool, workspace_id).await?)
    }

    async fn grant(&self, workspace_id: Uuid, amount: i64) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        Ok(queries::grant_credits(&self.pool, workspace_id, amount).await?)
    }
}

/// In-process ledger; the mutex serializes every balance change.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    balances: Mutex<HashMap<Uuid, i64>>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(workspace_id: Uuid, balance: i64) -> Self {
        let mut balances = HashMap::new();
        balances.insert(workspace_id, balance);
        Self {
            balances: Mutex::new(balances),
        }
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn debit(&self, workspace_id: Uuid, amount: i64) -> Result<Debit, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut balances = self.balances.lock().await;
        match balances.get_mut(&workspace_id) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                Ok(Debit::Applied { remaining: *balance })
            }
            _ => Ok(Debit::Insufficient),
        }
    }

    async fn balance(&self, workspace_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self.balances.lock().await.get(&workspace_id).copied().unwrap_or(0))
    }

    async fn grant(&self, workspace_id: Uuid, amount: i64) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut balances = self.balances.lock().await;
        let balance = balances.entry(workspace_id).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Credit amount must be positive, got {0}")]
    InvalidAmount(i64),
}
