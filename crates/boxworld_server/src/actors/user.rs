//! User accounts: display name and currency balance.

use crate::host::{Actor, Services, state_key};
use crate::store::PersistentState;
use crate::EngineError;
use async_trait::async_trait;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME: usize = 32;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountRecord {
    display_name: Option<String>,
    balance: i64,
}

/// A user's public balance record, published on `User:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct Balance {
    user_id: String,
    display_name: Option<String>,
    balance: i64,
}

/// One user's account.
#[derive(Debug)]
pub struct UserAccount {
    user_id: String,
    state: PersistentState<AccountRecord>,
}

#[async_trait]
impl Actor for UserAccount {
    type Key = String;
    const KIND: &'static str = "User";

    async fn activate(key: &String, services: &Services) -> Result<Self, EngineError> {
        if key.trim().is_empty() {
            return Err(EngineError::validation("user id is empty"));
        }
        let state =
            PersistentState::load(Arc::clone(services.store()), state_key(Self::KIND, key)).await?;
        Ok(Self {
            user_id: key.clone(),
            state,
        })
    }
}

impl UserAccount {
    /// Current balance record.
    pub fn balance(&self) -> Balance {
        let record = self.state.get();
        Balance {
            user_id: self.user_id.clone(),
            display_name: record.display_name.clone(),
            balance: record.balance,
        }
    }

    /// Adds `amount` (which may be negative) to the balance.
    ///
    /// # Errors
    ///
    /// Validation error if the balance would overflow or go negative.
    #[instrument(skip(self), fields(user = %self.user_id))]
    pub async fn add_currency(&mut self, amount: i64) -> Result<Balance, EngineError> {
        let mut next = self.state.get().clone();
        next.balance = next
            .balance
            .checked_add(amount)
            .filter(|b| *b >= 0)
            .ok_or_else(|| EngineError::validation(format!("cannot add {} to balance", amount)))?;
        self.state.write(next).await?;
        debug!(balance = self.state.get().balance, "Balance updated");
        Ok(self.balance())
    }

    /// Sets the display name, trimmed.
    ///
    /// # Errors
    ///
    /// Validation error for an empty or overlong name.
    #[instrument(skip(self), fields(user = %self.user_id))]
    pub async fn set_display_name(&mut self, name: &str) -> Result<Balance, EngineError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_DISPLAY_NAME {
            return Err(EngineError::validation(format!(
                "display name must be 1..={} characters",
                MAX_DISPLAY_NAME
            )));
        }
        let mut next = self.state.get().clone();
        next.display_name = Some(name.to_string());
        self.state.write(next).await?;
        Ok(self.balance())
    }
}
