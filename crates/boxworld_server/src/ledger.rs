//! The user ledger collaborator.

use crate::actors::{Balance, UserAccount};
use crate::host::ActorHost;
use crate::pubsub::{PubSubHub, Topic, TopicKind};
use crate::EngineError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Currency and display names per user.
#[async_trait]
pub trait UserLedger: Send + Sync + std::fmt::Debug {
    /// Adds `amount` to the user's balance.
    async fn add_currency(&self, user_id: &str, amount: i64) -> Result<Balance, EngineError>;

    /// Reads the user's balance.
    async fn get_balance(&self, user_id: &str) -> Result<Balance, EngineError>;

    /// Renames the user.
    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<Balance, EngineError>;
}

/// Ledger backed by one [`UserAccount`] actor per user.
///
/// Every change is published on `User:<id>`.
#[derive(Debug)]
pub struct AccountLedger {
    accounts: ActorHost<UserAccount>,
    hub: Arc<PubSubHub>,
}

impl AccountLedger {
    /// Creates a ledger over `accounts`.
    pub fn new(accounts: ActorHost<UserAccount>, hub: Arc<PubSubHub>) -> Self {
        Self { accounts, hub }
    }

    /// Hosted accounts, for idle sweeping.
    pub fn accounts(&self) -> &ActorHost<UserAccount> {
        &self.accounts
    }

    fn publish(&self, balance: &Balance) {
        let topic = Topic::new(TopicKind::User, balance.user_id());
        if let Err(e) = self.hub.publish(&topic, balance) {
            warn!(error = %e, "Failed to publish balance");
        }
    }
}

#[async_trait]
impl UserLedger for AccountLedger {
    #[instrument(skip(self))]
    async fn add_currency(&self, user_id: &str, amount: i64) -> Result<Balance, EngineError> {
        let balance = self
            .accounts
            .get(&user_id.to_string())
            .await?
            .add_currency(amount)
            .await?;
        self.publish(&balance);
        Ok(balance)
    }

    #[instrument(skip(self))]
    async fn get_balance(&self, user_id: &str) -> Result<Balance, EngineError> {
        Ok(self.accounts.get(&user_id.to_string()).await?.balance())
    }

    #[instrument(skip(self))]
    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<Balance, EngineError> {
        let balance = self
            .accounts
            .get(&user_id.to_string())
            .await?
            .set_display_name(name)
            .await?;
        self.publish(&balance);
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::test_services;

    #[tokio::test]
    async fn test_changes_are_published() {
        let services = test_services();
        let accounts = ActorHost::new(Arc::clone(&services));
        let ledger = AccountLedger::new(accounts, Arc::clone(services.hub()));
        let mut rx = services.hub().subscribe(&Topic::new(TopicKind::User, "u1")).unwrap();

        ledger.add_currency("u1", 5).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got["balance"], 5);
        assert_eq!(got["user_id"], "u1");

        ledger.set_display_name("u1", "Ada").await.unwrap();
        assert_eq!(rx.recv().await.unwrap()["display_name"], "Ada");
        assert_eq!(*ledger.get_balance("u1").await.unwrap().balance(), 5);
    }
}
