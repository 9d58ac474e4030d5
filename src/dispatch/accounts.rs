//! Account pairing, status queries, and group discovery.

use crate::connection::AccountConnection;
use crate::error::{Error, Result};
use crate::reconnect::ReconnectSupervisor;
use crate::transport::AccountCredentials;
use crate::types::{AccountId, AccountStatus, ConnectionState, Event, GroupInfo, OwnerId};

use super::{AccountEntry, BulkSender};

impl BulkSender {
    /// Pair a messaging account and bring its connection up
    ///
    /// Creates the connection for `account_id`, registers it under `owner_id`,
    /// and performs the initial connect. Pairing is idempotent for the same
    /// owner: repeated calls reconnect a dropped connection instead of
    /// creating a second one. An account stuck in `AuthFailed` is replaced
    /// with a fresh connection built from the supplied credentials -- that is
    /// the re-pairing path.
    ///
    /// # Errors
    ///
    /// - [`Error::Forbidden`] if the account is already paired by another owner
    /// - [`Error::Transport`] if the initial connect fails (the entry stays
    ///   registered; calling again retries)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use bulksend::{AccountCredentials, BulkSender, Config, InMemoryTransport};
    /// # use std::sync::Arc;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let sender = BulkSender::new(Config::default(), Arc::new(InMemoryTransport::new()));
    /// let status = sender
    ///     .pair_account(
    ///         "user-1".into(),
    ///         "acct-1".into(),
    ///         AccountCredentials::new(serde_json::json!({"session": "..."})),
    ///     )
    ///     .await?;
    /// println!("paired: {:?}", status.state);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn pair_account(
        &self,
        owner_id: OwnerId,
        account_id: AccountId,
        credentials: AccountCredentials,
    ) -> Result<AccountStatus> {
        let (connection, freshly_registered) = {
            let mut entries = self.accounts.entries.lock().await;
            match entries.get(&account_id) {
                Some(entry) if entry.connection.owner_id() != &owner_id => {
                    return Err(Error::Forbidden {
                        resource: format!("account {account_id}"),
                    });
                }
                Some(entry) if entry.connection.state() == ConnectionState::AuthFailed => {
                    // Re-pairing: the old session is dead, build a new one
                    let fresh = self.build_account_entry(&owner_id, &account_id, credentials);
                    let connection = fresh.connection.clone();
                    let replaced = entries.insert(account_id.clone(), fresh);
                    drop(entries);
                    if let Some(old) = replaced {
                        old.lifecycle.cancel();
                        old.connection.disconnect().await;
                    }
                    (connection, true)
                }
                Some(entry) => (entry.connection.clone(), false),
                None => {
                    let entry = self.build_account_entry(&owner_id, &account_id, credentials);
                    let connection = entry.connection.clone();
                    entries.insert(account_id.clone(), entry);
                    (connection, true)
                }
            }
        };

        connection.connect().await?;

        if freshly_registered {
            self.emit_event(Event::AccountPaired {
                account: account_id,
            });
        }
        Ok(connection.status())
    }

    /// Unpair an account: tear down its connection and stop its tasks
    ///
    /// Running tasks addressed to this account receive a stop request; they
    /// finish as `Stopped`. The connection's listener and any reconnect cycle
    /// are cancelled with it.
    pub async fn unpair_account(&self, owner_id: OwnerId, account_id: AccountId) -> Result<()> {
        let entry = {
            let mut entries = self.accounts.entries.lock().await;
            match entries.get(&account_id) {
                Some(entry) if entry.connection.owner_id() != &owner_id => {
                    return Err(Error::Forbidden {
                        resource: format!("account {account_id}"),
                    });
                }
                Some(_) => entries.remove(&account_id),
                None => {
                    return Err(Error::NotFound(format!(
                        "account {account_id} is not paired"
                    )));
                }
            }
        };

        if let Some(entry) = entry {
            entry.lifecycle.cancel();
            entry.connection.disconnect().await;
        }

        // Tasks still addressed to the removed account cannot make progress
        let tasks: Vec<_> = {
            let tasks = self.tasks.tasks.lock().await;
            tasks
                .values()
                .filter(|task| task.account_id() == &account_id)
                .cloned()
                .collect()
        };
        for task in tasks {
            if task.request_stop().await {
                tracing::info!(
                    task_id = task.task_id().get(),
                    account = %account_id,
                    "stopped task because its account was unpaired"
                );
            }
        }

        self.emit_event(Event::AccountRemoved {
            account: account_id,
        });
        Ok(())
    }

    /// Connection state and health counters for one paired account
    pub async fn account_status(
        &self,
        owner_id: OwnerId,
        account_id: AccountId,
    ) -> Result<AccountStatus> {
        let entry = self.account_entry(&owner_id, &account_id).await?;
        Ok(entry.connection.status())
    }

    /// All accounts paired by this owner, sorted by account id
    pub async fn list_accounts(&self, owner_id: OwnerId) -> Vec<AccountStatus> {
        let entries = self.accounts.entries.lock().await;
        let mut statuses: Vec<AccountStatus> = entries
            .values()
            .filter(|entry| entry.connection.owner_id() == &owner_id)
            .map(|entry| entry.connection.status())
            .collect();
        statuses.sort_by(|a, b| a.account_id.as_str().cmp(b.account_id.as_str()));
        statuses
    }

    /// Groups the account participates in
    ///
    /// Requires a live connection; returns [`Error::NotConnected`] otherwise.
    pub async fn list_groups(
        &self,
        owner_id: OwnerId,
        account_id: AccountId,
    ) -> Result<Vec<GroupInfo>> {
        let entry = self.account_entry(&owner_id, &account_id).await?;
        entry.connection.list_groups().await
    }

    /// Owner-checked account lookup. Ownership is verified before existence
    /// is revealed: a mismatched owner sees `Forbidden`, never the entry.
    pub(crate) async fn account_entry(
        &self,
        owner_id: &OwnerId,
        account_id: &AccountId,
    ) -> Result<AccountEntry> {
        let entries = self.accounts.entries.lock().await;
        match entries.get(account_id) {
            Some(entry) if entry.connection.owner_id() != owner_id => Err(Error::Forbidden {
                resource: format!("account {account_id}"),
            }),
            Some(entry) => Ok(entry.clone()),
            None => Err(Error::NotFound(format!(
                "account {account_id} is not paired"
            ))),
        }
    }

    /// Construct the connection plus supervisor for a new pairing. The
    /// entry's lifecycle token parents the listener and reconnect cycles so
    /// unpair and shutdown cancel them together.
    fn build_account_entry(
        &self,
        owner_id: &OwnerId,
        account_id: &AccountId,
        credentials: AccountCredentials,
    ) -> AccountEntry {
        let lifecycle = self.shutdown.child_token();
        let connection = AccountConnection::new(
            account_id.clone(),
            owner_id.clone(),
            std::sync::Arc::clone(&self.transport),
            credentials,
            &self.config,
            self.event_tx.clone(),
            lifecycle.clone(),
        );
        let supervisor = ReconnectSupervisor::new(
            connection.clone(),
            self.config.reconnect.clone(),
            self.event_tx.clone(),
            lifecycle.clone(),
        );
        AccountEntry {
            connection,
            supervisor,
            lifecycle,
        }
    }
}
