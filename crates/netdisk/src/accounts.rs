//! Account commands.

use pcs_protocol::AuthTriplet;
use pcs_session::{Account, SessionContext};
use tracing::info;

use crate::{AccountSummary, Netdisk, NetdiskError};

impl Netdisk {
    /// Stores the account behind `triplet`. It becomes active only when no
    /// account is active yet.
    pub async fn login(&self, triplet: AuthTriplet) -> Result<Account, NetdiskError> {
        let account = self
            .accounts
            .add_or_update_account(self.remote.as_ref(), triplet)
            .await?;
        if self.accounts.active_uid().is_none() {
            self.accounts.set_active(account.uid)?;
        }
        info!(uid = account.uid, name = %account.name, "logged in");
        Ok(account)
    }

    /// Makes `uid` the active account.
    pub fn switch_account(&self, uid: u64) -> Result<Account, NetdiskError> {
        self.accounts.set_active(uid)?;
        Ok(self.accounts.get_active())
    }

    /// Makes the account at `index` of [`accounts`](Self::accounts) active.
    pub fn switch_account_by_index(&self, index: usize) -> Result<Account, NetdiskError> {
        let account = self
            .accounts
            .account_at(index)
            .ok_or_else(|| NetdiskError::InvalidArgument(format!("no account at index {index}")))?;
        self.switch_account(account.uid)
    }

    /// Removes the active account and drops its cached listings. No account
    /// is active afterwards.
    pub async fn logout(&self) -> Result<Account, NetdiskError> {
        let ctx = self.context()?;
        let removed = self.accounts.remove_account(ctx.uid)?;
        self.cache.invalidate_subtree(ctx.uid, "/").await;
        info!(uid = removed.uid, "logged out");
        Ok(removed)
    }

    /// All stored accounts, marking the active one.
    pub fn accounts(&self) -> Vec<AccountSummary> {
        let active = self.accounts.active_uid();
        self.accounts
            .accounts()
            .into_iter()
            .enumerate()
            .map(|(index, account)| AccountSummary {
                index,
                active: Some(account.uid) == active,
                account,
            })
            .collect()
    }

    /// The active account, or the sentinel (`uid == 0`) when there is none.
    pub fn active_account(&self) -> Account {
        self.accounts.get_active()
    }

    /// Credentials and working directory of the active account.
    pub(crate) fn context(&self) -> Result<SessionContext, NetdiskError> {
        Ok(self.accounts.context()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::*;
    use pcs_remote::RemoteError;
    use pcs_session::SessionError;

    use crate::NetdiskError;

    #[tokio::test]
    async fn first_login_becomes_active() {
        let fx = Fixture::new();
        assert!(fx.disk.active_account().is_sentinel());

        let alice = fx.disk.login(alice()).await.unwrap();
        assert_eq!(alice.uid, 1);
        assert_eq!(fx.disk.active_account().uid, 1);

        fx.disk.login(bob()).await.unwrap();
        assert_eq!(fx.disk.active_account().uid, 1);

        let list = fx.disk.accounts();
        assert_eq!(list.len(), 2);
        assert!(list[0].active);
        assert!(!list[1].active);
        assert_eq!(list[1].account.name, "bob");
    }

    #[tokio::test]
    async fn switching_accounts() {
        let fx = Fixture::logged_in().await;
        fx.disk.login(bob()).await.unwrap();

        assert_eq!(fx.disk.switch_account(2).unwrap().name, "bob");
        assert_eq!(fx.disk.switch_account_by_index(0).unwrap().name, "alice");
        assert!(matches!(
            fx.disk.switch_account(99),
            Err(NetdiskError::Session(SessionError::NotFound(99)))
        ));
        assert!(matches!(
            fx.disk.switch_account_by_index(5),
            Err(NetdiskError::InvalidArgument(_))
        ));
        assert_eq!(fx.disk.active_account().uid, 1);
    }

    #[tokio::test]
    async fn logout_clears_active_account() {
        let fx = Fixture::logged_in().await;
        let removed = fx.disk.logout().await.unwrap();
        assert_eq!(removed.uid, 1);
        assert!(fx.disk.active_account().is_sentinel());
        assert!(fx.disk.accounts().is_empty());
        assert!(matches!(
            fx.disk.pwd(),
            Err(NetdiskError::Session(SessionError::NoActiveAccount))
        ));
        assert!(matches!(
            fx.disk.logout().await,
            Err(NetdiskError::Session(SessionError::NoActiveAccount))
        ));
    }

    #[tokio::test]
    async fn rejected_credentials_are_reported_as_auth() {
        let fx = Fixture::new();
        let err = fx
            .disk
            .login(pcs_protocol::AuthTriplet::new("bogus", "", ""))
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert!(matches!(err.remote(), Some(RemoteError::Auth(_))));
        assert!(fx.disk.accounts().is_empty());
    }

    #[tokio::test]
    async fn relogin_refreshes_credentials() {
        let fx = Fixture::logged_in().await;
        let refreshed = pcs_protocol::AuthTriplet::new("alice-token", "p2", "s2");
        fx.disk.login(refreshed.clone()).await.unwrap();

        let list = fx.disk.accounts();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].account.triplet, refreshed);
    }
}
