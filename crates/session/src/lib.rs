//! Session & account management.
//!
//! [`AccountStore`] owns the persisted account list and the active-account
//! pointer. Operations that need credentials take a [`SessionContext`]
//! snapshot instead of reading shared state, so a transfer keeps the
//! credentials it started with even if the active account changes.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use pcs_protocol::AuthTriplet;
use pcs_remote::{RemoteError, RemoteService};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("account not found: {0}")]
    NotFound(u64),

    #[error("no active account")]
    NoActiveAccount,

    #[error("credentials are missing the BDUSS token")]
    MissingToken,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An authenticated identity.
///
/// `uid == 0` marks the sentinel returned by [`AccountStore::get_active`]
/// when no account is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub uid: u64,
    pub name: String,
    pub triplet: AuthTriplet,
    #[serde(default = "root_dir")]
    pub workdir: String,
}

fn root_dir() -> String {
    "/".into()
}

impl Default for Account {
    fn default() -> Self {
        Self {
            uid: 0,
            name: String::new(),
            triplet: AuthTriplet::default(),
            workdir: root_dir(),
        }
    }
}

impl Account {
    /// Returns `true` for the no-account sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.uid == 0
    }
}

/// Credentials and working directory captured for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub uid: u64,
    pub name: String,
    pub auth: AuthTriplet,
    pub workdir: String,
}

impl From<&Account> for SessionContext {
    fn from(account: &Account) -> Self {
        Self {
            uid: account.uid,
            name: account.name.clone(),
            auth: account.triplet.clone(),
            workdir: account.workdir.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountList {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_uid: Option<u64>,
}

/// Persistent account list.
///
/// Every mutation is written through a temp file and renamed into place
/// while the write lock is held, so the file always holds a complete list.
pub struct AccountStore {
    path: Option<PathBuf>,
    state: RwLock<AccountList>,
}

impl AccountStore {
    /// Opens the store at `path`, loading existing accounts.
    pub fn open(path: PathBuf) -> Result<Self, SessionError> {
        let state = load_accounts(&path)?;
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(AccountList::default()),
        }
    }

    /// Resolves the identity behind `triplet` and inserts or updates the
    /// matching account. The active account is left unchanged.
    pub async fn add_or_update_account(
        &self,
        remote: &dyn RemoteService,
        triplet: AuthTriplet,
    ) -> Result<Account, SessionError> {
        if triplet.is_empty() {
            return Err(SessionError::MissingToken);
        }
        let identity = remote.authenticate(&triplet).await?;

        self.mutate(|list| {
            let account = match list.accounts.iter_mut().find(|a| a.uid == identity.uid) {
                Some(existing) => {
                    existing.name = identity.name.clone();
                    existing.triplet = triplet;
                    existing.clone()
                }
                None => {
                    let account = Account {
                        uid: identity.uid,
                        name: identity.name.clone(),
                        triplet,
                        workdir: root_dir(),
                    };
                    list.accounts.push(account.clone());
                    account
                }
            };
            info!(uid = account.uid, name = %account.name, "account stored");
            Ok(account)
        })
    }

    /// Makes `uid` the active account.
    pub fn set_active(&self, uid: u64) -> Result<(), SessionError> {
        self.mutate(|list| {
            if !list.accounts.iter().any(|a| a.uid == uid) {
                return Err(SessionError::NotFound(uid));
            }
            list.active_uid = Some(uid);
            info!(uid, "active account changed");
            Ok(())
        })
    }

    /// Returns the active account, or the sentinel when none is active.
    pub fn get_active(&self) -> Account {
        let list = self.state.read().unwrap();
        list.active_uid
            .and_then(|uid| list.accounts.iter().find(|a| a.uid == uid))
            .cloned()
            .unwrap_or_default()
    }

    /// Removes an account. Clears the active pointer if it pointed there.
    pub fn remove_account(&self, uid: u64) -> Result<Account, SessionError> {
        self.mutate(|list| {
            let pos = list
                .accounts
                .iter()
                .position(|a| a.uid == uid)
                .ok_or(SessionError::NotFound(uid))?;
            let removed = list.accounts.remove(pos);
            if list.active_uid == Some(uid) {
                list.active_uid = None;
            }
            info!(uid, "account removed");
            Ok(removed)
        })
    }

    /// All accounts in insertion order.
    pub fn accounts(&self) -> Vec<Account> {
        self.state.read().unwrap().accounts.clone()
    }

    pub fn active_uid(&self) -> Option<u64> {
        self.state.read().unwrap().active_uid
    }

    /// Account at `index` in [`accounts`](Self::accounts) order.
    pub fn account_at(&self, index: usize) -> Option<Account> {
        self.state.read().unwrap().accounts.get(index).cloned()
    }

    /// Changes an account's remote working directory.
    pub fn set_workdir(&self, uid: u64, workdir: &str) -> Result<(), SessionError> {
        let workdir = pcs_protocol::path::normalize(workdir);
        self.mutate(|list| {
            let account = find_mut(list, uid)?;
            account.workdir = workdir;
            Ok(())
        })
    }

    /// Replaces an account's credentials after a refresh.
    pub fn update_triplet(&self, uid: u64, triplet: AuthTriplet) -> Result<(), SessionError> {
        self.mutate(|list| {
            let account = find_mut(list, uid)?;
            account.triplet = triplet;
            Ok(())
        })
    }

    /// Captures the active account's credentials.
    pub fn context(&self) -> Result<SessionContext, SessionError> {
        let active = self.get_active();
        if active.is_sentinel() {
            return Err(SessionError::NoActiveAccount);
        }
        Ok(SessionContext::from(&active))
    }

    /// Applies `f` under the write lock and persists the result if it
    /// succeeded.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut AccountList) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut list = self.state.write().unwrap();
        let out = f(&mut list)?;
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&*list)?;
            pcs_config::write_atomic(path, json.as_bytes())?;
            debug!("persisted {} account(s) to {:?}", list.accounts.len(), path);
        }
        Ok(out)
    }
}

fn find_mut(list: &mut AccountList, uid: u64) -> Result<&mut Account, SessionError> {
    list.accounts
        .iter_mut()
        .find(|a| a.uid == uid)
        .ok_or(SessionError::NotFound(uid))
}

/// Loads the account list from disk.
fn load_accounts(path: &Path) -> Result<AccountList, SessionError> {
    if !path.exists() {
        return Ok(AccountList::default());
    }
    let data = std::fs::read_to_string(path)?;
    let list: AccountList = serde_json::from_str(&data)?;
    debug!("loaded {} account(s) from {:?}", list.accounts.len(), path);
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcs_remote::memory::MemoryRemote;

    fn remote() -> MemoryRemote {
        let r = MemoryRemote::new();
        r.register_account("tok-a", 100, "alice");
        r.register_account("tok-b", 200, "bob");
        r
    }

    fn triplet(bduss: &str) -> AuthTriplet {
        AuthTriplet::new(bduss, "p", "s")
    }

    #[tokio::test]
    async fn add_does_not_change_active() {
        let store = AccountStore::in_memory();
        let r = remote();

        let a = store.add_or_update_account(&r, triplet("tok-a")).await.unwrap();
        assert_eq!(a.uid, 100);
        assert_eq!(a.workdir, "/");
        assert!(store.get_active().is_sentinel());

        store.set_active(100).unwrap();
        store.add_or_update_account(&r, triplet("tok-b")).await.unwrap();
        assert_eq!(store.get_active().uid, 100);
    }

    #[tokio::test]
    async fn update_keeps_workdir() {
        let store = AccountStore::in_memory();
        let r = remote();
        store.add_or_update_account(&r, triplet("tok-a")).await.unwrap();
        store.set_workdir(100, "/music/").unwrap();

        let updated = store
            .add_or_update_account(&r, AuthTriplet::new("tok-a", "p2", "s2"))
            .await
            .unwrap();
        assert_eq!(updated.workdir, "/music");
        assert_eq!(updated.triplet.ptoken, "p2");
        assert_eq!(store.accounts().len(), 1);
    }

    #[tokio::test]
    async fn rejected_triplet_is_auth_error() {
        let store = AccountStore::in_memory();
        let err = store
            .add_or_update_account(&remote(), triplet("bogus"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Remote(e) if e.is_auth()));
        assert!(store.accounts().is_empty());
    }

    #[tokio::test]
    async fn empty_triplet_rejected_before_remote_call() {
        let store = AccountStore::in_memory();
        let err = store
            .add_or_update_account(&remote(), AuthTriplet::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingToken));
    }

    #[test]
    fn set_active_unknown_account() {
        let store = AccountStore::in_memory();
        assert!(matches!(store.set_active(5), Err(SessionError::NotFound(5))));
    }

    #[tokio::test]
    async fn removing_active_clears_pointer() {
        let store = AccountStore::in_memory();
        let r = remote();
        store.add_or_update_account(&r, triplet("tok-a")).await.unwrap();
        store.add_or_update_account(&r, triplet("tok-b")).await.unwrap();
        store.set_active(200).unwrap();

        store.remove_account(100).unwrap();
        assert_eq!(store.get_active().uid, 200);

        store.remove_account(200).unwrap();
        assert!(store.get_active().is_sentinel());
        assert!(matches!(store.context(), Err(SessionError::NoActiveAccount)));
        assert!(matches!(
            store.remove_account(200),
            Err(SessionError::NotFound(200))
        ));
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("accounts.json");
        let r = remote();

        {
            let store = AccountStore::open(path.clone()).unwrap();
            store.add_or_update_account(&r, triplet("tok-a")).await.unwrap();
            store.add_or_update_account(&r, triplet("tok-b")).await.unwrap();
            store.set_active(200).unwrap();
            store.set_workdir(200, "/photos").unwrap();
        }

        let store = AccountStore::open(path.clone()).unwrap();
        let uids: Vec<u64> = store.accounts().iter().map(|a| a.uid).collect();
        assert_eq!(uids, vec![100, 200]);
        let ctx = store.context().unwrap();
        assert_eq!(ctx.uid, 200);
        assert_eq!(ctx.workdir, "/photos");
        assert_eq!(ctx.auth.bduss, "tok-b");
        assert!(!tmp.path().join("accounts.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("accounts.json");
        std::fs::write(&path, "[[[").unwrap();
        assert!(matches!(
            AccountStore::open(path),
            Err(SessionError::Json(_))
        ));
    }

    #[tokio::test]
    async fn context_is_a_snapshot() {
        let store = AccountStore::in_memory();
        let r = remote();
        store.add_or_update_account(&r, triplet("tok-a")).await.unwrap();
        store.set_active(100).unwrap();

        let ctx = store.context().unwrap();
        store.update_triplet(100, triplet("tok-new")).unwrap();
        assert_eq!(ctx.auth.bduss, "tok-a");
        assert_eq!(store.context().unwrap().auth.bduss, "tok-new");
    }

    #[test]
    fn account_at_index() {
        let store = AccountStore::in_memory();
        assert!(store.account_at(0).is_none());
    }
}
