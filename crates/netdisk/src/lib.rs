//! Netdisk client core.
//!
//! [`Netdisk`] wires the pieces together and exposes the user-level
//! operations:
//!
//! 1. **Accounts**: login, switch, logout, list
//! 2. **Namespace**: quota, pwd/cd, ls, meta, rm, mkdir, cp, mv
//! 3. **Transfers**: multi-target download and upload, rapid upload,
//!    digest computation
//!
//! Every operation captures a [`SessionContext`](pcs_session::SessionContext)
//! from the active account when it starts and uses it throughout.

mod accounts;
pub mod error;
mod namespace;
pub mod scanner;
mod transfers;
pub mod types;

use std::sync::Arc;

use pcs_config::{PcsConfig, StatePaths};
use pcs_dircache::DirCache;
use pcs_remote::{ClientOptions, PcsClient, RemoteService};
use pcs_resolver::Resolver;
use pcs_session::AccountStore;
use pcs_transfer::{DownloadEngine, ProgressTracker, ResumeStore, TransferSettings, UploadEngine};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Re-export primary types for convenience.
pub use error::NetdiskError;
pub use scanner::{LocalFile, scan_local};
pub use types::{AccountSummary, DownloadOptions, DownloadReport, FileSum, UploadReport};

/// The client: account list, directory cache, resolver and both engines
/// over one remote service.
pub struct Netdisk {
    config: PcsConfig,
    remote: Arc<dyn RemoteService>,
    accounts: AccountStore,
    cache: Arc<DirCache>,
    resolver: Resolver,
    downloads: DownloadEngine,
    uploads: UploadEngine,
    tracker: Arc<ProgressTracker>,
}

impl Netdisk {
    /// Opens the client state under `paths` against `remote`.
    ///
    /// Loads the account list and the directory cache mirror, then runs one
    /// cache garbage collection.
    pub fn open(
        config: PcsConfig,
        paths: &StatePaths,
        remote: Arc<dyn RemoteService>,
    ) -> Result<Self, NetdiskError> {
        let accounts = AccountStore::open(paths.accounts.clone())?;
        let cache = Arc::new(DirCache::with_mirror(
            Arc::clone(&remote),
            config.cache_ttl(),
            paths.dircache.clone(),
        ));
        Ok(Self::assemble(config, remote, accounts, cache, ResumeStore::new(paths.resume.clone())))
    }

    /// Opens the client against the PCS REST API, configured from `config`.
    pub fn with_client(config: PcsConfig, paths: &StatePaths) -> Result<Self, NetdiskError> {
        let client = PcsClient::new(ClientOptions {
            app_id: config.appid,
            user_agent: config.user_agent.clone(),
            ..ClientOptions::default()
        })?;
        Self::open(config, paths, Arc::new(client))
    }

    /// A client whose account list and cache live only in memory. Resume
    /// records still go to `resume_dir`.
    pub fn ephemeral(
        config: PcsConfig,
        remote: Arc<dyn RemoteService>,
        resume_dir: std::path::PathBuf,
    ) -> Self {
        let cache = Arc::new(DirCache::new(Arc::clone(&remote), config.cache_ttl()));
        Self::assemble(
            config,
            remote,
            AccountStore::in_memory(),
            cache,
            ResumeStore::new(resume_dir),
        )
    }

    fn assemble(
        config: PcsConfig,
        remote: Arc<dyn RemoteService>,
        accounts: AccountStore,
        cache: Arc<DirCache>,
        resume: ResumeStore,
    ) -> Self {
        let evicted = cache.garbage_collect();
        debug!(evicted, "startup cache collection");

        let settings = TransferSettings::from_config(&config);
        let tracker = Arc::new(ProgressTracker::new(None));
        let downloads = DownloadEngine::new(Arc::clone(&remote), resume, settings.clone())
            .with_tracker(Arc::clone(&tracker));
        let uploads = UploadEngine::new(Arc::clone(&remote), Arc::clone(&cache), settings)
            .with_tracker(Arc::clone(&tracker));

        info!(
            chunk_size = config.chunk_size(),
            max_parallel = config.max_parallel,
            savedir = %config.savedir.display(),
            "netdisk client ready"
        );
        Self {
            resolver: Resolver::new(Arc::clone(&cache)),
            config,
            remote,
            accounts,
            cache,
            downloads,
            uploads,
            tracker,
        }
    }

    pub fn config(&self) -> &PcsConfig {
        &self.config
    }

    /// Progress of running transfers; register callbacks here.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn cache(&self) -> &Arc<DirCache> {
        &self.cache
    }

    /// Starts periodic cache garbage collection (and mirror flushes) at the
    /// cache TTL until `cancel` fires.
    pub fn start_cache_gc(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = self.cache.ttl().max(std::time::Duration::from_secs(1));
        Arc::clone(&self.cache).spawn_gc(interval, cancel)
    }

    /// Writes the directory cache mirror now.
    pub async fn flush_cache(&self) -> Result<(), NetdiskError> {
        self.cache.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use pcs_protocol::AuthTriplet;
    use pcs_remote::memory::MemoryRemote;
    use tempfile::TempDir;

    pub struct Fixture {
        pub remote: Arc<MemoryRemote>,
        pub disk: Netdisk,
        pub dir: TempDir,
    }

    impl Fixture {
        /// A client with accounts `alice` (uid 1) and `bob` (uid 2)
        /// registered remotely; nobody is logged in.
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let remote = Arc::new(MemoryRemote::new());
            remote.register_account("alice-token", 1, "alice");
            remote.register_account("bob-token", 2, "bob");

            let mut config = PcsConfig::default();
            config.set("cache_size", "64").unwrap();
            config.set("max_parallel", "4").unwrap();
            config.savedir = dir.path().join("save");

            let paths = StatePaths::in_dir(dir.path().join("state"));
            let disk = Netdisk::open(config, &paths, Arc::clone(&remote) as Arc<dyn RemoteService>)
                .unwrap();
            Self { remote, disk, dir }
        }

        /// Same as [`new`](Self::new) with alice logged in.
        pub async fn logged_in() -> Self {
            let fx = Self::new();
            fx.disk.login(alice()).await.unwrap();
            fx
        }
    }

    pub fn alice() -> AuthTriplet {
        AuthTriplet::new("alice-token", "p", "s")
    }

    pub fn bob() -> AuthTriplet {
        AuthTriplet::new("bob-token", "p", "s")
    }
}
