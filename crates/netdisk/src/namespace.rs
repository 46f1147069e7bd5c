//! Namespace commands: everything that reads or rearranges the remote tree
//! without moving file content.

use std::collections::BTreeSet;

use pcs_dircache::CacheError;
use pcs_protocol::{DirectoryEntry, PathPair, Quota, path};
use pcs_remote::RemoteError;
use pcs_session::SessionContext;
use tracing::info;

use crate::{Netdisk, NetdiskError};

impl Netdisk {
    pub async fn quota(&self) -> Result<Quota, NetdiskError> {
        let ctx = self.context()?;
        Ok(self.remote.quota(&ctx.auth).await?)
    }

    /// The active account's working directory.
    pub fn pwd(&self) -> Result<String, NetdiskError> {
        Ok(self.context()?.workdir)
    }

    /// Changes the working directory. Returns the new one.
    pub async fn cd(&self, input: &str) -> Result<String, NetdiskError> {
        let ctx = self.context()?;
        let entry = self.resolver.resolve_one(&ctx, input).await?;
        if !entry.is_dir {
            return Err(NetdiskError::NotADirectory(entry.path));
        }
        self.accounts.set_workdir(ctx.uid, &entry.path)?;
        Ok(entry.path)
    }

    /// Lists what `input` names: the children of each matching directory
    /// and each matching file itself. An empty input lists the working
    /// directory.
    pub async fn ls(&self, input: &str) -> Result<Vec<DirectoryEntry>, NetdiskError> {
        let ctx = self.context()?;
        let mut out = Vec::new();
        for entry in self.resolver.resolve_many(&ctx, input).await? {
            if entry.is_dir {
                out.extend(self.cache.list(&ctx, &entry.path).await?);
            } else {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub async fn meta(&self, input: &str) -> Result<DirectoryEntry, NetdiskError> {
        let ctx = self.context()?;
        Ok(self.resolver.resolve_one(&ctx, input).await?)
    }

    /// Deletes everything the inputs match, in one remote call. Returns the
    /// deleted paths.
    pub async fn rm(&self, inputs: &[&str]) -> Result<Vec<String>, NetdiskError> {
        let ctx = self.context()?;
        let mut targets = BTreeSet::new();
        for input in inputs {
            for entry in self.resolver.resolve_many(&ctx, input).await? {
                if entry.path == "/" {
                    return Err(NetdiskError::InvalidArgument("refusing to delete /".into()));
                }
                targets.insert(entry.path);
            }
        }
        if targets.is_empty() {
            return Err(NetdiskError::InvalidArgument("nothing to delete".into()));
        }

        let targets: Vec<String> = targets.into_iter().collect();
        self.remote.delete_paths(&ctx.auth, &targets).await?;
        for target in &targets {
            self.cache.invalidate(ctx.uid, &path::parent(target)).await;
            self.cache.invalidate_subtree(ctx.uid, target).await;
        }
        info!(count = targets.len(), "paths deleted");
        Ok(targets)
    }

    /// Creates a directory (and missing parents). Returns its path.
    pub async fn mkdir(&self, input: &str) -> Result<String, NetdiskError> {
        let ctx = self.context()?;
        let target = self.resolver.absolute(&ctx, input);
        self.remote.make_directory(&ctx.auth, &target).await?;
        self.cache.invalidate_ancestors(ctx.uid, &target).await;
        Ok(target)
    }

    /// Copies sources to `dest`; see [`mv`](Self::mv) for placement rules.
    pub async fn cp(&self, sources: &[&str], dest: &str) -> Result<Vec<PathPair>, NetdiskError> {
        self.transplant(sources, dest, false).await
    }

    /// Moves sources to `dest`.
    ///
    /// With a single source and a destination that does not exist, the
    /// source lands exactly at `dest`. Otherwise `dest` must be an existing
    /// directory and each source lands at `dest/<name>`.
    pub async fn mv(&self, sources: &[&str], dest: &str) -> Result<Vec<PathPair>, NetdiskError> {
        self.transplant(sources, dest, true).await
    }

    async fn transplant(
        &self,
        sources: &[&str],
        dest: &str,
        is_move: bool,
    ) -> Result<Vec<PathPair>, NetdiskError> {
        let ctx = self.context()?;
        let mut from = Vec::new();
        for input in sources {
            from.extend(self.resolver.resolve_many(&ctx, input).await?);
        }
        if from.is_empty() {
            return Err(NetdiskError::InvalidArgument("no source given".into()));
        }

        let dest = self.resolver.absolute(&ctx, dest);
        let dest_entry = self.lookup(&ctx, &dest).await?;
        let pairs: Vec<PathPair> = match (&dest_entry, from.as_slice()) {
            (None, [only]) => vec![PathPair {
                from: only.path.clone(),
                to: dest.clone(),
            }],
            (Some(d), _) if d.is_dir => from
                .iter()
                .map(|e| PathPair {
                    from: e.path.clone(),
                    to: path::join(&dest, e.name()),
                })
                .collect(),
            (None, _) => return Err(NetdiskError::Resolve(pcs_resolver::ResolveError::PathNotFound(dest))),
            (Some(_), _) => return Err(NetdiskError::NotADirectory(dest)),
        };

        for pair in &pairs {
            if pair.from == "/" || path::is_within(&pair.to, &pair.from) {
                return Err(NetdiskError::InvalidArgument(format!(
                    "cannot place {} inside itself",
                    pair.from
                )));
            }
        }

        if is_move {
            self.remote.move_paths(&ctx.auth, &pairs).await?;
        } else {
            self.remote.copy_paths(&ctx.auth, &pairs).await?;
        }

        for pair in &pairs {
            self.cache.invalidate_ancestors(ctx.uid, &pair.to).await;
            self.cache.invalidate_subtree(ctx.uid, &pair.to).await;
            if is_move {
                self.cache.invalidate(ctx.uid, &path::parent(&pair.from)).await;
                self.cache.invalidate_subtree(ctx.uid, &pair.from).await;
            }
        }
        info!(count = pairs.len(), op = if is_move { "move" } else { "copy" }, "paths transplanted");
        Ok(pairs)
    }

    /// Metadata of `target`, or `None` if it does not exist.
    async fn lookup(
        &self,
        ctx: &SessionContext,
        target: &str,
    ) -> Result<Option<DirectoryEntry>, NetdiskError> {
        match self.cache.meta(ctx, target).await {
            Ok(entry) => Ok(Some(entry)),
            Err(CacheError::Remote(RemoteError::PathNotFound(_))) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
