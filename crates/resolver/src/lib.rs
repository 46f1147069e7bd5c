//! Remote path resolution.
//!
//! User input is joined with the session's working directory, normalized,
//! then expanded component by component: a component containing glob
//! metacharacters is matched against the listing of every candidate parent
//! (through the directory cache), a literal component is appended as is.
//! Candidates that do not exist are dropped at the end.

use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};
use pcs_dircache::{CacheError, DirCache};
use pcs_protocol::DirectoryEntry;
use pcs_protocol::path;
use pcs_remote::RemoteError;
use pcs_session::SessionContext;
use tracing::debug;

/// Errors from path resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("{pattern} matches {count} paths, expected one")]
    Ambiguous { pattern: String, count: usize },

    #[error("invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ResolveError {
    fn from_cache(err: CacheError, target: &str) -> Self {
        match err {
            CacheError::Remote(RemoteError::PathNotFound(_)) => {
                Self::PathNotFound(target.to_string())
            }
            other => Self::Cache(other),
        }
    }
}

/// Returns `true` if `s` contains glob metacharacters.
pub fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

/// Resolves user paths against a session's working directory.
pub struct Resolver {
    cache: Arc<DirCache>,
}

impl Resolver {
    pub fn new(cache: Arc<DirCache>) -> Self {
        Self { cache }
    }

    /// Joins `input` with the working directory without touching the remote.
    pub fn absolute(&self, ctx: &SessionContext, input: &str) -> String {
        let input = input.trim();
        if input.is_empty() {
            return path::normalize(&ctx.workdir);
        }
        path::join(&ctx.workdir, input)
    }

    /// Resolves `input` to exactly one existing object.
    pub async fn resolve_one(
        &self,
        ctx: &SessionContext,
        input: &str,
    ) -> Result<DirectoryEntry, ResolveError> {
        let mut matches = self.resolve_many(ctx, input).await?;
        if matches.len() > 1 {
            return Err(ResolveError::Ambiguous {
                pattern: self.absolute(ctx, input),
                count: matches.len(),
            });
        }
        matches
            .pop()
            .ok_or_else(|| ResolveError::PathNotFound(self.absolute(ctx, input)))
    }

    /// Resolves `input` to every existing object it names, sorted by path.
    /// Fails with `PathNotFound` when nothing matches.
    pub async fn resolve_many(
        &self,
        ctx: &SessionContext,
        input: &str,
    ) -> Result<Vec<DirectoryEntry>, ResolveError> {
        let target = self.absolute(ctx, input);

        if !has_wildcard(&target) {
            let entry = self
                .cache
                .meta(ctx, &target)
                .await
                .map_err(|e| ResolveError::from_cache(e, &target))?;
            return Ok(vec![entry]);
        }

        let components: Vec<&str> = target.split('/').filter(|c| !c.is_empty()).collect();
        let mut candidates: Vec<(String, Option<DirectoryEntry>)> = vec![("/".to_string(), None)];

        for (i, component) in components.iter().enumerate() {
            let last = i + 1 == components.len();
            let mut next = Vec::new();

            if has_wildcard(component) {
                let matcher = compile(component)?;
                for (dir, entry) in &candidates {
                    if entry.as_ref().is_some_and(|e| !e.is_dir) {
                        continue;
                    }
                    let listing = match self.cache.list(ctx, dir).await {
                        Ok(l) => l,
                        Err(CacheError::Remote(RemoteError::PathNotFound(_))) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    next.extend(
                        listing
                            .into_iter()
                            .filter(|e| (last || e.is_dir) && matcher.is_match(e.name()))
                            .map(|e| (e.path.clone(), Some(e))),
                    );
                }
            } else {
                next.extend(
                    candidates
                        .iter()
                        .map(|(dir, _)| (path::join(dir, component), None)),
                );
            }

            candidates = next;
            if candidates.is_empty() {
                break;
            }
        }

        let mut resolved = Vec::with_capacity(candidates.len());
        for (p, entry) in candidates {
            match entry {
                Some(e) => resolved.push(e),
                None => match self.cache.meta(ctx, &p).await {
                    Ok(e) => resolved.push(e),
                    Err(CacheError::Remote(RemoteError::PathNotFound(_))) => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }

        resolved.sort_by(|a, b| a.path.cmp(&b.path));
        resolved.dedup_by(|a, b| a.path == b.path);
        debug!(pattern = %target, matches = resolved.len(), "wildcard resolved");

        if resolved.is_empty() {
            return Err(ResolveError::PathNotFound(target));
        }
        Ok(resolved)
    }
}

fn compile(component: &str) -> Result<GlobMatcher, ResolveError> {
    GlobBuilder::new(component)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| ResolveError::InvalidPattern {
            pattern: component.to_string(),
            reason: e.to_string(),
        })
}
