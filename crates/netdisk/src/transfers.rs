//! Multi-target transfers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pcs_protocol::{DirectoryEntry, RapidUploadDigest, path};
use pcs_session::SessionContext;
use pcs_transfer::{DownloadRequest, UploadRequest, digest, local_target};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::scanner::scan_local;
use crate::{DownloadOptions, DownloadReport, FileSum, Netdisk, NetdiskError, UploadReport};

impl Netdisk {
    /// Downloads every file the inputs match into
    /// `<savedir>/<uid>/<remote path>`, walking matched directories.
    ///
    /// A local file that already exists and has no resume record is
    /// skipped. One file failing does not stop the others; only resolution
    /// errors fail the whole call.
    pub async fn download(
        &self,
        inputs: &[&str],
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<DownloadReport>, NetdiskError> {
        let ctx = self.context()?;
        let mut files = BTreeMap::new();
        for input in inputs {
            for entry in self.resolver.resolve_many(&ctx, input).await? {
                for file in self.walk_remote(&ctx, entry).await? {
                    files.insert(file.path.clone(), file);
                }
            }
        }
        info!(files = files.len(), test = options.test, "download batch started");

        let mut reports = Vec::with_capacity(files.len());
        for remote_path in files.into_keys() {
            let local_path = match local_target(&self.config.savedir, ctx.uid, &remote_path) {
                Ok(p) => p,
                Err(error) => {
                    reports.push(DownloadReport::Failed { remote_path, error });
                    continue;
                }
            };

            if !options.test
                && local_path.exists()
                && !self
                    .downloads
                    .resume_store()
                    .exists(&remote_path, &local_path)
                    .await
            {
                debug!(remote = %remote_path, local = %local_path.display(), "same-name local file, skipping");
                reports.push(DownloadReport::Skipped {
                    remote_path,
                    local_path,
                });
                continue;
            }

            let req = DownloadRequest {
                remote_path: remote_path.clone(),
                local_path,
                test_mode: options.test,
                parallel: options.parallel,
            };
            reports.push(match self.downloads.download(&ctx, req, cancel).await {
                Ok(outcome) => DownloadReport::Downloaded(outcome),
                Err(error) => DownloadReport::Failed { remote_path, error },
            });
        }
        Ok(reports)
    }

    /// Uploads local files and directory trees under `remote_dir`.
    ///
    /// A file lands at `remote_dir/<file name>`, a directory's files at
    /// `remote_dir/<dir name>/<relative path>`. Existing remote files are
    /// overwritten.
    pub async fn upload(
        &self,
        locals: &[PathBuf],
        remote_dir: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadReport>, NetdiskError> {
        let ctx = self.context()?;
        let base = self.resolver.absolute(&ctx, remote_dir);

        let mut reports = Vec::new();
        for local in locals {
            let root = local.clone();
            let files = tokio::task::spawn_blocking(move || scan_local(&root)).await??;
            debug!(local = %local.display(), files = files.len(), "local files scanned");

            for file in files {
                let remote_path = path::join(&base, &file.relative);
                let result = self
                    .uploads
                    .upload(&ctx, UploadRequest::new(&file.path, &remote_path), cancel)
                    .await;
                reports.push(UploadReport {
                    local_path: file.path,
                    remote_path,
                    result,
                });
            }
        }
        Ok(reports)
    }

    /// Creates `remote_path` from a known digest set without sending data.
    pub async fn rapid_upload(
        &self,
        remote_path: &str,
        digest: &RapidUploadDigest,
    ) -> Result<DirectoryEntry, NetdiskError> {
        let ctx = self.context()?;
        let target = self.resolver.absolute(&ctx, remote_path);
        Ok(self.uploads.rapid_upload(&ctx, &target, digest).await?)
    }

    /// Digest set of a local file and the rapid-upload command that would
    /// recreate it remotely.
    pub async fn sum_file(&self, local: &Path) -> Result<FileSum, NetdiskError> {
        let digest = digest::digest_file(local).await?;
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(FileSum {
            command: digest.to_command(&name),
            digest,
        })
    }

    /// Every file at or beneath `entry`.
    async fn walk_remote(
        &self,
        ctx: &SessionContext,
        entry: DirectoryEntry,
    ) -> Result<Vec<DirectoryEntry>, NetdiskError> {
        let mut files = Vec::new();
        let mut pending = vec![entry];
        while let Some(next) = pending.pop() {
            if next.is_dir {
                pending.extend(self.cache.list(ctx, &next.path).await?);
            } else {
                files.push(next);
            }
        }
        Ok(files)
    }
}
