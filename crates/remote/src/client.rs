//! PCS REST client.
//!
//! Async HTTP client using `reqwest`. Credentials travel as cookies, the
//! application id as a query parameter on every call.

use std::time::Duration;

use pcs_protocol::{
    AuthTriplet, ByteRange, ChunkReceipt, DirectoryEntry, Identity, PathPair, Quota,
    RapidUploadDigest,
};
use reqwest::header::{COOKIE, RANGE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::service::{RemoteFuture, RemoteService};
use crate::wire::{PcsErrorBody, PcsFile, PcsFileList, PcsQuota, PcsTmpFile, PcsUserInfo};
use crate::RemoteError;

const DEFAULT_PCS_URL: &str = "https://pcs.baidu.com/rest/2.0/pcs";
const DEFAULT_DOWNLOAD_URL: &str = "https://d.pcs.baidu.com/rest/2.0/pcs";
const DEFAULT_UPLOAD_URL: &str = "https://c.pcs.baidu.com/rest/2.0/pcs";
const DEFAULT_USER_INFO_URL: &str = "https://pan.baidu.com/rest/2.0/xpan";

/// PCS error code for "no file with this digest set".
const RAPID_UPLOAD_MISS: i64 = 31079;

/// Base URLs for the PCS endpoint families.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub pcs: String,
    pub download: String,
    pub upload: String,
    pub user_info: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            pcs: DEFAULT_PCS_URL.to_string(),
            download: DEFAULT_DOWNLOAD_URL.to_string(),
            upload: DEFAULT_UPLOAD_URL.to_string(),
            user_info: DEFAULT_USER_INFO_URL.to_string(),
        }
    }
}

impl Endpoints {
    /// Points every endpoint family at the same base URL.
    pub fn single(base: &str) -> Self {
        Self {
            pcs: base.to_string(),
            download: base.to_string(),
            upload: base.to_string(),
            user_info: base.to_string(),
        }
    }
}

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub app_id: u32,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            app_id: 266719,
            user_agent: "netdisk;pcs-rs".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// [`RemoteService`] over the PCS REST API.
pub struct PcsClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    app_id: String,
}

impl PcsClient {
    /// Creates a client against the default endpoints.
    pub fn new(options: ClientOptions) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .user_agent(options.user_agent)
            .timeout(options.timeout)
            .build()
            .map_err(|e| RemoteError::InvalidResponse(format!("building HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoints: Endpoints::default(),
            app_id: options.app_id.to_string(),
        })
    }

    /// Overrides the endpoint base URLs.
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn request(
        &self,
        method: Method,
        base: &str,
        endpoint: &str,
        auth: &AuthTriplet,
        params: &[(&str, String)],
    ) -> RequestBuilder {
        let url = format!("{base}/{endpoint}");
        let mut query: Vec<(&str, String)> = Vec::with_capacity(params.len() + 1);
        query.push(("app_id", self.app_id.clone()));
        query.extend(params.iter().cloned());

        let mut req = self.http.request(method, url).query(&query);
        let cookie = auth.cookie_header();
        if !cookie.is_empty() {
            req = req.header(COOKIE, cookie);
        }
        req
    }

    /// Sends a request and returns the body of a successful response.
    async fn send(&self, req: RequestBuilder, path: &str) -> Result<(StatusCode, Vec<u8>), RemoteError> {
        let resp = req.send().await.map_err(classify)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(classify)?.to_vec();
        trace!(%status, bytes = body.len(), path, "pcs response");

        if status.is_success() {
            Ok((status, body))
        } else {
            Err(status_error(status, &body, path))
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        path: &str,
    ) -> Result<T, RemoteError> {
        let (_, body) = self.send(req, path).await?;
        parse_json(&body, path)
    }

    async fn file_op(
        &self,
        method: &str,
        auth: &AuthTriplet,
        param: serde_json::Value,
        path: &str,
    ) -> Result<(), RemoteError> {
        let req = self
            .request(
                Method::POST,
                &self.endpoints.pcs,
                "file",
                auth,
                &[("method", method.to_string())],
            )
            .form(&[("param", param.to_string())]);
        let (_, body) = self.send(req, path).await?;
        check_error_body(&body, path)
    }
}

impl RemoteService for PcsClient {
    fn authenticate<'a>(&'a self, auth: &'a AuthTriplet) -> RemoteFuture<'a, Identity> {
        Box::pin(async move {
            let req = self.request(
                Method::GET,
                &self.endpoints.user_info,
                "nas",
                auth,
                &[("method", "uinfo".to_string())],
            );
            let info: PcsUserInfo = self.send_json(req, "/").await?;
            if info.errno != 0 || info.uk == 0 {
                return Err(RemoteError::Auth(format!(
                    "user info rejected (errno {})",
                    info.errno
                )));
            }
            Ok(Identity {
                uid: info.uk,
                name: info.baidu_name,
            })
        })
    }

    fn quota<'a>(&'a self, auth: &'a AuthTriplet) -> RemoteFuture<'a, Quota> {
        Box::pin(async move {
            let req = self.request(
                Method::GET,
                &self.endpoints.pcs,
                "quota",
                auth,
                &[("method", "info".to_string())],
            );
            let q: PcsQuota = self.send_json(req, "/").await?;
            Ok(Quota {
                total: q.quota,
                used: q.used,
            })
        })
    }

    fn list_directory<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
    ) -> RemoteFuture<'a, Vec<DirectoryEntry>> {
        Box::pin(async move {
            let req = self.request(
                Method::GET,
                &self.endpoints.pcs,
                "file",
                auth,
                &[
                    ("method", "list".to_string()),
                    ("path", path.to_string()),
                    ("by", "name".to_string()),
                    ("order", "asc".to_string()),
                    ("limit", "0-10000".to_string()),
                ],
            );
            let list: PcsFileList = self.send_json(req, path).await?;
            debug!(path, entries = list.list.len(), "listed remote directory");
            Ok(list.list.into_iter().map(Into::into).collect())
        })
    }

    fn metadata<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
    ) -> RemoteFuture<'a, DirectoryEntry> {
        Box::pin(async move {
            let req = self.request(
                Method::GET,
                &self.endpoints.pcs,
                "file",
                auth,
                &[("method", "meta".to_string()), ("path", path.to_string())],
            );
            let list: PcsFileList = self.send_json(req, path).await?;
            list.list
                .into_iter()
                .next()
                .map(Into::into)
                .ok_or_else(|| RemoteError::PathNotFound(path.to_string()))
        })
    }

    fn make_directory<'a>(&'a self, auth: &'a AuthTriplet, path: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let req = self.request(
                Method::POST,
                &self.endpoints.pcs,
                "file",
                auth,
                &[("method", "mkdir".to_string()), ("path", path.to_string())],
            );
            let (_, body) = self.send(req, path).await?;
            check_error_body(&body, path)
        })
    }

    fn delete_paths<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        paths: &'a [String],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let list: Vec<_> = paths
                .iter()
                .map(|p| serde_json::json!({ "path": p }))
                .collect();
            let context = paths.first().map(String::as_str).unwrap_or("/");
            self.file_op("delete", auth, serde_json::json!({ "list": list }), context)
                .await
        })
    }

    fn move_paths<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        pairs: &'a [PathPair],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let context = pairs.first().map(|p| p.from.as_str()).unwrap_or("/");
            self.file_op("move", auth, pair_param(pairs), context).await
        })
    }

    fn copy_paths<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        pairs: &'a [PathPair],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let context = pairs.first().map(|p| p.from.as_str()).unwrap_or("/");
            self.file_op("copy", auth, pair_param(pairs), context).await
        })
    }

    fn download_range<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
        range: ByteRange,
    ) -> RemoteFuture<'a, Vec<u8>> {
        Box::pin(async move {
            if range.is_empty() {
                return Ok(Vec::new());
            }
            let req = self
                .request(
                    Method::GET,
                    &self.endpoints.download,
                    "file",
                    auth,
                    &[("method", "download".to_string()), ("path", path.to_string())],
                )
                .header(RANGE, format!("bytes={}-{}", range.start, range.end - 1));

            let (status, mut body) = self.send(req, path).await?;
            let expected = range.len() as usize;

            // A server ignoring the Range header answers 200 with the whole file.
            if status == StatusCode::OK && body.len() > expected {
                let start = range.start as usize;
                if body.len() < start + expected {
                    return Err(RemoteError::Transient(format!(
                        "short body for {path}: {} bytes",
                        body.len()
                    )));
                }
                body = body[start..start + expected].to_vec();
            }

            if body.len() != expected {
                return Err(RemoteError::Transient(format!(
                    "short read for {path}: expected {expected} bytes, got {}",
                    body.len()
                )));
            }
            Ok(body)
        })
    }

    fn rapid_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
        digest: &'a RapidUploadDigest,
    ) -> RemoteFuture<'a, Option<DirectoryEntry>> {
        Box::pin(async move {
            let mut params = vec![
                ("method", "rapidupload".to_string()),
                ("path", path.to_string()),
                ("content-length", digest.length.to_string()),
                ("content-md5", digest.content_md5.clone()),
                ("slice-md5", digest.slice_md5.clone()),
                ("ondup", "overwrite".to_string()),
            ];
            if digest.crc32 != 0 {
                params.push(("content-crc32", digest.crc32.to_string()));
            }
            let req = self.request(Method::POST, &self.endpoints.pcs, "file", auth, &params);

            match self.send_json::<PcsFile>(req, path).await {
                Ok(file) => Ok(Some(file.into())),
                Err(RemoteError::Api { code, .. }) if code == RAPID_UPLOAD_MISS => {
                    debug!(path, "rapid upload miss");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
    }

    fn begin_chunked_upload<'a>(
        &'a self,
        _auth: &'a AuthTriplet,
        path: &'a str,
        size: u64,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            // Temporary chunks are independent on PCS; the id only ties them
            // together on the client side.
            let upload_id = uuid::Uuid::new_v4().to_string();
            debug!(path, size, upload_id = %upload_id, "chunked upload opened");
            Ok(upload_id)
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        upload_id: &'a str,
        index: usize,
        data: Vec<u8>,
    ) -> RemoteFuture<'a, ChunkReceipt> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(data).file_name(format!("{upload_id}.{index}"));
            let form = reqwest::multipart::Form::new().part("file", part);
            let req = self
                .request(
                    Method::POST,
                    &self.endpoints.upload,
                    "file",
                    auth,
                    &[
                        ("method", "upload".to_string()),
                        ("type", "tmpfile".to_string()),
                    ],
                )
                .multipart(form);
            let tmp: PcsTmpFile = self.send_json(req, upload_id).await?;
            Ok(ChunkReceipt {
                index,
                md5: tmp.md5,
            })
        })
    }

    fn finalize_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        upload_id: &'a str,
        path: &'a str,
        receipts: &'a [ChunkReceipt],
    ) -> RemoteFuture<'a, DirectoryEntry> {
        Box::pin(async move {
            let block_list: Vec<&str> = receipts.iter().map(|r| r.md5.as_str()).collect();
            let req = self
                .request(
                    Method::POST,
                    &self.endpoints.pcs,
                    "file",
                    auth,
                    &[
                        ("method", "createsuperfile".to_string()),
                        ("path", path.to_string()),
                        ("ondup", "overwrite".to_string()),
                    ],
                )
                .form(&[(
                    "param",
                    serde_json::json!({ "block_list": block_list }).to_string(),
                )]);
            let file: PcsFile = self.send_json(req, path).await?;
            debug!(path, upload_id, chunks = receipts.len(), "chunked upload finalized");
            Ok(file.into())
        })
    }
}

fn pair_param(pairs: &[PathPair]) -> serde_json::Value {
    let list: Vec<_> = pairs
        .iter()
        .map(|p| serde_json::json!({ "from": p.from, "to": p.to }))
        .collect();
    serde_json::json!({ "list": list })
}

/// Classifies transport failures. Anything that went wrong on the wire is
/// worth retrying; request construction errors are not.
fn classify(e: reqwest::Error) -> RemoteError {
    if e.is_builder() {
        RemoteError::InvalidResponse(e.to_string())
    } else if e.is_decode() {
        RemoteError::InvalidResponse(e.to_string())
    } else {
        RemoteError::Transient(e.to_string())
    }
}

/// Maps a non-2xx response to the error taxonomy.
fn status_error(status: StatusCode, body: &[u8], path: &str) -> RemoteError {
    let transient_status = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;

    if let Ok(err) = serde_json::from_slice::<PcsErrorBody>(body) {
        let mapped = RemoteError::from_pcs_code(err.error_code, &err.error_msg, path);
        if matches!(mapped, RemoteError::Api { .. }) && transient_status {
            return RemoteError::Transient(format!("HTTP {status}: {}", err.error_msg));
        }
        return mapped;
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Auth(format!("HTTP {status}"))
        }
        StatusCode::NOT_FOUND => RemoteError::PathNotFound(path.to_string()),
        _ if transient_status => RemoteError::Transient(format!("HTTP {status}")),
        _ => RemoteError::Api {
            code: status.as_u16() as i64,
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

/// Success bodies may still carry an error envelope.
fn check_error_body(body: &[u8], path: &str) -> Result<(), RemoteError> {
    match serde_json::from_slice::<PcsErrorBody>(body) {
        Ok(err) if err.error_code != 0 => Err(RemoteError::from_pcs_code(
            err.error_code,
            &err.error_msg,
            path,
        )),
        _ => Ok(()),
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8], path: &str) -> Result<T, RemoteError> {
    check_error_body(body, path)?;
    serde_json::from_slice(body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}
