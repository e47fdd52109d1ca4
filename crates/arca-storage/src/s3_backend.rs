use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::signing::sign;
use rusty_s3::{Bucket, Credentials, Map, Method, UrlStyle};
use time::OffsetDateTime;
use url::Url;

use arca_types::error::{ArcaError, Result};

use crate::retry::{with_backoff, HttpRetryError};
use crate::{RestoreTier, RetryConfig, StorageBackend};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

type HttpResult<T> = std::result::Result<T, HttpRetryError>;

/// Target connection for S3 and S3-compatible object stores.
pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    /// Prefix (root path) prepended to all keys.
    root: String,
}

impl S3Backend {
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint.parse().map_err(|e| {
            ArcaError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;

        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| ArcaError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(access_key_id, secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
            retry,
            root: root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    /// Run one HTTP exchange with the configured backoff.
    fn call<T>(&self, op: &str, key: &str, f: impl FnMut() -> HttpResult<T>) -> Result<T> {
        let label = format!("S3 {op} {key}");
        with_backoff(&self.retry, &label, HttpRetryError::is_retryable, f)
            .map_err(|e| e.into_arca(&label))
    }

    fn read_body(resp: ureq::Response, limit: Option<u64>) -> HttpResult<Vec<u8>> {
        let mut buf = Vec::new();
        let mut reader = resp.into_reader();
        let read = match limit {
            Some(n) => reader.take(n).read_to_end(&mut buf),
            None => reader.read_to_end(&mut buf),
        };
        read.map_err(HttpRetryError::BodyIo)?;
        Ok(buf)
    }

    /// HEAD an object and hand the response headers to `inspect`.
    fn head<T>(
        &self,
        key: &str,
        inspect: impl Fn(&ureq::Response) -> HttpResult<T>,
    ) -> Result<Option<T>> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        self.call("HEAD", key, || match self.agent.head(url.as_str()).call() {
            Ok(resp) => inspect(&resp).map(Some),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(HttpRetryError::http(e)),
        })
    }
}

impl StorageBackend for S3Backend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);
        self.call("GET", key, || match self.agent.get(url.as_str()).call() {
            Ok(resp) => Self::read_body(resp, None).map(Some),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            // An archived object that has not been restored answers 403 InvalidObjectState.
            Err(ureq::Error::Status(403, resp))
                if resp.header("x-amz-storage-class").is_some() =>
            {
                Err(HttpRetryError::Archived(key.to_string()))
            }
            Err(e) => Err(HttpRetryError::http(e)),
        })
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        self.call("PUT", key, || {
            self.agent
                .put(url.as_str())
                .send_bytes(data)
                .map(|_| ())
                .map_err(HttpRetryError::http)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        self.call("DELETE", key, || match self.agent.delete(url.as_str()).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(HttpRetryError::http(e)),
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key, |_| Ok(()))?.is_some())
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.head(key, |resp| {
            let header = resp.header("Content-Length").ok_or_else(|| {
                HttpRetryError::Permanent("response missing Content-Length header".into())
            })?;
            header.parse::<u64>().map_err(|_| {
                HttpRetryError::Permanent(format!("invalid Content-Length header: {header}"))
            })
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let body = self.call("LIST", prefix, || {
                let resp = self
                    .agent
                    .get(url.as_str())
                    .call()
                    .map_err(HttpRetryError::http)?;
                Self::read_body(resp, None)
            })?;

            let body = std::str::from_utf8(&body).map_err(|e| {
                ArcaError::Other(format!("S3 LIST {prefix}: failed to parse response: {e}"))
            })?;
            let parsed = ListObjectsV2::parse_response(body).map_err(|e| {
                ArcaError::Other(format!("S3 LIST {prefix}: failed to parse response: {e}"))
            })?;

            for obj in &parsed.contents {
                if obj.key.ends_with('/') {
                    continue;
                }
                if root_prefix_len > 0 && obj.key.len() > root_prefix_len {
                    keys.push(obj.key[root_prefix_len..].to_string());
                } else {
                    keys.push(obj.key.clone());
                }
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        if length == 0 {
            return Ok(Some(Vec::new()));
        }
        let end = offset
            .checked_add(length)
            .and_then(|n| n.checked_sub(1))
            .ok_or_else(|| {
                ArcaError::Other(format!(
                    "S3 GET_RANGE {key}: offset {offset} + length {length} overflows u64"
                ))
            })?;
        let range_header = format!("bytes={offset}-{end}");

        let full_key = self.full_key(key);
        let mut action = self.bucket.get_object(Some(&self.credentials), &full_key);
        action.headers_mut().insert("Range", &range_header);
        let url = action.sign(PRESIGN_DURATION);

        let data = self.call("GET_RANGE", key, || {
            match self
                .agent
                .get(url.as_str())
                .set("Range", &range_header)
                .call()
            {
                Ok(resp) if resp.status() == 206 => Self::read_body(resp, Some(length)).map(Some),
                Ok(resp) => Err(HttpRetryError::Permanent(format!(
                    "expected 206 Partial Content, got {}",
                    resp.status()
                ))),
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(ureq::Error::Status(403, resp))
                    if resp.header("x-amz-storage-class").is_some() =>
                {
                    Err(HttpRetryError::Archived(key.to_string()))
                }
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })?;

        if let Some(ref buf) = data {
            if buf.len() as u64 != length {
                return Err(ArcaError::Other(format!(
                    "short read on {key} at offset {offset}: expected {length} bytes, got {}",
                    buf.len()
                )));
            }
        }
        Ok(data)
    }

    fn is_restored(&self, key: &str) -> Result<bool> {
        let state = self.head(key, |resp| {
            let class = resp.header("x-amz-storage-class").unwrap_or("STANDARD");
            if class != "GLACIER" && class != "DEEP_ARCHIVE" {
                return Ok(true);
            }
            Ok(resp
                .header("x-amz-restore")
                .is_some_and(|r| r.contains("ongoing-request=\"false\"")))
        })?;
        state.ok_or_else(|| ArcaError::NotFound(key.to_string()))
    }

    fn request_restore(&self, key: &str, days: u32, tier: RestoreTier) -> Result<bool> {
        if self.is_restored(key)? {
            return Ok(true);
        }
        let full_key = self.full_key(key);
        let url = RestoreObject::new(&self.bucket, &self.credentials, &full_key)?
            .sign(PRESIGN_DURATION);
        let body = restore_request_body(days, tier);
        self.call("RESTORE", key, || {
            match self
                .agent
                .post(url.as_str())
                .set("Content-Type", "application/xml")
                .send_string(&body)
            {
                // 200: a restored copy already exists; 202: restore started.
                Ok(resp) => Ok(resp.status() == 200),
                Err(ureq::Error::Status(409, _)) => Ok(true),
                Err(ureq::Error::Status(404, _)) => Err(HttpRetryError::Permanent(format!(
                    "{key} does not exist"
                ))),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
    }
}

/// `POST /<key>?restore`, which rusty-s3 has no action for.
struct RestoreObject<'a> {
    bucket: &'a Bucket,
    credentials: &'a Credentials,
    url: Url,
    query: Map<'a>,
    headers: Map<'a>,
}

impl<'a> RestoreObject<'a> {
    fn new(bucket: &'a Bucket, credentials: &'a Credentials, object: &str) -> Result<Self> {
        let url = bucket
            .object_url(object)
            .map_err(|e| ArcaError::Other(format!("invalid S3 object key '{object}': {e}")))?;
        let mut query = Map::new();
        query.insert("restore", "");
        Ok(Self {
            bucket,
            credentials,
            url,
            query,
            headers: Map::new(),
        })
    }
}

impl<'a> S3Action<'a> for RestoreObject<'a> {
    const METHOD: Method = Method::Post;

    fn query_mut(&mut self) -> &mut Map<'a> {
        &mut self.query
    }

    fn headers_mut(&mut self) -> &mut Map<'a> {
        &mut self.headers
    }

    fn sign_with_time(&self, expires_in: Duration, time: &OffsetDateTime) -> Url {
        sign(
            time,
            Method::Post,
            self.url.clone(),
            self.credentials.key(),
            self.credentials.secret(),
            self.credentials.token(),
            self.bucket.region(),
            expires_in.as_secs(),
            self.query.iter(),
            self.headers.iter(),
        )
    }
}

fn restore_request_body(days: u32, tier: RestoreTier) -> String {
    format!(
        "<RestoreRequest xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Days>{days}</Days>\
         <GlacierJobParameters><Tier>{}</Tier></GlacierJobParameters>\
         </RestoreRequest>",
        tier.as_str()
    )
}
