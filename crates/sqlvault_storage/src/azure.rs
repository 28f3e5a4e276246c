//! Blob store backed by Azure Blob Storage.
//!
//! Requests go straight to the Blob service REST API. Two credential
//! flavours are supported: an account shared key (requests are signed with
//! HMAC-SHA256) and a managed identity (bearer tokens fetched from the
//! instance metadata service and cached until shortly before expiry).

use crate::backend::BlobStore;
use crate::error::{StorageError, StorageResult};
use crate::key::{logical_name, normalize_prefix, object_key, validate_name};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

const BACKEND: &str = "azure";
const API_VERSION: &str = "2021-08-06";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const STORAGE_RESOURCE: &str = "https://storage.azure.com/";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);
const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// Connection settings for [`AzureBlobStore`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Storage account name.
    pub account: String,
    /// Container holding the database blobs.
    pub container: String,
    /// Base64 account key. Required unless `use_managed_identity` is set.
    pub key: Option<String>,
    /// Authenticate with the host's managed identity instead of a key.
    pub use_managed_identity: bool,
    /// Service endpoint override, e.g. an Azurite URL.
    pub endpoint: Option<String>,
    /// Key prefix applied to every blob.
    pub prefix: Option<String>,
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("use_managed_identity", &self.use_managed_identity)
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl AzureConfig {
    /// Creates a configuration for the given account and container.
    #[must_use]
    pub fn new(account: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            ..Self::default()
        }
    }

    /// Sets the shared account key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Switches authentication to the managed identity.
    #[must_use]
    pub fn managed_identity(mut self) -> Self {
        self.use_managed_identity = true;
        self
    }

    /// Sets a custom service endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn validate(&self) -> StorageResult<()> {
        if self.account.trim().is_empty() {
            return Err(StorageError::Config("azure account is required".into()));
        }
        if self.container.trim().is_empty() {
            return Err(StorageError::Config("azure container is required".into()));
        }
        if !self.use_managed_identity && self.key.as_deref().map_or(true, str::is_empty) {
            return Err(StorageError::Config(
                "azure requires an account key or use_managed_identity".into(),
            ));
        }
        Ok(())
    }
}

enum Credential {
    SharedKey(Vec<u8>),
    ManagedIdentity(tokio::sync::Mutex<Option<CachedToken>>),
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

/// A blob store that keeps each database as `<prefix><name>.sqlite` in a container.
pub struct AzureBlobStore {
    http: reqwest::Client,
    base_url: Url,
    account: String,
    container: String,
    prefix: String,
    credential: Credential,
}

impl std::fmt::Debug for AzureBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBlobStore")
            .field("base_url", &self.base_url.as_str())
            .field("container", &self.container)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl AzureBlobStore {
    /// Creates a store from `config`. No request is made until first use.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the configuration is incomplete,
    /// the key is not valid base64 or the endpoint is not a valid URL.
    pub fn connect(config: &AzureConfig) -> StorageResult<Self> {
        config.validate()?;
        let prefix = normalize_prefix(config.prefix.as_deref())?;

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account));
        let base_url = Url::parse(endpoint.trim_end_matches('/'))
            .map_err(|e| StorageError::Config(format!("invalid azure endpoint: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StorageError::Config(format!(
                "invalid azure endpoint: {endpoint}"
            )));
        }

        let credential = if config.use_managed_identity {
            Credential::ManagedIdentity(tokio::sync::Mutex::new(None))
        } else {
            let key = config.key.as_deref().unwrap_or_default();
            let decoded = BASE64
                .decode(key.trim())
                .map_err(|e| StorageError::Config(format!("azure key is not base64: {e}")))?;
            Credential::SharedKey(decoded)
        };

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StorageError::backend(BACKEND, e.to_string()))?;

        debug!(account = %config.account, container = %config.container, "azure blob store configured");
        Ok(Self {
            http,
            base_url,
            account: config.account.clone(),
            container: config.container.clone(),
            prefix,
            credential,
        })
    }

    fn url(&self, key: Option<&str>) -> StorageResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| StorageError::Config("azure endpoint cannot be a base".into()))?;
            segments.pop_if_empty().push(&self.container);
            if let Some(key) = key {
                segments.extend(key.split('/'));
            }
        }
        Ok(url)
    }

    fn blob_url(&self, name: &str) -> StorageResult<Url> {
        validate_name(name)?;
        self.url(Some(&object_key(&self.prefix, name)))
    }

    async fn bearer_token(&self, cache: &tokio::sync::Mutex<Option<CachedToken>>) -> StorageResult<String> {
        let mut cached = cache.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .get(IMDS_TOKEN_URL)
            .query(&[("api-version", "2018-02-01"), ("resource", STORAGE_RESOURCE)])
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| StorageError::backend(BACKEND, format!("managed identity: {e}")))?;
        let body = checked(response).await?.text().await.map_err(transport_error)?;
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| StorageError::backend(BACKEND, format!("managed identity token: {e}")))?;

        let lifetime = token
            .expires_in
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .map_or(Duration::from_secs(3600), Duration::from_secs);
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(lifetime_secs = lifetime.as_secs(), "managed identity token refreshed");

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
        extra_headers: &[(&'static str, &str)],
    ) -> StorageResult<Response> {
        let mut ms_headers: Vec<(&str, String)> = vec![
            ("x-ms-date", rfc1123_now()?),
            ("x-ms-version", API_VERSION.to_string()),
        ];
        ms_headers.extend(extra_headers.iter().map(|(n, v)| (*n, (*v).to_string())));

        let content_length = body.as_ref().map_or(0, Bytes::len);
        let content_type = if body.is_some() { BLOB_CONTENT_TYPE } else { "" };

        let authorization = match &self.credential {
            Credential::SharedKey(key) => {
                let to_sign = string_to_sign(
                    &method,
                    content_length,
                    content_type,
                    &ms_headers,
                    &self.account,
                    &url,
                );
                format!("SharedKey {}:{}", self.account, sign(key, &to_sign)?)
            }
            Credential::ManagedIdentity(cache) => {
                format!("Bearer {}", self.bearer_token(cache).await?)
            }
        };

        let mut request = self.http.request(method, url);
        for (name, value) in &ms_headers {
            request = request.header(*name, value);
        }
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, content_type)
                .header(CONTENT_LENGTH, content_length)
                .body(body);
        }
        request
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> StorageError {
    StorageError::backend(BACKEND, err.to_string())
}

/// Turns a non-success response into a backend error carrying the status.
async fn checked(response: Response) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > 512 {
        let mut cut = 512;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(StorageError::backend(BACKEND, format!("{status}: {body}")))
}

fn rfc1123_now() -> StorageResult<String> {
    let format = time::macros::format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    time::OffsetDateTime::now_utc()
        .format(format)
        .map_err(|e| StorageError::backend(BACKEND, format!("date formatting: {e}")))
}

/// Builds the shared key string-to-sign for a Blob service request.
fn string_to_sign(
    method: &Method,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(&str, String)],
    account: &str,
    url: &Url,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort();

    let mut out = format!(
        "{method}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n",
        method = method.as_str()
    );
    for (name, value) in headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }

    out.push('/');
    out.push_str(account);
    out.push_str(url.path());

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect();
    params.sort();
    for (name, value) in params {
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(&value);
    }
    out
}

fn sign(key: &[u8], to_sign: &str) -> StorageResult<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::Config(format!("azure key: {e}")))?;
    mac.update(to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(&xml[start..end])
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extracts blob names and the continuation marker from a List Blobs page.
fn parse_list_page(xml: &str) -> (Vec<String>, Option<String>) {
    let mut keys = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Blob>") {
        let blob = &rest[start + "<Blob>".len()..];
        let end = blob.find("</Blob>").unwrap_or(blob.len());
        if let Some(name) = element_text(&blob[..end], "Name") {
            keys.push(unescape_xml(name));
        }
        rest = &blob[end..];
    }
    let marker = element_text(xml, "NextMarker")
        .map(unescape_xml)
        .filter(|m| !m.is_empty());
    (keys, marker)
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    #[instrument(skip(self), fields(backend = "azure", container = %self.container))]
    async fn download(&self, name: &str) -> StorageResult<Option<Bytes>> {
        let url = self.blob_url(name)?;
        let response = self.send(Method::GET, url, None, &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let data = checked(response).await?.bytes().await.map_err(transport_error)?;
        Ok(Some(data))
    }

    #[instrument(skip(self, data), fields(backend = "azure", container = %self.container, size = data.len()))]
    async fn upload(&self, name: &str, data: Bytes) -> StorageResult<()> {
        let url = self.blob_url(name)?;
        let response = self
            .send(Method::PUT, url, Some(data), &[("x-ms-blob-type", "BlockBlob")])
            .await?;
        checked(response).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "azure", container = %self.container))]
    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut url = self.url(None)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("restype", "container").append_pair("comp", "list");
                if !self.prefix.is_empty() {
                    query.append_pair("prefix", &self.prefix);
                }
                if let Some(marker) = marker.take() {
                    query.append_pair("marker", &marker);
                }
            }

            let response = self.send(Method::GET, url, None, &[]).await?;
            let body = checked(response).await?.text().await.map_err(transport_error)?;
            let (keys, next) = parse_list_page(&body);
            names.extend(
                keys.iter()
                    .filter_map(|k| logical_name(&self.prefix, k))
                    .map(str::to_string),
            );

            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(backend = "azure", container = %self.container))]
    async fn delete(&self, name: &str) -> StorageResult<()> {
        let url = self.blob_url(name)?;
        let response = self.send(Method::DELETE, url, None, &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        checked(response).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "azure", container = %self.container))]
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let url = self.blob_url(name)?;
        let response = self.send(Method::HEAD, url, None, &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        checked(response).await?;
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
