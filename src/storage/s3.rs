//! S3-compatible object store client.
//!
//! Path-style requests (`{endpoint}/{bucket}/{key}`) signed with AWS
//! Signature Version 4. Works against AWS S3, MinIO and similar servers.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::{Method, Response, StatusCode, Url};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::S3Settings;
use crate::error::{EvidenceError, EvidenceResult};
use crate::storage::object_store::{CompletedPart, ObjectClient, ObjectInfo};
use crate::storage::ByteStream;

type HmacSha256 = Hmac<Sha256>;

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Static access key pair.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .finish()
    }
}

/// How long one request may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// Bounded end to end by the request timeout.
    Whole,
    /// Object bodies: only connect and each read are bounded, so large
    /// transfers on slow links are not cut off mid-stream.
    Idle,
}

#[derive(Debug, Clone)]
pub struct S3Client {
    http: reqwest::Client,
    request_timeout: Duration,
    endpoint: String,
    host: String,
    bucket: String,
    region: String,
    credentials: S3Credentials,
}

impl S3Client {
    pub fn new(
        endpoint: &str,
        bucket: impl Into<String>,
        region: impl Into<String>,
        credentials: S3Credentials,
        timeout: Duration,
    ) -> EvidenceResult<Self> {
        let url = Url::parse(endpoint)
            .map_err(|err| EvidenceError::Config(format!("invalid s3 endpoint {}: {}", endpoint, err)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(EvidenceError::Config(format!(
                    "s3 endpoint has no host: {}",
                    endpoint
                )))
            }
        };
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|err| EvidenceError::Config(format!("failed to build http client: {}", err)))?;

        Ok(Self {
            http,
            request_timeout: timeout,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            host,
            bucket: bucket.into(),
            region: region.into(),
            credentials,
        })
    }

    pub fn from_settings(settings: &S3Settings) -> EvidenceResult<Self> {
        if settings.bucket.trim().is_empty() {
            return Err(EvidenceError::Config("storage.s3.bucket is required".to_string()));
        }
        Self::new(
            &settings.endpoint,
            settings.bucket.clone(),
            settings.region.clone(),
            S3Credentials {
                access_key: settings.access_key.clone(),
                secret_key: settings.secret_key.clone(),
            },
            Duration::from_millis(settings.request_timeout_ms),
        )
    }

    fn object_path(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("/{}/{}", uri_encode(&self.bucket, true), uri_encode(key, false)),
            None => format!("/{}", uri_encode(&self.bucket, true)),
        }
    }

    fn authorization(
        &self,
        method: &Method,
        path: &str,
        query: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method.as_str(),
            path,
            query,
            self.host,
            payload_hash,
            amz_date,
            SIGNED_HEADERS,
            payload_hash
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            SIGNING_ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signing_key = derive_signing_key(&self.credentials.secret_key, &date, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            SIGNING_ALGORITHM, self.credentials.access_key, scope, SIGNED_HEADERS, signature
        )
    }

    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(&str, &str)],
        body: Vec<u8>,
        deadline: Deadline,
    ) -> EvidenceResult<Response> {
        let path = self.object_path(key);
        let query = canonical_query(query);
        let payload_hash = hex::encode(Sha256::digest(&body));
        let now = Utc::now();
        let authorization = self.authorization(&method, &path, &query, &payload_hash, now);

        let url = if query.is_empty() {
            format!("{}{}", self.endpoint, path)
        } else {
            format!("{}{}?{}", self.endpoint, path, query)
        };
        debug!(method = %method, url = %url, "s3 request");

        let mut request = self
            .http
            .request(method, url)
            .header("x-amz-date", now.format("%Y%m%dT%H%M%SZ").to_string())
            .header("x-amz-content-sha256", payload_hash)
            .header(AUTHORIZATION, authorization)
            .body(body);
        if deadline == Deadline::Whole {
            request = request.timeout(self.request_timeout);
        }
        request
            .send()
            .await
            .map_err(|err| EvidenceError::storage(format!("s3 request failed: {}", err)))
    }
}

async fn ensure_success(response: Response, action: &str) -> EvidenceResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(EvidenceError::storage(format!(
        "s3 {} failed with {}: {}",
        action, status, body
    )))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SigV4 signing key for one day, region and service.
pub(crate) fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding as required by SigV4.
pub(crate) fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

pub(crate) fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (uri_encode(key, true), uri_encode(value, true)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn xml_error(err: impl std::fmt::Display) -> EvidenceError {
    EvidenceError::storage(format!("invalid s3 response: {}", err))
}

/// Extract the text of the first `<UploadId>` element.
pub(crate) fn parse_upload_id(xml: &str) -> EvidenceResult<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_upload_id = false;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => in_upload_id = start.local_name().as_ref() == b"UploadId",
            Event::Text(text) if in_upload_id => {
                return Ok(text.unescape().map_err(xml_error)?.into_owned());
            }
            Event::End(_) => in_upload_id = false,
            Event::Eof => return Err(xml_error("missing UploadId")),
            _ => {}
        }
    }
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub next_token: Option<String>,
}

pub(crate) fn parse_list_page(xml: &str) -> EvidenceResult<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut truncated = false;
    let mut element = String::new();
    let mut in_contents = false;
    let mut key = String::new();
    let mut size = 0u64;
    let mut last_modified = Utc::now();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => {
                element = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                if element == "Contents" {
                    in_contents = true;
                    key.clear();
                    size = 0;
                }
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(xml_error)?;
                match (in_contents, element.as_str()) {
                    (true, "Key") => key = value.into_owned(),
                    (true, "Size") => size = value.parse().map_err(xml_error)?,
                    (true, "LastModified") => {
                        last_modified = DateTime::parse_from_rfc3339(&value)
                            .map_err(xml_error)?
                            .with_timezone(&Utc)
                    }
                    (false, "IsTruncated") => truncated = value == "true",
                    (false, "NextContinuationToken") => page.next_token = Some(value.into_owned()),
                    _ => {}
                }
            }
            Event::End(end) => {
                if end.local_name().as_ref() == b"Contents" {
                    in_contents = false;
                    page.objects.push(ObjectInfo {
                        key: std::mem::take(&mut key),
                        size,
                        last_modified,
                    });
                }
                element.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !truncated {
        page.next_token = None;
    }
    Ok(page)
}

fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            quick_xml::escape::escape(part.etag.as_str())
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[async_trait]
impl ObjectClient for S3Client {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> EvidenceResult<()> {
        let response = self
            .send(Method::PUT, Some(key), &[], body, Deadline::Idle)
            .await?;
        ensure_success(response, "put object").await?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> EvidenceResult<String> {
        let response = self
            .send(
                Method::POST,
                Some(key),
                &[("uploads", "")],
                Vec::new(),
                Deadline::Whole,
            )
            .await?;
        let response = ensure_success(response, "create multipart upload").await?;
        let body = response
            .text()
            .await
            .map_err(|err| EvidenceError::storage(err.to_string()))?;
        parse_upload_id(&body)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> EvidenceResult<String> {
        let part = part_number.to_string();
        let response = self
            .send(
                Method::PUT,
                Some(key),
                &[("partNumber", part.as_str()), ("uploadId", upload_id)],
                body,
                Deadline::Idle,
            )
            .await?;
        let response = ensure_success(response, "upload part").await?;
        response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| EvidenceError::storage("upload part response without ETag"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EvidenceResult<()> {
        let response = self
            .send(
                Method::POST,
                Some(key),
                &[("uploadId", upload_id)],
                complete_body(parts).into_bytes(),
                Deadline::Whole,
            )
            .await?;
        let response = ensure_success(response, "complete multipart upload").await?;
        // S3 may report a failed completion inside a 200 response.
        let body = response
            .text()
            .await
            .map_err(|err| EvidenceError::storage(err.to_string()))?;
        if body.contains("<Error>") {
            return Err(EvidenceError::storage(format!(
                "s3 complete multipart upload failed: {}",
                body
            )));
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> EvidenceResult<()> {
        let response = self
            .send(
                Method::DELETE,
                Some(key),
                &[("uploadId", upload_id)],
                Vec::new(),
                Deadline::Whole,
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response, "abort multipart upload").await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> EvidenceResult<Option<ByteStream>> {
        let response = self
            .send(Method::GET, Some(key), &[], Vec::new(), Deadline::Idle)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response, "get object").await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(io::Error::other))
            .boxed();
        Ok(Some(stream))
    }

    async fn head_object(&self, key: &str) -> EvidenceResult<Option<ObjectInfo>> {
        let response = self
            .send(Method::HEAD, Some(key), &[], Vec::new(), Deadline::Whole)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response, "head object").await?;
        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(|value| value.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size,
            last_modified,
        }))
    }

    async fn delete_object(&self, key: &str) -> EvidenceResult<()> {
        let response = self
            .send(Method::DELETE, Some(key), &[], Vec::new(), Deadline::Whole)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response, "delete object").await?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> EvidenceResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = token.as_deref() {
                query.push(("continuation-token", token));
            }
            let response = self
                .send(Method::GET, None, &query, Vec::new(), Deadline::Whole)
                .await?;
            let response = ensure_success(response, "list objects").await?;
            let body = response
                .text()
                .await
                .map_err(|err| EvidenceError::storage(err.to_string()))?;
            let page = parse_list_page(&body)?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }
}
