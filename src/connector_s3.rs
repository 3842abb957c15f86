//! Amazon S3 reader.
//!
//! Lists and downloads objects with the S3 REST API and AWS Signature V4.
//! Locators look like `s3://bucket/key`. Patterns may name a single key, a
//! prefix ending in `/`, or a glob over keys (`s3://bucket/docs/**/*.pdf`).
//!
//! A custom `endpoint_url` (MinIO, LocalStack) switches to path-style
//! addressing (`<endpoint>/<bucket>/<key>`) and keeps the endpoint's
//! scheme. Without one, virtual-hosted `https://<bucket>.s3.<region>.amazonaws.com`
//! is used.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional
//!
//! # ACL tags
//!
//! Object metadata `x-amz-meta-acl` holds comma-separated principals.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::Glob;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::S3SourceConfig;
use crate::error::IngestError;
use crate::models::SourceItem;
use crate::source::{detect_content_type, has_glob_meta, parse_acl_tags, SourceReader};

type HmacSha256 = Hmac<Sha256>;

const ACL_META_HEADER: &str = "x-amz-meta-acl";

pub struct S3Reader {
    config: S3SourceConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Reader {
    pub fn from_env(config: S3SourceConfig) -> Result<Self> {
        Ok(Self {
            config,
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, bucket: &str) -> Endpoint {
        match &self.config.endpoint_url {
            Some(url) => {
                let (scheme, rest) = match url.split_once("://") {
                    Some((s, r)) => (s.to_string(), r),
                    None => ("https".to_string(), url.as_str()),
                };
                Endpoint {
                    scheme,
                    host: rest.trim_end_matches('/').to_string(),
                    path_prefix: format!("/{}", bucket),
                }
            }
            None => Endpoint {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", bucket, self.config.region),
                path_prefix: String::new(),
            },
        }
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let endpoint = self.endpoint(bucket);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }
            query.sort_by(|a, b| a.0.cmp(&b.0));
            let canonical_query: String = query
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");

            let canonical_uri = if endpoint.path_prefix.is_empty() {
                "/".to_string()
            } else {
                endpoint.path_prefix.clone()
            };
            let url = format!(
                "{}://{}{}?{}",
                endpoint.scheme, endpoint.host, canonical_uri, canonical_query
            );

            let headers = sign_get(
                &self.creds,
                &self.config.region,
                &endpoint.host,
                &canonical_uri,
                &canonical_query,
                Utc::now(),
            );
            let mut req = self.client.get(&url);
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let resp = req
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", bucket, prefix))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            keys.extend(batch);

            if is_truncated && next_token.is_some() {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        debug!(bucket, prefix, count = keys.len(), "listed s3 objects");
        Ok(keys)
    }
}

struct Endpoint {
    scheme: String,
    host: String,
    /// `/<bucket>` for path-style addressing, empty for virtual-hosted.
    path_prefix: String,
}

#[async_trait]
impl SourceReader for S3Reader {
    async fn discover(&self, pattern: &str) -> Result<Vec<String>> {
        let (bucket, key_pattern) = split_s3_locator(pattern)
            .with_context(|| format!("Invalid S3 pattern: {}", pattern))?;

        let mut keys = if has_glob_meta(key_pattern) {
            let prefix = literal_prefix(key_pattern);
            let matcher = Glob::new(key_pattern)?.compile_matcher();
            self.list_keys(bucket, prefix)
                .await?
                .into_iter()
                .filter(|k| matcher.is_match(k))
                .collect()
        } else if key_pattern.is_empty() || key_pattern.ends_with('/') {
            self.list_keys(bucket, key_pattern).await?
        } else {
            vec![key_pattern.to_string()]
        };

        keys.retain(|k| !k.ends_with(".acl"));
        let mut locators: Vec<String> = keys
            .into_iter()
            .map(|k| format!("s3://{}/{}", bucket, k))
            .collect();
        locators.sort();
        locators.dedup();
        Ok(locators)
    }

    async fn open(&self, locator: &str) -> Result<SourceItem, IngestError> {
        let (bucket, key) = split_s3_locator(locator)
            .ok_or_else(|| IngestError::Source(format!("invalid S3 locator: {}", locator)))?;
        if key.is_empty() {
            return Err(IngestError::Source(format!("{} names no object key", locator)));
        }

        let endpoint = self.endpoint(bucket);
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("{}/{}", endpoint.path_prefix, encoded_key);
        let url = format!("{}://{}{}", endpoint.scheme, endpoint.host, canonical_uri);

        let headers = sign_get(
            &self.creds,
            &self.config.region,
            &endpoint.host,
            &canonical_uri,
            "",
            Utc::now(),
        );
        let mut req = self.client.get(&url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| IngestError::Source(format!("GET {}: {}", locator, e)))?;

        match resp.status().as_u16() {
            200..=299 => {}
            404 => return Err(IngestError::NotFound(locator.to_string())),
            401 | 403 => return Err(IngestError::AccessDenied(locator.to_string())),
            status => {
                return Err(IngestError::Source(format!(
                    "S3 GetObject failed (HTTP {}) for {}",
                    status, locator
                )))
            }
        }

        let resp_headers = resp.headers().clone();
        let last_modified = resp_headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        let acl = resp_headers
            .get(ACL_META_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(parse_acl_tags)
            .unwrap_or_default();

        let content = resp
            .bytes()
            .await
            .map_err(|e| IngestError::Source(format!("reading body of {}: {}", locator, e)))?
            .to_vec();

        let name = key.rsplit('/').next().unwrap_or(key).to_string();
        let content_type = detect_content_type(&name);

        Ok(SourceItem::new(locator, name, content, content_type, last_modified).with_acl(acl))
    }
}

/// Split `s3://bucket/key` into `(bucket, key)`.
fn split_s3_locator(locator: &str) -> Option<(&str, &str)> {
    let rest = locator.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return None;
    }
    Some((bucket, key))
}

/// Longest key prefix before the first glob component, ending at a `/`.
fn literal_prefix(pattern: &str) -> &str {
    let first_meta = pattern
        .find(|c: char| matches!(c, '*' | '?' | '[' | '{'))
        .unwrap_or(pattern.len());
    match pattern[..first_meta].rfind('/') {
        Some(i) => &pattern[..=i],
        None => "",
    }
}

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ AWS SigV4 ============

/// Headers (including `Authorization`) for a signed, empty-body GET.
///
/// `canonical_query` must already be sorted and URI-encoded.
fn sign_get(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    canonical_uri: &str,
    canonical_query: &str,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = hex_sha256(b"");

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "GET\n{}\n{}\n{}\n{}\n{}",
        canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    );

    // reqwest sets Host itself.
    headers.retain(|(k, _)| k != "host");
    headers.push(("authorization".to_string(), authorization));
    headers
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ ListObjectsV2 response ============

/// Keys (folder markers skipped), truncation flag, and continuation token.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let mut keys = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml_unescape(&xml[start..start + end]))
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
