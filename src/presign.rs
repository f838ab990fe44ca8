//! Query-string authenticated (presigned) URLs.
//!
//! The signature is HMAC-SHA1 over
//!
//! ```text
//! VERB \n \n ContentType \n Expires \n [x-amz-security-token:Token \n]
//! /bucket/key?response-content-disposition=attachment
//! ```
//!
//! base64-encoded and carried in the `Signature` query parameter.

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::query::{escape_path, has_dot_segment};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Longest expiry the service accepts (one week).
pub const MAX_EXPIRY_SECS: u32 = 604_800;

const DISPOSITION: &str = "response-content-disposition=attachment";

#[derive(Debug, Clone)]
pub struct PresignOptions {
    pub expires_in: u32,
    pub method: Method,
    pub content_type: Option<String>,
}

impl Default for PresignOptions {
    fn default() -> Self {
        Self {
            expires_in: 3600,
            method: Method::GET,
            content_type: None,
        }
    }
}

pub fn string_to_sign(
    method: &Method,
    content_type: &str,
    expires: i64,
    session_token: Option<&str>,
    bucket: &str,
    escaped_key: &str,
) -> String {
    let token_line = session_token
        .map(|token| format!("x-amz-security-token:{}\n", token))
        .unwrap_or_default();
    format!(
        "{}\n\n{}\n{}\n{}/{}/{}?{}",
        method.as_str(),
        content_type,
        expires,
        token_line,
        bucket,
        escaped_key,
        DISPOSITION
    )
}

/// Build a presigned URL under `base_url` (the bucket's URL, no trailing slash).
pub fn presign_url(
    base_url: &str,
    credentials: &Credentials,
    bucket: &str,
    key: &str,
    options: &PresignOptions,
    now: DateTime<Utc>,
) -> Result<String> {
    if options.expires_in > MAX_EXPIRY_SECS {
        return Err(Error::InvalidArgument(format!(
            "Max expiration for presigned URLs is one week, or {} seconds, got {} instead",
            MAX_EXPIRY_SECS, options.expires_in
        )));
    }

    if has_dot_segment(key) {
        return Err(Error::InvalidArgument(format!(
            "key '{}' has a '.' or '..' segment and cannot be addressed",
            key
        )));
    }

    let escaped_key = escape_path(key);
    let expires = now.timestamp() + i64::from(options.expires_in);
    let to_sign = string_to_sign(
        &options.method,
        options.content_type.as_deref().unwrap_or_default(),
        expires,
        credentials.session_token.as_deref(),
        bucket,
        &escaped_key,
    );

    let mut mac = HmacSha1::new_from_slice(credentials.secret_access_key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let mut url = format!(
        "{}/{}?{}&AWSAccessKeyId={}&Expires={}&Signature={}",
        base_url,
        escaped_key,
        DISPOSITION,
        urlencoding::encode(&credentials.access_key_id),
        expires,
        urlencoding::encode(&signature)
    );
    if let Some(token) = &credentials.session_token {
        url.push_str("&x-amz-security-token=");
        url.push_str(&urlencoding::encode(token));
    }
    Ok(url)
}
