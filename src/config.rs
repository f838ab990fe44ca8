use crate::error::{Error, Result};
use std::env;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Region used when neither the caller nor the environment names one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default host template for AWS endpoints; `{region}` is substituted.
pub const AWS_HOST_TEMPLATE: &str = "s3.{region}.amazonaws.com";

/// Default multipart part size (50 MiB).
pub const DEFAULT_PART_SIZE: usize = 50 * 1024 * 1024;

/// Access credentials used to sign requests
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::Configuration("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_access_key = env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::Configuration("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
        let session_token = env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where requests are sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Regional AWS endpoint built from a host template.
    Aws {
        host_template: String,
        path_style: bool,
    },
    /// Fixed base URL of an S3-compatible server. Always path style.
    Custom(Url),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Aws {
            host_template: AWS_HOST_TEMPLATE.to_string(),
            path_style: false,
        }
    }
}

impl Endpoint {
    pub fn custom(base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url)?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(Error::Configuration(format!(
                "endpoint '{}' is not a base URL",
                base_url
            )));
        }
        Ok(Endpoint::Custom(url))
    }

    /// Base URL for `bucket` in `region`; an empty bucket addresses the service root.
    ///
    /// The returned string never ends with `/`, so a resource path from
    /// [`crate::query::resource_path`] can be appended directly.
    pub fn base_url(&self, bucket: &str, region: &str) -> String {
        match self {
            Endpoint::Aws {
                host_template,
                path_style,
            } => {
                let host = host_template.replace("{region}", region);
                if bucket.is_empty() {
                    format!("https://{}", host)
                } else if *path_style {
                    format!("https://{}/{}", host, bucket)
                } else {
                    format!("https://{}.{}", bucket, host)
                }
            }
            Endpoint::Custom(url) => {
                let base = url.as_str().trim_end_matches('/');
                if bucket.is_empty() {
                    base.to_string()
                } else {
                    format!("{}/{}", base, bucket)
                }
            }
        }
    }
}

/// Immutable per-session endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Default region for buckets not present in the region cache.
    pub region: String,
    pub credentials: Credentials,
    pub endpoint: Endpoint,
}

impl EndpointConfig {
    pub fn new(region: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            region: region.into(),
            credentials,
            endpoint: Endpoint::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Use path-style addressing on AWS endpoints
    pub fn with_path_style(mut self) -> Self {
        if let Endpoint::Aws { path_style, .. } = &mut self.endpoint {
            *path_style = true;
        }
        self
    }

    /// Build a config from the standard AWS environment variables.
    ///
    /// `S3_ENDPOINT_URL` switches to a custom (path style) endpoint.
    pub fn from_env() -> Result<Self> {
        let credentials = Credentials::from_env()?;
        let region = env::var("AWS_REGION")
            .or_else(|_| env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| DEFAULT_REGION.to_string());

        let mut config = Self::new(region, credentials);
        if let Ok(url) = env::var("S3_ENDPOINT_URL") {
            config.endpoint = Endpoint::custom(&url)?;
        }
        Ok(config)
    }
}

/// Tunables that are not part of the endpoint identity
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Base delay of the transient-error policies; doubles per attempt.
    pub retry_delay: Duration,
    /// Upper bound for a single retry delay.
    pub max_retry_delay: Duration,
    /// Whole-request timeout handed to the HTTP client.
    pub timeout: Option<Duration>,
    /// Part size used by streamed multipart uploads.
    pub part_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(8),
            timeout: None,
            part_size: DEFAULT_PART_SIZE,
        }
    }
}
