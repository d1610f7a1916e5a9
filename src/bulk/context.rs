//! Per-request tenant and session context.

use tokio::sync::watch;
use url::Url;

/// Credentials the backend rotated while answering a request.
///
/// The session layer persists these; this crate only surfaces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedCredentials {
    pub authorization: String,
    pub refresh_token: Option<String>,
}

/// Who is asking, for which website and in which language.
#[derive(Debug)]
pub struct RequestContext {
    website_iri: Url,
    language: String,
    authorization: Option<String>,
    forwarded_host: Option<String>,
    rotated: watch::Sender<Option<RotatedCredentials>>,
}

impl RequestContext {
    pub fn new(website_iri: Url, language: impl Into<String>) -> Self {
        let forwarded_host = website_iri.host_str().map(|host| match website_iri.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        });
        let (rotated, _) = watch::channel(None);
        Self {
            website_iri,
            language: language.into(),
            authorization: None,
            forwarded_host,
            rotated,
        }
    }

    /// Attach the `Authorization` header value forwarded to backends.
    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = Some(authorization.into());
        self
    }

    pub fn with_forwarded_host(mut self, host: impl Into<String>) -> Self {
        self.forwarded_host = Some(host.into());
        self
    }

    pub fn website_iri(&self) -> &Url {
        &self.website_iri
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    pub fn forwarded_host(&self) -> Option<&str> {
        self.forwarded_host.as_deref()
    }

    /// Receiver notified whenever a backend hands out new credentials.
    pub fn subscribe_rotations(&self) -> watch::Receiver<Option<RotatedCredentials>> {
        self.rotated.subscribe()
    }

    /// Most recent rotated credentials seen during this request.
    pub fn rotated_credentials(&self) -> Option<RotatedCredentials> {
        self.rotated.borrow().clone()
    }

    /// Never waits on receivers; the latest rotation wins.
    pub(crate) fn publish_rotation(&self, credentials: RotatedCredentials) {
        self.rotated.send_replace(Some(credentials));
    }
}
