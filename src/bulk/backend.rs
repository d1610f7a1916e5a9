//! Backend transports used to authorize resources.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HeaderMap};
use reqwest::redirect::Policy;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

use super::context::{RequestContext, RotatedCredentials};
use super::services::{Service, resource_path};
use crate::cache::CacheControl;

pub const BULK_PATH: &str = "/link-lib/bulk";
pub const BULK_RESOURCE_FIELD: &str = "resource[]";
pub const HEXTUPLE_MEDIA_TYPE: &str = "application/hex+x-ndjson";
const FORM_MEDIA_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_MEDIA_TYPE: &str = "application/json";

const HEADER_WEBSITE_IRI: &str = "Website-IRI";
const HEADER_FORWARDED_HOST: &str = "X-Forwarded-Host";
const HEADER_NEW_AUTHORIZATION: &str = "New-Authorization";
const HEADER_NEW_REFRESH_TOKEN: &str = "New-Refresh-Token";

/// One resource as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawResource {
    pub iri: String,
    pub status: u16,
    #[serde(default)]
    pub cache: CacheControl,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// A backend payload together with any credentials it rotated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply<T> {
    pub payload: T,
    pub credentials: Option<RotatedCredentials>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to service `{service}` failed: {source}")]
    Transport {
        service: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("service `{service}` answered bulk request with status {status}")]
    UnexpectedStatus { service: String, status: u16 },
    #[error("service `{service}` returned an undecodable payload: {message}")]
    Decode { service: String, message: String },
    #[error("invalid url for service `{service}`: {message}")]
    InvalidUrl { service: String, message: String },
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

impl BackendError {
    /// Whether the service could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Transport { .. })
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Authorize every IRI in one call; any non-success status fails the whole call.
    async fn bulk(
        &self,
        service: &Service,
        iris: &[String],
        ctx: &RequestContext,
    ) -> Result<BackendReply<Vec<RawResource>>, BackendError>;

    /// Fetch a single resource; HTTP error statuses are reported in the resource.
    async fn plain(
        &self,
        service: &Service,
        iri: &str,
        ctx: &RequestContext,
    ) -> Result<BackendReply<RawResource>, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    /// Redirects are not followed so a redirected bulk call surfaces as a failure.
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(BackendError::Client)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn context_headers(
        &self,
        request: reqwest::RequestBuilder,
        ctx: &RequestContext,
    ) -> reqwest::RequestBuilder {
        let mut request = request
            .header(ACCEPT_LANGUAGE, ctx.language())
            .header(HEADER_WEBSITE_IRI, ctx.website_iri().as_str());
        if let Some(host) = ctx.forwarded_host() {
            request = request.header(HEADER_FORWARDED_HOST, host);
        }
        if let Some(authorization) = ctx.authorization() {
            request = request.header(AUTHORIZATION, authorization);
        }
        request
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn bulk(
        &self,
        service: &Service,
        iris: &[String],
        ctx: &RequestContext,
    ) -> Result<BackendReply<Vec<RawResource>>, BackendError> {
        let url = join(service, BULK_PATH)?;
        debug!(service = %service.name, url = %url, resources = iris.len(), "Issuing bulk request");

        let request = self
            .client
            .post(url)
            .header(ACCEPT, JSON_MEDIA_TYPE)
            .header(CONTENT_TYPE, FORM_MEDIA_TYPE)
            .body(bulk_form_body(iris));
        let response = self
            .context_headers(request, ctx)
            .send()
            .await
            .map_err(|source| transport(service, source))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::UnexpectedStatus {
                service: service.name.clone(),
                status: status.as_u16(),
            });
        }

        let credentials = rotated_credentials(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|source| transport(service, source))?;
        let payload: Vec<RawResource> =
            serde_json::from_slice(&body).map_err(|err| BackendError::Decode {
                service: service.name.clone(),
                message: err.to_string(),
            })?;

        Ok(BackendReply {
            payload,
            credentials,
        })
    }

    async fn plain(
        &self,
        service: &Service,
        iri: &str,
        ctx: &RequestContext,
    ) -> Result<BackendReply<RawResource>, BackendError> {
        let url = join(service, &resource_path(iri))?;
        debug!(service = %service.name, url = %url, "Issuing plain request");

        let request = self.client.get(url).header(ACCEPT, HEXTUPLE_MEDIA_TYPE);
        let response = self
            .context_headers(request, ctx)
            .send()
            .await
            .map_err(|source| transport(service, source))?;

        let status = response.status();
        let credentials = rotated_credentials(response.headers());
        let cache = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .map(CacheControl::from_header)
            .unwrap_or_default();
        let body = response
            .text()
            .await
            .map_err(|source| transport(service, source))?;

        Ok(BackendReply {
            payload: RawResource {
                iri: iri.to_string(),
                status: status.as_u16(),
                cache,
                language: Some(ctx.language().to_string()),
                body: status.is_success().then_some(body),
            },
            credentials,
        })
    }
}

/// Form body carrying one `resource[]` field per IRI.
pub fn bulk_form_body(iris: &[String]) -> String {
    let mut form = form_urlencoded::Serializer::new(String::new());
    for iri in iris {
        form.append_pair(BULK_RESOURCE_FIELD, iri);
    }
    form.finish()
}

fn join(service: &Service, path: &str) -> Result<reqwest::Url, BackendError> {
    let base = service.base_url.as_str().trim_end_matches('/');
    reqwest::Url::parse(&format!("{base}{path}")).map_err(|err| BackendError::InvalidUrl {
        service: service.name.clone(),
        message: err.to_string(),
    })
}

fn transport(service: &Service, source: reqwest::Error) -> BackendError {
    BackendError::Transport {
        service: service.name.clone(),
        source,
    }
}

fn rotated_credentials(headers: &HeaderMap) -> Option<RotatedCredentials> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    header(HEADER_NEW_AUTHORIZATION).map(|authorization| RotatedCredentials {
        authorization,
        refresh_token: header(HEADER_NEW_REFRESH_TOKEN),
    })
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use url::Url;

    use super::*;
    use crate::bulk::services::ServiceCapability;

    fn service(server: &MockServer, capability: ServiceCapability) -> Service {
        Service::new(
            "data",
            Url::parse(&server.base_url()).expect("mock url"),
            capability,
        )
    }

    fn context() -> RequestContext {
        RequestContext::new(Url::parse("https://example.org").expect("url"), "nl")
            .with_authorization("Bearer token")
    }

    fn backend() -> HttpBackend {
        HttpBackend::new(Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn form_body_repeats_resource_field() {
        let body = bulk_form_body(&["https://ex/1".to_string(), "https://ex/2?a=b".to_string()]);
        assert_eq!(
            body,
            "resource%5B%5D=https%3A%2F%2Fex%2F1&resource%5B%5D=https%3A%2F%2Fex%2F2%3Fa%3Db"
        );
    }

    #[test]
    fn raw_resource_tolerates_missing_fields() {
        let parsed: Vec<RawResource> =
            serde_json::from_str(r#"[{"iri":"https://ex/1","status":404}]"#).expect("json");
        assert_eq!(parsed[0].cache, CacheControl::None);
        assert_eq!(parsed[0].body, None);
    }

    #[tokio::test]
    async fn bulk_posts_form_and_decodes_resources() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method("POST")
                    .path("/link-lib/bulk")
                    .header("accept-language", "nl")
                    .header("authorization", "Bearer token")
                    .header("website-iri", "https://example.org/")
                    .header("x-forwarded-host", "example.org");
                then.status(200)
                    .header("content-type", "application/json")
                    .header("new-authorization", "Bearer rotated")
                    .header("new-refresh-token", "refresh")
                    .body(
                        r#"[{"iri":"https://ex/1","status":200,"cache":"public","language":"nl","body":"b1"},
                            {"iri":"https://ex/2","status":403,"cache":"private","language":"nl","body":null}]"#,
                    );
            })
            .await;

        let reply = backend()
            .bulk(
                &service(&server, ServiceCapability::Bulk),
                &["https://ex/1".to_string(), "https://ex/2".to_string()],
                &context(),
            )
            .await
            .expect("bulk reply");

        mock.assert_async().await;
        assert_eq!(reply.payload.len(), 2);
        assert_eq!(reply.payload[0].cache, CacheControl::Public);
        assert_eq!(reply.payload[1].status, 403);
        assert_eq!(
            reply.credentials,
            Some(RotatedCredentials {
                authorization: "Bearer rotated".into(),
                refresh_token: Some("refresh".into()),
            })
        );
    }

    #[tokio::test]
    async fn bulk_redirect_is_a_hard_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method("POST").path("/link-lib/bulk");
                then.status(302).header("location", "/login");
            })
            .await;

        let err = backend()
            .bulk(
                &service(&server, ServiceCapability::Bulk),
                &["https://ex/1".to_string()],
                &context(),
            )
            .await
            .expect_err("redirect");
        assert!(matches!(err, BackendError::UnexpectedStatus { status: 302, .. }));
    }

    #[tokio::test]
    async fn bulk_garbage_is_a_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method("POST").path("/link-lib/bulk");
                then.status(200).body("not json");
            })
            .await;

        let err = backend()
            .bulk(
                &service(&server, ServiceCapability::Bulk),
                &["https://ex/1".to_string()],
                &context(),
            )
            .await
            .expect_err("decode");
        assert!(matches!(err, BackendError::Decode { .. }));
    }

    #[tokio::test]
    async fn plain_derives_visibility_from_cache_control() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method("GET")
                    .path("/things/1")
                    .header("accept", HEXTUPLE_MEDIA_TYPE);
                then.status(200)
                    .header("cache-control", "private, max-age=0")
                    .body("[\"_:b0\"]\n");
            })
            .await;

        let reply = backend()
            .plain(
                &service(&server, ServiceCapability::Plain),
                "https://example.org/things/1",
                &context(),
            )
            .await
            .expect("plain reply");

        mock.assert_async().await;
        assert_eq!(reply.payload.iri, "https://example.org/things/1");
        assert_eq!(reply.payload.cache, CacheControl::Private);
        assert_eq!(reply.payload.body.as_deref(), Some("[\"_:b0\"]\n"));
        assert_eq!(reply.credentials, None);
    }

    #[tokio::test]
    async fn plain_error_status_is_reported_not_raised() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method("GET").path("/missing");
                then.status(404).body("not here");
            })
            .await;

        let reply = backend()
            .plain(
                &service(&server, ServiceCapability::Plain),
                "https://example.org/missing",
                &context(),
            )
            .await
            .expect("plain reply");

        assert_eq!(reply.payload.status, 404);
        assert_eq!(reply.payload.body, None);
        assert_eq!(reply.payload.cache, CacheControl::None);
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_error() {
        let unreachable = Service::new(
            "gone",
            Url::parse("http://127.0.0.1:9").expect("url"),
            ServiceCapability::Plain,
        );
        let err = backend()
            .plain(&unreachable, "https://example.org/x", &context())
            .await
            .expect_err("transport");
        assert!(err.is_transport());
    }
}
