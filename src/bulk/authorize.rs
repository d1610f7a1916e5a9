//! Authorizes resources the cache cannot serve on its own.
//!
//! Requests are grouped by the service that owns them. Bulk services get one
//! call per group; plain services get one call per resource. Groups run
//! concurrently and their results are yielded in order of first appearance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use metrics::histogram;
use tracing::{debug, warn};

use super::backend::{Backend, BackendError, BackendReply, RawResource};
use super::blank_nodes::{new_scope, scope_blank_nodes};
use super::context::RequestContext;
use super::services::{Service, ServiceCapability, ServiceResolver};
use crate::cache::{CacheControl, CacheEntry, CacheRequest};

const METRIC_AUTHORIZE_MS: &str = "ldcache_authorize_ms";
/// Concurrent calls within one plain-service group.
const PLAIN_CONCURRENCY: usize = 8;
const UNREACHABLE_STATUS: u16 = 502;

/// A resource awaiting authorization, with its stale non-public entry if one was cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub request: CacheRequest,
    pub stale: Option<CacheEntry>,
}

impl Pending {
    pub fn fresh(request: CacheRequest) -> Self {
        Self {
            request,
            stale: None,
        }
    }

    pub fn stale(entry: CacheEntry) -> Self {
        Self {
            request: entry.request(),
            stale: Some(entry),
        }
    }
}

#[derive(Clone)]
pub struct Authorizer {
    backend: Arc<dyn Backend>,
    resolver: Arc<dyn ServiceResolver>,
}

impl Authorizer {
    pub fn new(backend: Arc<dyn Backend>, resolver: Arc<dyn ServiceResolver>) -> Self {
        Self {
            backend,
            resolver,
        }
    }

    /// Authorize `pending` against the backends.
    ///
    /// A failed bulk call ends the stream with that error. Plain calls never
    /// fail the stream: unreachable services yield the stale entry when one
    /// exists and a `502` entry otherwise.
    pub fn authorize(
        &self,
        ctx: Arc<RequestContext>,
        pending: Vec<Pending>,
    ) -> BoxStream<'static, Result<CacheEntry, BackendError>> {
        let groups = group_by_service(self.resolver.as_ref(), pending);
        debug!(groups = groups.len(), "Authorizing resources");
        let concurrency = groups.len().max(1);
        let authorizer = self.clone();

        stream::iter(groups)
            .map(move |(service, members)| {
                let authorizer = authorizer.clone();
                let ctx = Arc::clone(&ctx);
                async move { authorizer.authorize_group(service, members, ctx).await }
            })
            .buffered(concurrency)
            .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, BackendError>)))
            .try_flatten()
            .boxed()
    }

    async fn authorize_group(
        &self,
        service: Arc<Service>,
        members: Vec<Pending>,
        ctx: Arc<RequestContext>,
    ) -> Result<Vec<CacheEntry>, BackendError> {
        let started = Instant::now();
        let result = match service.capability {
            ServiceCapability::Bulk => self.authorize_bulk(&service, members, &ctx).await,
            ServiceCapability::Plain => Ok(self.authorize_plain(&service, members, &ctx).await),
        };
        histogram!(METRIC_AUTHORIZE_MS, "mode" => mode_label(service.capability))
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        result
    }

    async fn authorize_bulk(
        &self,
        service: &Service,
        members: Vec<Pending>,
        ctx: &RequestContext,
    ) -> Result<Vec<CacheEntry>, BackendError> {
        let iris: Vec<String> = members.into_iter().map(|p| p.request.iri).collect();
        let reply = self.backend.bulk(service, &iris, ctx).await.inspect_err(|err| {
            warn!(service = %service.name, resources = iris.len(), error = %err, "Bulk authorization failed");
        })?;
        Ok(reconcile(service, ctx, iris, accept_reply(ctx, reply)))
    }

    async fn authorize_plain(
        &self,
        service: &Service,
        members: Vec<Pending>,
        ctx: &RequestContext,
    ) -> Vec<CacheEntry> {
        stream::iter(members)
            .map(|pending| async move {
                match self.backend.plain(service, &pending.request.iri, ctx).await {
                    Ok(reply) => into_entry(accept_reply(ctx, reply)),
                    Err(err) => fallback(service, pending, &err),
                }
            })
            .buffered(PLAIN_CONCURRENCY)
            .collect()
            .await
    }
}

fn group_by_service(
    resolver: &dyn ServiceResolver,
    pending: Vec<Pending>,
) -> Vec<(Arc<Service>, Vec<Pending>)> {
    pending
        .into_iter()
        .fold(Vec::new(), |mut groups: Vec<(Arc<Service>, Vec<Pending>)>, item| {
            let service = resolver.resolve(&item.request.iri);
            match groups.iter_mut().find(|(known, _)| known.name == service.name) {
                Some((_, members)) => members.push(item),
                None => groups.push((service, vec![item])),
            }
            groups
        })
}

/// Match a bulk reply to the requested IRIs, in request order.
///
/// Requested resources the reply lacks become `502` entries, unrequested
/// ones are dropped, and resources answered in another language lose their
/// public visibility so they are never cached under the requested one.
fn reconcile(
    service: &Service,
    ctx: &RequestContext,
    requested: Vec<String>,
    resources: Vec<RawResource>,
) -> Vec<CacheEntry> {
    let mut answered: HashMap<String, RawResource> = HashMap::with_capacity(resources.len());
    for resource in resources {
        if requested.contains(&resource.iri) {
            answered.insert(resource.iri.clone(), resource);
        } else {
            warn!(service = %service.name, iri = %resource.iri, "Dropping unrequested resource from bulk reply");
        }
    }

    requested
        .into_iter()
        .map(|iri| match answered.get(&iri) {
            Some(resource) => {
                let mut resource = resource.clone();
                if resource
                    .language
                    .as_deref()
                    .is_some_and(|lang| !lang.eq_ignore_ascii_case(ctx.language()))
                {
                    debug!(
                        service = %service.name,
                        iri = %iri,
                        answered = resource.language.as_deref().unwrap_or_default(),
                        requested = ctx.language(),
                        "Bulk reply in another language; not caching"
                    );
                    if resource.cache == CacheControl::Public {
                        resource.cache = CacheControl::NoCache;
                    }
                }
                into_entry(resource)
            }
            None => {
                warn!(service = %service.name, iri = %iri, "Bulk reply is missing a requested resource");
                CacheEntry::failed(iri, UNREACHABLE_STATUS)
            }
        })
        .collect()
}

fn accept_reply<T>(ctx: &RequestContext, reply: BackendReply<T>) -> T {
    if let Some(credentials) = reply.credentials {
        ctx.publish_rotation(credentials);
    }
    reply.payload
}

fn into_entry(resource: RawResource) -> CacheEntry {
    let contents = resource
        .body
        .map(|body| scope_blank_nodes(&body, &new_scope()));
    CacheEntry::new(resource.iri, resource.status, resource.cache, contents)
}

fn fallback(service: &Service, pending: Pending, err: &BackendError) -> CacheEntry {
    match pending.stale {
        Some(stale) if err.is_transport() => {
            warn!(service = %service.name, iri = %stale.iri, error = %err, "Serving stale entry for unreachable service");
            stale
        }
        _ => {
            warn!(service = %service.name, iri = %pending.request.iri, error = %err, "Plain authorization failed");
            CacheEntry::failed(pending.request.iri, UNREACHABLE_STATUS)
        }
    }
}

fn mode_label(capability: ServiceCapability) -> &'static str {
    match capability {
        ServiceCapability::Bulk => "bulk",
        ServiceCapability::Plain => "plain",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::bulk::context::RotatedCredentials;
    use crate::bulk::services::ServiceRegistry;

    #[derive(Default)]
    struct ScriptedBackend {
        bulk_calls: Mutex<Vec<(String, Vec<String>)>>,
        plain_calls: Mutex<Vec<String>>,
        reject_bulk: bool,
        unreachable: Vec<String>,
        omitted: Vec<String>,
        unrequested: Vec<String>,
        language: Option<String>,
    }

    async fn transport_error(service: &Service) -> BackendError {
        let source = reqwest::get("http://127.0.0.1:9/")
            .await
            .expect_err("nothing listens on the discard port");
        BackendError::Transport {
            service: service.name.clone(),
            source,
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn bulk(
            &self,
            service: &Service,
            iris: &[String],
            _ctx: &RequestContext,
        ) -> Result<BackendReply<Vec<RawResource>>, BackendError> {
            self.bulk_calls
                .lock()
                .expect("lock")
                .push((service.name.clone(), iris.to_vec()));
            if self.reject_bulk {
                return Err(BackendError::UnexpectedStatus {
                    service: service.name.clone(),
                    status: 302,
                });
            }
            Ok(BackendReply {
                payload: iris
                    .iter()
                    .filter(|iri| !self.omitted.contains(iri))
                    .chain(&self.unrequested)
                    .map(|iri| RawResource {
                        iri: iri.clone(),
                        status: 200,
                        cache: CacheControl::Public,
                        language: self.language.clone(),
                        body: Some(format!("[\"_:b0\",\"{iri}\"]\n")),
                    })
                    .collect(),
                credentials: Some(RotatedCredentials {
                    authorization: "Bearer rotated".into(),
                    refresh_token: None,
                }),
            })
        }

        async fn plain(
            &self,
            service: &Service,
            iri: &str,
            _ctx: &RequestContext,
        ) -> Result<BackendReply<RawResource>, BackendError> {
            self.plain_calls.lock().expect("lock").push(iri.to_string());
            if self.unreachable.iter().any(|u| u == iri) {
                return Err(transport_error(service).await);
            }
            Ok(BackendReply {
                payload: RawResource {
                    iri: iri.to_string(),
                    status: 200,
                    cache: CacheControl::Private,
                    language: None,
                    body: Some("[\"_:b0\"]\n".to_string()),
                },
                credentials: None,
            })
        }
    }

    fn url(value: &str) -> Url {
        Url::parse(value).expect("valid url")
    }

    fn resolver() -> Arc<ServiceRegistry> {
        Arc::new(
            ServiceRegistry::new(Service::new(
                "app",
                url("http://app.internal"),
                ServiceCapability::Plain,
            ))
            .with_route(
                "/data",
                Service::new("data", url("http://data.internal"), ServiceCapability::Bulk),
            ),
        )
    }

    fn context() -> Arc<RequestContext> {
        Arc::new(RequestContext::new(url("https://ex.org"), "en"))
    }

    fn pending(iris: &[&str]) -> Vec<Pending> {
        iris.iter()
            .map(|iri| Pending::fresh(CacheRequest::from(*iri)))
            .collect()
    }

    async fn run(
        backend: Arc<ScriptedBackend>,
        ctx: Arc<RequestContext>,
        items: Vec<Pending>,
    ) -> Result<Vec<CacheEntry>, BackendError> {
        Authorizer::new(backend, resolver())
            .authorize(ctx, items)
            .try_collect()
            .await
    }

    #[tokio::test]
    async fn groups_by_service_and_preserves_first_appearance_order() {
        let backend = Arc::new(ScriptedBackend::default());
        let entries = run(
            backend.clone(),
            context(),
            pending(&[
                "https://ex.org/data/1",
                "https://ex.org/page/1",
                "https://ex.org/data/2",
                "https://ex.org/page/2",
            ]),
        )
        .await
        .expect("authorized");

        let order: Vec<&str> = entries.iter().map(|e| e.iri.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "https://ex.org/data/1",
                "https://ex.org/data/2",
                "https://ex.org/page/1",
                "https://ex.org/page/2",
            ]
        );

        let bulk_calls = backend.bulk_calls.lock().expect("lock").clone();
        assert_eq!(
            bulk_calls,
            vec![(
                "data".to_string(),
                vec![
                    "https://ex.org/data/1".to_string(),
                    "https://ex.org/data/2".to_string()
                ]
            )]
        );
        assert_eq!(backend.plain_calls.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn rejected_bulk_call_fails_the_stream() {
        let backend = Arc::new(ScriptedBackend {
            reject_bulk: true,
            ..Default::default()
        });
        let err = run(backend, context(), pending(&["https://ex.org/data/1"]))
            .await
            .expect_err("bulk failure");
        assert!(matches!(err, BackendError::UnexpectedStatus { status: 302, .. }));
    }

    #[tokio::test]
    async fn resources_missing_from_bulk_reply_become_gateway_errors() {
        let backend = Arc::new(ScriptedBackend {
            omitted: vec!["https://ex.org/data/2".to_string()],
            ..Default::default()
        });
        let entries = run(
            backend,
            context(),
            pending(&["https://ex.org/data/1", "https://ex.org/data/2"]),
        )
        .await
        .expect("authorized");

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, 200);
        assert_eq!(entries[1], CacheEntry::failed("https://ex.org/data/2", 502));
    }

    #[tokio::test]
    async fn unrequested_bulk_resources_are_dropped() {
        let backend = Arc::new(ScriptedBackend {
            unrequested: vec!["https://ex.org/data/other".to_string()],
            ..Default::default()
        });
        let entries = run(backend, context(), pending(&["https://ex.org/data/1"]))
            .await
            .expect("authorized");

        let iris: Vec<&str> = entries.iter().map(|e| e.iri.as_str()).collect();
        assert_eq!(iris, vec!["https://ex.org/data/1"]);
    }

    #[tokio::test]
    async fn bulk_resources_in_another_language_are_not_public() {
        let backend = Arc::new(ScriptedBackend {
            language: Some("nl".to_string()),
            ..Default::default()
        });
        let entries = run(backend, context(), pending(&["https://ex.org/data/1"]))
            .await
            .expect("authorized");
        assert_eq!(entries[0].cache_control, CacheControl::NoCache);
        assert!(entries[0].contents.is_some());

        let backend = Arc::new(ScriptedBackend {
            language: Some("EN".to_string()),
            ..Default::default()
        });
        let entries = run(backend, context(), pending(&["https://ex.org/data/1"]))
            .await
            .expect("authorized");
        assert!(entries[0].is_public());
    }

    #[tokio::test]
    async fn unreachable_plain_service_falls_back() {
        let backend = Arc::new(ScriptedBackend {
            unreachable: vec![
                "https://ex.org/page/stale".to_string(),
                "https://ex.org/page/new".to_string(),
            ],
            ..Default::default()
        });
        let stale = CacheEntry::new(
            "https://ex.org/page/stale",
            200,
            CacheControl::Private,
            Some("old".into()),
        );
        let mut items = pending(&["https://ex.org/page/new"]);
        items.push(Pending::stale(stale.clone()));

        let entries = run(backend, context(), items).await.expect("authorized");

        assert_eq!(entries[0], CacheEntry::failed("https://ex.org/page/new", 502));
        assert_eq!(entries[1], stale);
    }

    #[tokio::test]
    async fn rotated_credentials_are_published() {
        let ctx = context();
        run(
            Arc::new(ScriptedBackend::default()),
            ctx.clone(),
            pending(&["https://ex.org/data/1"]),
        )
        .await
        .expect("authorized");

        assert_eq!(
            ctx.rotated_credentials().map(|c| c.authorization),
            Some("Bearer rotated".to_string())
        );
    }

    #[tokio::test]
    async fn each_body_gets_its_own_blank_node_scope() {
        let entries = run(
            Arc::new(ScriptedBackend::default()),
            context(),
            pending(&["https://ex.org/page/1", "https://ex.org/page/2"]),
        )
        .await
        .expect("authorized");

        let first = entries[0].contents.as_deref().expect("body");
        let second = entries[1].contents.as_deref().expect("body");
        assert!(!first.contains("\"_:b0\""));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let backend = Arc::new(ScriptedBackend::default());
        let entries = run(backend.clone(), context(), Vec::new())
            .await
            .expect("authorized");
        assert!(entries.is_empty());
        assert!(backend.bulk_calls.lock().expect("lock").is_empty());
    }
}
