use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use ldcache::bulk::{
    Authorizer, Backend, BackendError, BackendReply, BulkCacheEngine, RawResource,
    RequestContext, Service, ServiceCapability, ServiceRegistry, render,
};
use ldcache::cache::{
    CacheConfig, CacheControl, CacheEntry, CacheEntryRepository, CacheRequest, MemoryStore,
};
use url::Url;

/// Bulk backend that answers from a fixed table and records every call.
#[derive(Default)]
struct CountingBackend {
    visibility: Vec<(String, CacheControl)>,
    calls: Mutex<Vec<Vec<String>>>,
    fail: bool,
}

impl CountingBackend {
    fn with(visibility: &[(&str, CacheControl)]) -> Self {
        Self {
            visibility: visibility
                .iter()
                .map(|(iri, cache)| (iri.to_string(), *cache))
                .collect(),
            ..Default::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("lock").clone()
    }

    fn resource(&self, iri: &str) -> RawResource {
        let cache = self
            .visibility
            .iter()
            .find(|(known, _)| known == iri)
            .map(|(_, cache)| *cache)
            .unwrap_or(CacheControl::Public);
        RawResource {
            iri: iri.to_string(),
            status: 200,
            cache,
            language: Some("en".into()),
            body: Some(format!("[\"_:b0\",\"http://p\",\"{iri}\",\"\",\"\",\"\"]\n")),
        }
    }
}

#[async_trait]
impl Backend for CountingBackend {
    async fn bulk(
        &self,
        service: &Service,
        iris: &[String],
        _ctx: &RequestContext,
    ) -> Result<BackendReply<Vec<RawResource>>, BackendError> {
        self.calls.lock().expect("lock").push(iris.to_vec());
        if self.fail {
            return Err(BackendError::UnexpectedStatus {
                service: service.name.clone(),
                status: 500,
            });
        }
        Ok(BackendReply {
            payload: iris.iter().map(|iri| self.resource(iri)).collect(),
            credentials: None,
        })
    }

    async fn plain(
        &self,
        _service: &Service,
        iri: &str,
        _ctx: &RequestContext,
    ) -> Result<BackendReply<RawResource>, BackendError> {
        self.calls.lock().expect("lock").push(vec![iri.to_string()]);
        Ok(BackendReply {
            payload: self.resource(iri),
            credentials: None,
        })
    }
}

fn url(value: &str) -> Url {
    Url::parse(value).expect("valid url")
}

fn engine(backend: Arc<CountingBackend>) -> BulkCacheEngine {
    let store = Arc::new(MemoryStore::new());
    let repository = CacheEntryRepository::new(store, CacheConfig::default());
    let resolver = Arc::new(ServiceRegistry::new(Service::new(
        "data",
        url("http://data.internal"),
        ServiceCapability::Bulk,
    )));
    BulkCacheEngine::new(repository, Authorizer::new(backend, resolver))
}

fn context() -> Arc<RequestContext> {
    Arc::new(RequestContext::new(url("https://ex"), "en"))
}

fn requests(iris: &[&str]) -> Vec<CacheRequest> {
    iris.iter().copied().map(CacheRequest::from).collect()
}

fn iris(entries: &[CacheEntry]) -> Vec<&str> {
    entries.iter().map(|entry| entry.iri.as_str()).collect()
}

#[tokio::test]
async fn serves_cached_and_authorizes_only_the_misses() {
    let backend = Arc::new(CountingBackend::with(&[("https://ex/2", CacheControl::Public)]));
    let engine = engine(backend.clone());
    let cached = CacheEntry::new("https://ex/1", 200, CacheControl::Public, Some("body1".into()));
    engine.repository().set_many(std::slice::from_ref(&cached), "en").await;

    let collected = engine
        .collect_resources(context(), requests(&["https://ex/1", "https://ex/2"]))
        .await
        .expect("collect");
    assert!(!collected.entirely_public);

    let entries: Vec<CacheEntry> = collected.resources.try_collect().await.expect("resources");
    let served: HashSet<&str> = iris(&entries).into_iter().collect();
    assert_eq!(served, HashSet::from(["https://ex/1", "https://ex/2"]));
    assert!(entries.contains(&cached));
    assert_eq!(backend.calls(), vec![vec!["https://ex/2".to_string()]]);

    let write_back = collected.write_back.take().expect("authorization completed");
    assert_eq!(iris(&write_back), vec!["https://ex/2"]);

    let report = engine.write_back(&write_back, "en").await;
    assert_eq!(report.written, 1);
    let stored = engine
        .repository()
        .get("https://ex/2", "en")
        .await
        .expect("store")
        .expect("written back");
    assert!(stored.is_public());
}

#[tokio::test]
async fn private_results_are_served_but_never_written_back() {
    let backend = Arc::new(CountingBackend::with(&[
        ("https://ex/a", CacheControl::Public),
        ("https://ex/b", CacheControl::Private),
    ]));
    let engine = engine(backend);

    let collected = engine
        .collect_resources(context(), requests(&["https://ex/a", "https://ex/b"]))
        .await
        .expect("collect");
    let entries: Vec<CacheEntry> = collected.resources.try_collect().await.expect("resources");
    assert_eq!(iris(&entries), vec!["https://ex/a", "https://ex/b"]);

    let write_back = engine
        .finish(&collected.write_back, "en")
        .await
        .expect("authorization completed");
    assert_eq!(write_back.written, 1);
    assert!(
        engine
            .repository()
            .get("https://ex/b", "en")
            .await
            .expect("store")
            .is_none()
    );
}

#[tokio::test]
async fn fully_public_batches_never_reach_the_backend() {
    let backend = Arc::new(CountingBackend::default());
    let engine = engine(backend.clone());
    let cached = [
        CacheEntry::new("https://ex/1", 200, CacheControl::Public, Some("a".into())),
        CacheEntry::new("https://ex/2", 200, CacheControl::Public, Some("b".into())),
    ];
    engine.repository().set_many(&cached, "en").await;

    let collected = engine
        .collect_resources(context(), requests(&["https://ex/1", "https://ex/2"]))
        .await
        .expect("collect");
    assert!(collected.entirely_public);

    let entries: Vec<CacheEntry> = collected.resources.try_collect().await.expect("resources");
    assert_eq!(entries, cached.to_vec());
    assert!(backend.calls().is_empty());
    assert_eq!(collected.write_back.take(), Some(Vec::new()));
}

#[tokio::test]
async fn abandoned_streams_release_no_write_back() {
    let backend = Arc::new(CountingBackend::default());
    let engine = engine(backend);

    let collected = engine
        .collect_resources(context(), requests(&["https://ex/1", "https://ex/2"]))
        .await
        .expect("collect");
    let write_back = collected.write_back.clone();
    let mut resources = collected.resources;
    let first = resources.next().await.expect("one item").expect("resource");
    assert_eq!(first.iri, "https://ex/1");
    drop(resources);

    assert!(!write_back.is_complete());
    assert!(engine.finish(&write_back, "en").await.is_none());
}

#[tokio::test]
async fn failed_bulk_call_fails_the_request() {
    let backend = Arc::new(CountingBackend::failing());
    let engine = engine(backend);

    let collected = engine
        .collect_resources(context(), requests(&["https://ex/1"]))
        .await
        .expect("collect");
    let write_back = collected.write_back.clone();
    let err = collected
        .resources
        .try_collect::<Vec<_>>()
        .await
        .expect_err("bulk failure surfaces");

    assert_eq!(err.status_code(), 502);
    assert!(write_back.take().is_none());
}

#[tokio::test]
async fn merged_bodies_get_distinct_blank_node_scopes() {
    let backend = Arc::new(CountingBackend::default());
    let engine = engine(backend);

    let collected = engine
        .collect_resources(context(), requests(&["https://ex/1", "https://ex/2"]))
        .await
        .expect("collect");
    let chunks: Vec<bytes::Bytes> = render(collected.resources)
        .try_collect()
        .await
        .expect("rendered");
    let body: String = chunks
        .iter()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    let labels: HashSet<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("[\"_:"))
        .filter_map(|rest| rest.split('"').next())
        .collect();
    assert_eq!(labels.len(), 2, "{body}");
    assert!(!labels.contains("b0"));
    assert!(body.contains(
        "[\"https://ex/1\",\"http://www.w3.org/2011/http#statusCode\",\"200\""
    ));
}
