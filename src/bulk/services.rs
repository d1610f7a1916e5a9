//! Routing of resource IRIs to backend services.

use std::sync::Arc;

use url::Url;

use crate::config::BackendSettings;

/// How a service answers resource requests, fixed per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCapability {
    /// Answers many IRIs in one call.
    Bulk,
    /// Answers one IRI per call.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub base_url: Url,
    pub capability: ServiceCapability,
}

impl Service {
    pub fn new(name: impl Into<String>, base_url: Url, capability: ServiceCapability) -> Self {
        Self {
            name: name.into(),
            base_url,
            capability,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.capability == ServiceCapability::Bulk
    }
}

pub trait ServiceResolver: Send + Sync {
    /// The service responsible for `iri`.
    fn resolve(&self, iri: &str) -> Arc<Service>;
}

/// Path-prefix routing table with a fallback service.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    routes: Vec<(String, Arc<Service>)>,
    default: Arc<Service>,
}

impl ServiceRegistry {
    pub fn new(default: Service) -> Self {
        Self {
            routes: Vec::new(),
            default: Arc::new(default),
        }
    }

    /// Route paths under `prefix` to `service`. The longest matching prefix wins.
    pub fn with_route(mut self, prefix: impl Into<String>, service: Service) -> Self {
        self.routes.push((prefix.into(), Arc::new(service)));
        self.routes
            .sort_by(|(left, _), (right, _)| right.len().cmp(&left.len()));
        self
    }

    pub fn from_settings(settings: &BackendSettings) -> Self {
        let capability = |bulk: bool| {
            if bulk {
                ServiceCapability::Bulk
            } else {
                ServiceCapability::Plain
            }
        };
        let default = Service::new(
            "default",
            settings.default_url.clone(),
            capability(settings.default_bulk),
        );
        settings
            .services
            .iter()
            .fold(Self::new(default), |registry, service| {
                registry.with_route(
                    service.prefix.clone(),
                    Service::new(
                        service.name.clone(),
                        service.url.clone(),
                        capability(service.bulk),
                    ),
                )
            })
    }

    pub fn default_service(&self) -> &Arc<Service> {
        &self.default
    }
}

impl ServiceResolver for ServiceRegistry {
    fn resolve(&self, iri: &str) -> Arc<Service> {
        let path = resource_path(iri);
        self.routes
            .iter()
            .find(|(prefix, _)| path_has_prefix(&path, prefix))
            .map(|(_, service)| Arc::clone(service))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

/// Path (and query) of an absolute IRI; other input is taken as a path already.
pub fn resource_path(iri: &str) -> String {
    match Url::parse(iri) {
        Ok(url) => match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        },
        Err(_) => iri.to_string(),
    }
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    prefix.ends_with('/') || rest.is_empty() || rest.starts_with(['/', '?'])
}
