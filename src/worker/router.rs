//! Request routing inside the worker
//!
//! Routes are kept per HTTP method in registration order; the first route
//! whose matcher accepts the request handles it. Requests that no route
//! matches, and anything that is not http(s), fall through to the host.

use http::Method;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::strategy::{Strategy, WorkerRequest};
use crate::cache::StoredResponse;
use crate::error::FetchError;

type Predicate = Arc<dyn Fn(&WorkerRequest, &Url) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum RouteMatcher {
    /// Exact URL, fragment ignored
    Exact(Url),
    /// Regex over the full URL. Cross-origin URLs only match when the
    /// match starts at the beginning of the URL.
    Regex(Regex),
    /// Arbitrary check of the request against the worker origin
    Predicate(Predicate),
}

impl RouteMatcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&WorkerRequest, &Url) -> bool + Send + Sync + 'static,
    {
        RouteMatcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, request: &WorkerRequest, origin: &Url) -> bool {
        match self {
            RouteMatcher::Exact(url) => {
                let mut wanted = url.clone();
                wanted.set_fragment(None);
                let mut got = request.url.clone();
                got.set_fragment(None);
                wanted == got
            }
            RouteMatcher::Regex(re) => match re.find(request.url.as_str()) {
                Some(m) => m.start() == 0 || same_origin(&request.url, origin),
                None => false,
            },
            RouteMatcher::Predicate(f) => f(request, origin),
        }
    }
}

impl std::fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMatcher::Exact(url) => write!(f, "Exact({url})"),
            RouteMatcher::Regex(re) => write!(f, "Regex({})", re.as_str()),
            RouteMatcher::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

pub fn same_origin(url: &Url, origin: &Url) -> bool {
    url.origin() == origin.origin()
}

pub struct Route {
    pub matcher: RouteMatcher,
    pub method: Method,
    pub strategy: Arc<dyn Strategy>,
}

pub struct Router {
    origin: Url,
    routes: HashMap<Method, Vec<Route>>,
}

impl Router {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: HashMap::new(),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn register_route(&mut self, matcher: RouteMatcher, method: Method, strategy: Arc<dyn Strategy>) {
        debug!(?matcher, %method, cache = strategy.cache_name(), "Registered route");
        self.routes
            .entry(method.clone())
            .or_default()
            .push(Route {
                matcher,
                method,
                strategy,
            });
    }

    pub fn route_count(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    /// First route accepting `request`.
    pub fn find_route(&self, request: &WorkerRequest) -> Option<&Route> {
        if !matches!(request.url.scheme(), "http" | "https") {
            return None;
        }
        self.routes
            .get(&request.method)?
            .iter()
            .find(|route| route.matcher.matches(request, &self.origin))
    }

    /// `None` when no route handles the request.
    pub async fn handle_request(
        &self,
        request: &WorkerRequest,
    ) -> Option<Result<StoredResponse, FetchError>> {
        let route = self.find_route(request)?;
        let result = route.strategy.handle(request).await;
        if let Err(e) = &result {
            debug!(url = %request.url, cache = route.strategy.cache_name(), error = %e, "Route failed");
        }
        Some(result)
    }

    /// Route each URL as a plain GET so the matching strategy caches it.
    /// Returns how many were fetched or served successfully.
    pub async fn cache_urls(&self, urls: &[String]) -> usize {
        let mut warmed = 0;
        for raw in urls {
            let url = match self.origin.join(raw) {
                Ok(url) => url,
                Err(e) => {
                    warn!(url = %raw, error = %e, "Skipping unparsable URL");
                    continue;
                }
            };
            match self.handle_request(&WorkerRequest::get(url)).await {
                Some(Ok(_)) => warmed += 1,
                Some(Err(e)) => warn!(url = %raw, error = %e, "Failed to warm cache"),
                None => debug!(url = %raw, "No route for URL"),
            }
        }
        warmed
    }
}
