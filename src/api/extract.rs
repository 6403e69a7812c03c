use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use std::collections::HashMap;
use std::convert::Infallible;

use crate::idempotency::InboundRequest;

/// Headers and request parameters of an inbound HTTP request, as seen by the guard.
///
/// The extractor only sees request parts, so parameters come from the query
/// string. Handlers that accept `application/x-www-form-urlencoded` bodies
/// merge the decoded fields in with [`SyncRequest::with_form`].
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    headers: HeaderMap,
    query: HashMap<String, String>,
}

impl SyncRequest {
    pub fn new(headers: HeaderMap, query: HashMap<String, String>) -> Self {
        Self { headers, query }
    }

    /// Builds the view from request parts. An unparseable query string yields no parameters.
    pub fn from_uri(headers: HeaderMap, uri: &Uri) -> Self {
        let query = Query::<HashMap<String, String>>::try_from_uri(uri)
            .map(|Query(query)| query)
            .unwrap_or_default();
        Self { headers, query }
    }

    /// Adds form fields as parameters. A query parameter with the same name wins.
    pub fn with_form(mut self, form: HashMap<String, String>) -> Self {
        for (name, value) in form {
            self.query.entry(name).or_insert(value);
        }
        self
    }
}

impl InboundRequest for SyncRequest {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn param(&self, name: &str) -> Option<String> {
        self.query.get(name).cloned()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SyncRequest
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_uri(parts.headers.clone(), &parts.uri))
    }
}
