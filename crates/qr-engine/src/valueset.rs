//! Value-set expansion: the one asynchronous collaborator of the engine.
//!
//! Expanders are injected. [`ExpansionCache`] shares in-flight requests per canonical
//! URL, and [`load_options`] drives a question's [`OptionsState`] through the
//! engine's ticketed request/resolve calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::config::EngineConfig;
use crate::datatypes::Coding;
use crate::engine::{FormEngine, OptionsState};
use crate::spec::Questionnaire;
use crate::tree::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpansionError {
    #[error("value set '{0}' is not available")]
    NotFound(String),
    #[error("terminology server could not be reached: {0}")]
    Transport(String),
    #[error("terminology server answered {status} for '{url}'")]
    Status { url: String, status: u16 },
    #[error("expansion of '{url}' could not be read: {reason}")]
    Malformed { url: String, reason: String },
}

#[async_trait]
pub trait ValueSetExpander: Send + Sync {
    /// Expands the value set identified by its canonical `url` into codings.
    async fn expand(&self, url: &str) -> Result<Vec<Coding>, ExpansionError>;
}

/// Codings of an expanded `ValueSet`: `expansion.contains` (recursively), falling
/// back to the concepts enumerated in `compose.include`.
fn codings_of(value_set: &Value) -> Vec<Coding> {
    fn contains(entries: &[Value], into: &mut Vec<Coding>) {
        for entry in entries {
            if let (Some(system), Some(code)) = (
                entry.get("system").and_then(Value::as_str),
                entry.get("code").and_then(Value::as_str),
            ) {
                let mut coding = Coding::new(system, code);
                if let Some(display) = entry.get("display").and_then(Value::as_str) {
                    coding = coding.with_display(display);
                }
                into.push(coding);
            }
            if let Some(nested) = entry.get("contains").and_then(Value::as_array) {
                contains(nested, into);
            }
        }
    }

    let mut codings = Vec::new();
    if let Some(entries) = value_set.pointer("/expansion/contains").and_then(Value::as_array) {
        contains(entries, &mut codings);
        return codings;
    }
    let includes = value_set
        .pointer("/compose/include")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for include in includes {
        let system = include.get("system").and_then(Value::as_str).unwrap_or_default();
        let concepts = include
            .get("concept")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for concept in concepts {
            let Some(code) = concept.get("code").and_then(Value::as_str) else {
                continue;
            };
            let mut coding = Coding::new(system, code);
            if let Some(display) = concept.get("display").and_then(Value::as_str) {
                coding = coding.with_display(display);
            }
            codings.push(coding);
        }
    }
    codings
}

/// Remote expansion through a FHIR terminology server's `ValueSet/$expand`.
#[derive(Debug, Clone)]
pub struct TerminologyServerExpander {
    base: String,
    client: reqwest::Client,
}

impl TerminologyServerExpander {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, canonical: &str) -> Result<Url, ExpansionError> {
        let endpoint = format!("{}/ValueSet/$expand", self.base.trim_end_matches('/'));
        Url::parse_with_params(&endpoint, &[("url", canonical)]).map_err(|error| {
            ExpansionError::Transport(format!("invalid server address '{}': {error}", self.base))
        })
    }
}

#[async_trait]
impl ValueSetExpander for TerminologyServerExpander {
    async fn expand(&self, url: &str) -> Result<Vec<Coding>, ExpansionError> {
        let endpoint = self.endpoint(url)?;
        debug!(%endpoint, "expanding value set");
        let response = self
            .client
            .get(endpoint)
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(|error| ExpansionError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExpansionError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body: Value = response.json().await.map_err(|error| ExpansionError::Malformed {
            url: url.to_string(),
            reason: error.to_string(),
        })?;
        Ok(codings_of(&body))
    }
}

/// Pre-expanded value sets keyed by canonical URL.
#[derive(Debug, Clone, Default)]
pub struct LocalExpansionTable {
    sets: HashMap<String, Vec<Coding>>,
}

impl LocalExpansionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: impl Into<String>, codings: Vec<Coding>) {
        self.sets.insert(url.into(), codings);
    }

    pub fn with(mut self, url: impl Into<String>, codings: Vec<Coding>) -> Self {
        self.insert(url, codings);
        self
    }

    /// Table seeded from the `ValueSet` resources contained in a definition. Each is
    /// reachable by its `url` and by its local `#id` reference.
    pub fn from_contained(definition: &Questionnaire) -> Self {
        let mut table = Self::new();
        for resource in &definition.contained {
            if resource.get("resourceType").and_then(Value::as_str) != Some("ValueSet") {
                continue;
            }
            let codings = codings_of(resource);
            if let Some(id) = resource.get("id").and_then(Value::as_str) {
                table.insert(format!("#{id}"), codings.clone());
            }
            if let Some(url) = resource.get("url").and_then(Value::as_str) {
                table.insert(url, codings);
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[async_trait]
impl ValueSetExpander for LocalExpansionTable {
    async fn expand(&self, url: &str) -> Result<Vec<Coding>, ExpansionError> {
        self.sets
            .get(url)
            .cloned()
            .ok_or_else(|| ExpansionError::NotFound(url.to_string()))
    }
}

/// The expander a configuration asks for: the terminology server when one is
/// configured, else the definition's contained value sets.
pub fn expander_for(config: &EngineConfig, definition: &Questionnaire) -> Arc<dyn ValueSetExpander> {
    match &config.terminology_server {
        Some(base) => Arc::new(TerminologyServerExpander::new(base.clone())),
        None => Arc::new(LocalExpansionTable::from_contained(definition)),
    }
}

type SharedExpansion = Shared<BoxFuture<'static, Result<Vec<Coding>, ExpansionError>>>;

/// Shares expansions per canonical URL. Concurrent requests for the same URL await
/// one underlying call; successful results stay cached, failures are forgotten so
/// a retry reaches the expander again.
pub struct ExpansionCache {
    expander: Arc<dyn ValueSetExpander>,
    entries: Mutex<HashMap<String, SharedExpansion>>,
}

impl ExpansionCache {
    pub fn new(expander: Arc<dyn ValueSetExpander>) -> Self {
        Self {
            expander,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn expand(&self, url: &str) -> Result<Vec<Coding>, ExpansionError> {
        let shared = {
            let mut entries = self.entries.lock();
            match entries.get(url) {
                Some(existing) => {
                    trace!(url, "joining value set expansion");
                    existing.clone()
                }
                None => {
                    let expander = Arc::clone(&self.expander);
                    let canonical = url.to_string();
                    let future = async move { expander.expand(&canonical).await }
                        .boxed()
                        .shared();
                    entries.insert(url.to_string(), future.clone());
                    future
                }
            }
        };
        let result = shared.await;
        if result.is_err() {
            self.entries.lock().remove(url);
        }
        result
    }

    /// Number of URLs with a pending or cached expansion.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Loads the options of a question through `cache` and returns its resulting state.
/// Questions with static options, or without a value set, need no expansion.
pub async fn load_options(
    engine: &mut FormEngine,
    node: NodeId,
    cache: &ExpansionCache,
) -> OptionsState {
    if let Some(request) = engine.request_options(node) {
        let result = cache.expand(&request.url).await;
        engine.resolve_options(request.ticket, result);
    }
    engine.options(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_expansion_and_compose_forms() {
        let expanded = json!({
            "resourceType": "ValueSet",
            "expansion": {"contains": [
                {"system": "http://loinc.org", "code": "LA33-6", "display": "Yes"},
                {"abstract": true, "contains": [{"system": "http://loinc.org", "code": "LA32-8"}]}
            ]}
        });
        let composed = json!({
            "resourceType": "ValueSet",
            "compose": {"include": [{"system": "http://example.org", "concept": [{"code": "a"}]}]}
        });
        assert_eq!(codings_of(&expanded).len(), 2);
        assert_eq!(codings_of(&composed), vec![Coding::new("http://example.org", "a")]);
    }

    #[test]
    fn builds_expand_endpoint_with_encoded_url() {
        let expander = TerminologyServerExpander::new("https://tx.example.org/r4/");
        let endpoint = expander.endpoint("http://example.org/vs|1.0").expect("endpoint");
        assert_eq!(endpoint.path(), "/r4/ValueSet/$expand");
        assert_eq!(
            endpoint.query_pairs().next().map(|(_, value)| value.into_owned()),
            Some("http://example.org/vs|1.0".to_string())
        );
    }
}
