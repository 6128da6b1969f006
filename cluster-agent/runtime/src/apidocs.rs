//! Scrapes OpenAPI documents published by the services behind mappings.

use cluster_agent_core::{snapshot::Mapping, ApiDoc, DocsDiff, ObjectRef};
use parking_lot::Mutex;
use reqwest::{header, Url};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info_span, Instrument};

const SCRAPE_INTERVAL: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DOC_TYPE: &str = "OpenAPI";

/// Holds the latest document per mapping.
#[derive(Clone)]
pub struct DocsScraper {
    client: reqwest::Client,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    docs: HashMap<String, ApiDoc>,
    diff: DocsDiff,
    last_run: Option<Instant>,
}

/// How to fetch a mapping's document and where it will be served publicly.
#[derive(Clone, Debug, PartialEq, Eq)]
struct DocRequest {
    url: Url,
    host: Option<String>,
    headers: Vec<(String, String)>,
    public_host: String,
    prefix: String,
    keep_existing_prefix: bool,
}

// === impl DocsScraper ===

impl DocsScraper {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            state: Default::default(),
        })
    }

    /// The stored documents, ordered by mapping.
    pub fn docs(&self) -> Vec<ApiDoc> {
        let mut docs = self.state.lock().docs.values().cloned().collect::<Vec<_>>();
        docs.sort_by(|a, b| a.target_ref.cmp(&b.target_ref));
        docs
    }

    /// Starts a scraping round for `mappings` if one is due.
    ///
    /// Rounds run at most once a minute. While nothing is stored yet the
    /// round runs inline so the first report can carry documents; later
    /// rounds run in the background.
    pub async fn refresh(&self, mappings: &[Mapping]) {
        let processable = mappings
            .iter()
            .filter(|m| m.has_docs())
            .cloned()
            .collect::<Vec<_>>();

        let inline = {
            let mut state = self.state.lock();
            if processable.is_empty() && state.docs.is_empty() {
                return;
            }
            if state
                .last_run
                .is_some_and(|t| t.elapsed() < SCRAPE_INTERVAL)
            {
                return;
            }
            state.last_run = Some(Instant::now());
            state.docs.is_empty()
        };

        if inline {
            self.scrape(processable).await;
        } else {
            let this = self.clone();
            tokio::spawn(
                async move { this.scrape(processable).await }.instrument(info_span!("apidocs")),
            );
        }
    }

    async fn scrape(&self, mappings: Vec<Mapping>) {
        for mapping in &mappings {
            let key = mapping.key();
            self.state.lock().diff.add(key.clone());

            let Some(req) = doc_request(mapping) else {
                debug!(mapping = %mapping.metadata.name, "No document location");
                continue;
            };
            if let Some(doc) = self.fetch(mapping, &req).await {
                self.state.lock().docs.insert(key, doc);
            }
        }

        let mut state = self.state.lock();
        for key in state.diff.new_round() {
            debug!(%key, "Dropping document of removed mapping");
            state.docs.remove(&key);
        }
    }

    async fn fetch(&self, mapping: &Mapping, req: &DocRequest) -> Option<ApiDoc> {
        let mut get = self.client.get(req.url.clone());
        for (name, value) in &req.headers {
            get = get.header(name.as_str(), value.as_str());
        }
        if let Some(host) = &req.host {
            get = get.header(header::HOST, host.as_str());
        }

        let rsp = match get.send().await {
            Ok(rsp) => rsp,
            Err(error) => {
                debug!(url = %req.url, %error, "Failed to fetch document");
                return None;
            }
        };
        if rsp.status() != reqwest::StatusCode::OK {
            debug!(url = %req.url, status = %rsp.status(), "Document not available");
            return None;
        }
        let body = rsp.bytes().await.ok()?;
        let (version, data) = parse_doc(&body, req)?;

        let display_name = mapping
            .docs
            .as_ref()
            .and_then(|d| d.display_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{}.{}", mapping.metadata.name, mapping.metadata.namespace));
        Some(ApiDoc {
            name: display_name,
            target_ref: ObjectRef {
                kind: "Mapping".to_string(),
                namespace: mapping.metadata.namespace.clone(),
                name: mapping.metadata.name.clone(),
                uid: mapping.metadata.uid.clone(),
            },
            doc_type: DOC_TYPE.to_string(),
            version: version.to_string(),
            data,
        })
    }
}

impl std::fmt::Debug for DocsScraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocsScraper")
            .field("docs", &self.state.lock().docs.len())
            .finish()
    }
}

/// Works out where a mapping's document lives.
///
/// An explicit docs URL is fetched as-is. Otherwise the document is
/// requested from the mapping's service at the rewritten docs path, with the
/// mapping's hostname as `Host`.
fn doc_request(mapping: &Mapping) -> Option<DocRequest> {
    let docs = mapping.docs.as_ref()?;
    let public_host = mapping
        .hostname
        .clone()
        .filter(|h| !h.is_empty() && h != "*")
        .unwrap_or_default();
    let headers = mapping
        .headers
        .iter()
        .filter(|(name, _)| name.as_str() != ":authority")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Vec<_>>();

    if let Some(url) = docs.url.as_deref().filter(|u| !u.is_empty()) {
        return Some(DocRequest {
            url: Url::parse(url).ok()?,
            host: None,
            headers,
            public_host,
            prefix: mapping.prefix.clone(),
            keep_existing_prefix: false,
        });
    }

    let (scheme, authority) = match mapping.service.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", mapping.service.as_str()),
    };
    let authority = authority.trim_end_matches('/');
    if authority.is_empty() {
        return None;
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };
    let host = if host.contains('.') || mapping.metadata.namespace.is_empty() {
        host.to_string()
    } else {
        format!("{host}.{}", mapping.metadata.namespace)
    };
    let authority = match port {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };

    let rewrite = mapping.rewrite.as_deref().unwrap_or("/");
    let path = collapse_slashes(&format!(
        "{rewrite}{}",
        docs.path.as_deref().unwrap_or_default()
    ));
    let url = Url::parse(&format!("{scheme}://{authority}{}", ensure_leading_slash(&path))).ok()?;

    Some(DocRequest {
        url,
        host: Some(public_host.clone()).filter(|h| !h.is_empty()),
        headers,
        public_host,
        prefix: mapping.prefix.clone(),
        keep_existing_prefix: true,
    })
}

/// Parses a fetched document, re-rooting its server under the mapping.
///
/// Returns the OpenAPI major version label and the edited document.
fn parse_doc(body: &[u8], req: &DocRequest) -> Option<(&'static str, Value)> {
    let mut doc = match serde_json::from_slice::<Value>(body) {
        Ok(doc @ Value::Object(_)) => doc,
        Ok(_) => {
            debug!(url = %req.url, "Document is not an object");
            return None;
        }
        Err(error) => {
            debug!(url = %req.url, %error, "Document is not JSON");
            return None;
        }
    };

    if doc.get("swagger").is_some() {
        let existing = doc
            .get("basePath")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let base = base_path(&req.prefix, &existing, req.keep_existing_prefix);
        doc["basePath"] = Value::String(ensure_leading_slash(&base));
        if !req.public_host.is_empty() {
            doc["host"] = Value::String(req.public_host.clone());
        }
        return Some(("v2", doc));
    }

    let existing = doc
        .pointer("/servers/0/url")
        .and_then(Value::as_str)
        .map(server_path)
        .unwrap_or_default();
    let base = base_path(&req.prefix, &existing, req.keep_existing_prefix);
    let url = if req.public_host.is_empty() {
        base
    } else {
        join_paths(&[&req.public_host, &base])
    };
    doc["servers"] = serde_json::json!([{ "url": url }]);
    Some(("v3", doc))
}

/// The path of a server URL, which may be absolute or relative.
fn server_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(url) => url.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

fn base_path(prefix: &str, existing: &str, keep_existing: bool) -> String {
    if prefix.is_empty() {
        return existing.to_string();
    }
    if keep_existing && !existing.is_empty() {
        join_paths(&[prefix, existing])
    } else {
        join_paths(&[prefix])
    }
}

/// Joins path segments with single slashes, without a trailing slash.
fn join_paths(parts: &[&str]) -> String {
    let leading = parts.first().is_some_and(|p| p.starts_with('/'));
    let joined = parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if leading {
        format!("/{joined}")
    } else {
        joined
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
