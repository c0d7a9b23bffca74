//! HTTP action executor: one logical request, including redirect hops,
//! cookie handling, header defaulting and sample emission.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use cookie_store::CookieStore;
use http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use http::{Method, Request, Uri};
use hyper::body::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::RuntimeConfig;
use crate::engine::http_client::HttpClient;
use crate::error::{HttpError, HttpResult};
use crate::stats::{Collector, RequestSample, RequestTimings};

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Request body as supplied by the script.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    /// Key/value pairs, sent URL-encoded.
    Form(Vec<(String, String)>),
}

impl Body {
    pub fn is_form(&self) -> bool {
        matches!(self, Body::Form(_))
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Text(text) => Bytes::from(text.clone()),
            Body::Form(pairs) => Bytes::from(
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish(),
            ),
        }
    }
}

/// Options parsed from the script's `params` object.
#[derive(Debug, Clone, Default)]
pub struct HttpParams {
    /// Header pairs in script order; keys are canonicalized when the request is built.
    pub headers: Vec<(String, String)>,
    /// Extra cookies sent alongside the ones in the VU jar.
    pub cookies: Vec<(String, String)>,
    pub follow_redirects: Option<bool>,
    pub max_redirects: Option<u32>,
    /// `None` uses the configured timeout; `Some(Duration::ZERO)` disables it.
    pub timeout: Option<Duration>,
    /// Sample name override; defaults to the URL.
    pub name: Option<String>,
    pub tags: HashMap<String, String>,
}

/// Everything needed to perform one logical HTTP action.
#[derive(Debug, Clone, Default)]
pub struct ActionRequest {
    pub method: String,
    pub url: String,
    pub body: Body,
    pub params: HttpParams,
}

impl ActionRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Canonical header names; repeated headers are joined with ", ".
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub timings: RequestTimings,
    /// Final URL after redirects.
    pub url: String,
    pub method: String,
    pub proto: String,
    /// Number of redirect hops followed to produce this response.
    pub redirects: u32,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&canonical_header_key(name)).map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Canonical MIME header form: `content-type` becomes `Content-Type`.
/// Keys containing characters outside the HTTP token set are returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    let is_token = |b: u8| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b);
    if key.is_empty() || !key.bytes().all(is_token) {
        return key.to_string();
    }
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() };
            upper = c == '-';
            out
        })
        .collect()
}

/// Canonicalize script headers and apply defaults. Explicit headers always win.
pub fn prepare_headers(params: &HttpParams, body: &Body, user_agent: &str) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = params
        .headers
        .iter()
        .map(|(k, v)| (canonical_header_key(k), v.clone()))
        .collect();
    if body.is_form() {
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| FORM_CONTENT_TYPE.to_string());
    }
    headers
        .entry("User-Agent".to_string())
        .or_insert_with(|| user_agent.to_string());
    headers
}

/// Convert a url::Url to http::Uri using component extraction.
fn url_to_uri(url: &Url) -> Option<Uri> {
    let host = url.host_str()?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    Uri::builder()
        .scheme(url.scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .ok()
}

fn version_to_proto(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_2 => "h2",
        http::Version::HTTP_3 => "h3",
        _ => "h1",
    }
}

/// Caller-supplied credentials never follow a redirect to another origin.
/// Jar cookies are still matched per URL.
fn strip_credentials(headers: &mut BTreeMap<String, String>) {
    headers.remove("Cookie");
    headers.remove("Authorization");
}

/// What to do after a hop completes.
#[derive(Debug, PartialEq)]
enum Hop {
    Done,
    Follow { url: Url, method: Method, keep_body: bool },
}

fn next_hop(
    status: u16,
    location: Option<&str>,
    current: &Url,
    method: &Method,
    hops: u32,
    limit: u32,
) -> Hop {
    if !matches!(status, 301 | 302 | 303 | 307 | 308) || hops >= limit {
        return Hop::Done;
    }
    let Some(next) = location.and_then(|loc| current.join(loc).ok()) else {
        return Hop::Done;
    };
    match status {
        307 | 308 => Hop::Follow {
            url: next,
            method: method.clone(),
            keep_body: true,
        },
        _ => Hop::Follow {
            url: next,
            method: if *method == Method::HEAD { Method::HEAD } else { Method::GET },
            keep_body: false,
        },
    }
}

/// Executes HTTP actions for one VU. Shared (behind an `Arc`) by the script
/// thread and by batch tasks.
pub struct HttpExecutor {
    client: HttpClient,
    jar: RwLock<CookieStore>,
    collector: Collector,
    follow_depth: u32,
    timeout: Option<Duration>,
    response_sink: bool,
    user_agent: String,
}

impl HttpExecutor {
    pub fn new(config: &RuntimeConfig, collector: Collector) -> HttpResult<Self> {
        Ok(Self {
            client: HttpClient::new(config.max_idle_per_host(), config.pool_idle_timeout())?,
            jar: RwLock::new(CookieStore::default()),
            collector,
            follow_depth: config.follow_depth(),
            timeout: config.timeout(),
            response_sink: config.response_sink(),
            user_agent: config.user_agent(),
        })
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn follow_depth(&self) -> u32 {
        self.follow_depth
    }

    /// Replace the cookie jar with an empty one.
    pub fn reset_cookies(&self) {
        *self.jar.write() = CookieStore::default();
    }

    pub fn cookie_count(&self) -> usize {
        self.jar.read().iter_unexpired().count()
    }

    fn cookie_header(&self, url: &Url, extra: &[(String, String)], explicit: Option<&String>) -> Option<String> {
        let mut pairs: Vec<String> = {
            let store = self.jar.read();
            store
                .get_request_values(url)
                .map(|(name, value)| format!("{}={}", name, value))
                .collect()
        };
        pairs.extend(extra.iter().map(|(name, value)| format!("{}={}", name, value)));
        if let Some(explicit) = explicit {
            pairs.push(explicit.clone());
        }
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    fn store_cookies(&self, url: &Url, response: &http::Response<Bytes>) {
        let mut store = self.jar.write();
        for value in response.headers().get_all(SET_COOKIE) {
            if let Ok(value) = value.to_str() {
                let _ = store.parse(value, url);
            }
        }
    }

    /// Perform the action, following redirects up to the follow depth (or the
    /// per-request `maxRedirects`). Past the limit the last redirect response
    /// is returned as-is.
    pub async fn execute(&self, request: ActionRequest, cancel: &CancellationToken) -> HttpResult<HttpResponse> {
        let ActionRequest { method, url, body, mut params } = request;

        let mut method = Method::from_bytes(method.trim().to_uppercase().as_bytes())
            .map_err(|_| HttpError::InvalidRequest(format!("invalid method '{}'", method)))?;
        let mut url = Url::parse(&url).map_err(|e| HttpError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let mut headers = prepare_headers(&params, &body, &self.user_agent);
        let mut payload = body.encode();

        let limit = if params.follow_redirects.unwrap_or(true) {
            params.max_redirects.unwrap_or(self.follow_depth)
        } else {
            0
        };
        let timeout = match params.timeout {
            Some(value) if value.is_zero() => None,
            Some(value) => Some(value),
            None => self.timeout,
        };

        let mut hops = 0;
        loop {
            let (response, mut result) = self
                .send(&method, &url, &headers, payload.clone(), &params, timeout, cancel)
                .await?;
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok());

            match next_hop(result.status, location, &url, &method, hops, limit) {
                Hop::Done => {
                    result.redirects = hops;
                    return Ok(result);
                }
                Hop::Follow { url: next, method: next_method, keep_body } => {
                    tracing::trace!(from = %url, to = %next, status = result.status, "following redirect");
                    if !keep_body {
                        payload = Bytes::new();
                        headers.remove("Content-Type");
                    }
                    if next.origin() != url.origin() {
                        strip_credentials(&mut headers);
                        params.cookies.clear();
                    }
                    url = next;
                    method = next_method;
                    hops += 1;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        method: &Method,
        url: &Url,
        headers: &BTreeMap<String, String>,
        payload: Bytes,
        params: &HttpParams,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> HttpResult<(http::Response<Bytes>, HttpResponse)> {
        let uri = url_to_uri(url).ok_or_else(|| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: "URL has no host".to_string(),
        })?;

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        for (k, v) in headers {
            if k != "Cookie" {
                builder = builder.header(k.as_str(), v.as_str());
            }
        }
        if let Some(cookie) = self.cookie_header(url, &params.cookies, headers.get("Cookie")) {
            builder = builder.header(COOKIE, cookie);
        }
        let req = builder
            .body(payload)
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let start = Instant::now();
        let exchange = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, self.client.request(req, self.response_sink))
                    .await
                    .unwrap_or(Err(HttpError::Timeout(limit))),
                None => self.client.request(req, self.response_sink).await,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HttpError::Cancelled),
            outcome = exchange => outcome,
        };

        let url_str = url.as_str();
        match outcome {
            Ok((response, timings)) => {
                self.store_cookies(url, &response);
                let status = response.status().as_u16();
                self.collector.request(RequestSample {
                    name: params.name.as_deref(),
                    method: method.as_str(),
                    url: url_str,
                    status,
                    timings,
                    error: None,
                    tags: &params.tags,
                });

                let mut resp_headers: BTreeMap<String, String> = BTreeMap::new();
                for (name, value) in response.headers() {
                    let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                    resp_headers
                        .entry(canonical_header_key(name.as_str()))
                        .and_modify(|existing| {
                            existing.push_str(", ");
                            existing.push_str(&value);
                        })
                        .or_insert(value);
                }
                let result = HttpResponse {
                    status,
                    headers: resp_headers,
                    body: response.body().clone(),
                    timings,
                    url: url_str.to_string(),
                    method: method.to_string(),
                    proto: version_to_proto(response.version()).to_string(),
                    redirects: 0,
                };
                Ok((response, result))
            }
            Err(err) => {
                tracing::debug!(method = %method, url = url_str, error = %err, "request failed");
                self.collector.request(RequestSample {
                    name: params.name.as_deref(),
                    method: method.as_str(),
                    url: url_str,
                    status: 0,
                    timings: RequestTimings {
                        duration: start.elapsed(),
                        ..Default::default()
                    },
                    error: Some(err.to_string()),
                    tags: &params.tags,
                });
                Err(err)
            }
        }
    }
}
