use std::time::{Duration, Instant};

use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::error::{HttpError, HttpResult};
use crate::stats::RequestTimings;

/// Pooled HTTP/1.1 + HTTP/2 transport owned by one VU.
///
/// Never follows redirects and never touches cookies: both are handled by
/// the executor on top of it. Clones share the connection pool.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    pub fn new(max_idle_per_host: usize, pool_idle_timeout: Duration) -> HttpResult<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| HttpError::Transport(format!("failed to load native root certificates: {}", e)))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build(https);

        Ok(Self { client })
    }

    /// Send one request and read the full response. If `response_sink` is true the
    /// body is still read to completion (so the connection can be reused) but
    /// discarded. Must be awaited inside a Tokio runtime.
    pub async fn request(
        &self,
        req: Request<Bytes>,
        response_sink: bool,
    ) -> HttpResult<(Response<Bytes>, RequestTimings)> {
        let request_start = Instant::now();

        let mut request_size = req.body().len();
        request_size += req.method().as_str().len() + 1 + req.uri().to_string().len() + 11;
        for (k, v) in req.headers() {
            request_size += k.as_str().len() + 2 + v.len() + 2;
        }
        request_size += 2;

        let response = self
            .client
            .request(req.map(Full::new))
            .await
            .map_err(|e| HttpError::Transport(error_chain(&e)))?;
        let headers_received = Instant::now();

        let (parts, mut body_stream) = response.into_parts();
        let (body, body_size) = if response_sink {
            let mut total = 0usize;
            while let Some(frame) = body_stream.frame().await {
                let frame = frame.map_err(|e| HttpError::Transport(error_chain(&e)))?;
                if let Some(data) = frame.data_ref() {
                    total += data.len();
                }
            }
            (Bytes::new(), total)
        } else {
            let body = body_stream
                .collect()
                .await
                .map_err(|e| HttpError::Transport(error_chain(&e)))?
                .to_bytes();
            let size = body.len();
            (body, size)
        };
        let receive_end = Instant::now();

        let mut response_size = body_size + 15;
        for (k, v) in parts.headers.iter() {
            response_size += k.as_str().len() + 2 + v.len() + 2;
        }
        response_size += 2;

        // Pooled connections make connect/TLS phases unobservable per request,
        // so only the send/wait/receive split is reported.
        let sending = Duration::from_micros(100);
        let waiting = headers_received.duration_since(request_start).saturating_sub(sending);
        let receiving = receive_end.duration_since(headers_received);
        let timings = RequestTimings {
            sending,
            waiting,
            receiving,
            duration: sending + waiting + receiving,
            request_size,
            response_size,
        };

        Ok((Response::from_parts(parts, body), timings))
    }
}

/// Render an error with its `source()` chain, since hyper's top-level
/// messages ("client error (Connect)") hide the useful part.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
