//! Proxy Server - HTTP listener that delivers fetch events to the worker
//!
//! Every request accepted here becomes one `on_fetch` call. Network failures
//! the worker cannot mask are answered with a gateway error.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::origin::{is_hop_by_hop, CacheMode, FetchRequest, OriginError};
use crate::worker::{FetchReply, ServiceWorker};

/// Header telling clients how a response was produced
pub const SOURCE_HEADER: &str = "x-shellcache";

/// HTTP front for the worker
pub struct ProxyServer {
    /// Worker handling fetch events
    worker: Arc<ServiceWorker>,
    /// Address to bind
    addr: SocketAddr,
    /// Socket listener
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a proxy server for the given address
    pub fn new(worker: Arc<ServiceWorker>, addr: SocketAddr) -> Self {
        Self {
            worker,
            addr,
            listener: None,
        }
    }

    /// Bind the listener
    pub async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", self.addr))?;

        self.listener = Some(listener);
        if let Some(addr) = self.local_addr() {
            info!(addr = %addr, "Proxy server started");
        }
        Ok(())
    }

    /// Address actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Run the accept loop
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let worker = Arc::clone(&self.worker);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, worker).await {
                            debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Serve one HTTP/1.1 connection
async fn handle_connection(stream: TcpStream, worker: Arc<ServiceWorker>) -> Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let worker = Arc::clone(&worker);
        async move { Ok::<_, Infallible>(handle_request(req, worker).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .context("HTTP connection error")?;
    Ok(())
}

/// Convert, dispatch and convert back
async fn handle_request(req: Request<Incoming>, worker: Arc<ServiceWorker>) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return plain_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let request = FetchRequest {
        method: parts.method.as_str().to_string(),
        path,
        headers,
        body,
        cache_mode: CacheMode::Default,
    };

    debug!(method = %request.method, path = %request.path, "Fetch event");

    match worker.on_fetch(request).await {
        Ok(reply) => reply_response(reply),
        Err(e) => {
            let status = match e {
                OriginError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            plain_response(status, &e.to_string())
        }
    }
}

fn reply_response(reply: FetchReply) -> Response<Full<Bytes>> {
    let source = reply.source.map(|s| s.as_str()).unwrap_or("passthrough");
    let mut builder = Response::builder()
        .status(reply.response.status)
        .header(SOURCE_HEADER, source);
    for (name, value) in &reply.response.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(Full::new(reply.response.body))
        .unwrap_or_else(|e| {
            error!(error = %e, "Failed to build response");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid upstream response")
        })
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use crate::manifest::ResourceManifest;
    use crate::worker::testing::StubFetcher;
    use crate::worker::WorkerOptions;

    async fn serve(fetcher: Arc<StubFetcher>) -> (SocketAddr, Arc<ServiceWorker>) {
        let manifest: ResourceManifest = [("/", "r"), ("index.html", "r"), ("main.dart.js", "m")]
            .into_iter()
            .collect();
        let options = WorkerOptions {
            origin: "http://localhost".to_string(),
            shell: vec!["index.html".to_string()],
            wait_for_skip: false,
        };
        let worker = Arc::new(
            ServiceWorker::new(manifest, options, Arc::new(MemoryStorage::new()), fetcher).unwrap(),
        );
        worker.start().await.unwrap();

        let mut server = ProxyServer::new(Arc::clone(&worker), "127.0.0.1:0".parse().unwrap());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, worker)
    }

    fn stub() -> Arc<StubFetcher> {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond("/index.html", 200, "<html>");
        fetcher.respond("/main.dart.js", 200, "main");
        fetcher.respond("/api/ping", 200, "pong");
        fetcher
    }

    #[tokio::test]
    async fn test_serves_cache_network_and_passthrough() {
        let (addr, _worker) = serve(stub()).await;
        let client = reqwest::Client::new();

        let staged = client
            .get(format!("http://{}/index.html", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(staged.headers()[SOURCE_HEADER], "cache");
        assert_eq!(staged.text().await.unwrap(), "<html>");

        let lazy = client
            .get(format!("http://{}/main.dart.js?v=1", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(lazy.headers()[SOURCE_HEADER], "network");

        let other = client
            .get(format!("http://{}/api/ping", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(other.headers()[SOURCE_HEADER], "passthrough");
        assert_eq!(other.text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_uncached_network_failure_is_bad_gateway() {
        let fetcher = stub();
        let (addr, _worker) = serve(Arc::clone(&fetcher)).await;
        fetcher.set_offline(true);

        let response = reqwest::get(format!("http://{}/main.dart.js", addr))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 502);

        // Shell entries still come from the cache
        let response = reqwest::get(format!("http://{}/index.html", addr))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }
}
