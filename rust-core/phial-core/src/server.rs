//! # Development Server
//!
//! HTTP/1 server built on Hyper and Tokio that feeds requests to an `App`.
//! The application core is synchronous, so each dispatch runs on the
//! blocking pool. Shuts down gracefully on Ctrl-C, draining open
//! connections up to a timeout.

use crate::app::App;
use crate::environ::Environ;
use crate::error::{Error, Result};
use crate::exceptions::HttpException;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// HTTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// Enable keep-alive connections
    pub keep_alive: bool,
    /// Shutdown timeout for graceful shutdown (default: 30 seconds)
    pub shutdown_timeout: Duration,
    /// Max request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 5000).into(),
            keep_alive: true,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 16 * 1024 * 1024,
        }
    }
}

/// Development server for one application
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    app: Arc<App>,
}

impl Server {
    /// Create a server with the default configuration
    #[must_use]
    pub fn new(app: Arc<App>) -> Self {
        Self {
            config: ServerConfig::default(),
            app,
        }
    }

    /// Bind the server to an address
    #[must_use]
    pub const fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.address = addr;
        self
    }

    /// Set max request body size
    #[must_use]
    pub const fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.config.max_body_size = bytes;
        self
    }

    /// Server configuration
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve on a fresh multi-threaded runtime until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns runtime creation, bind and accept failures.
    pub fn run(&self) -> Result<()> {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(self.serve())
    }

    /// Serve until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns bind and accept failures.
    pub async fn serve(&self) -> Result<()> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `shutdown` completes
    ///
    /// # Errors
    ///
    /// Returns bind and accept failures.
    pub async fn serve_with_shutdown(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.config.address;
        let listener = bind(addr).map_err(|source| Error::BindError {
            address: addr.to_string(),
            source: Arc::new(source),
        })?;
        let local_addr = listener.local_addr()?;

        info!(app = %self.app.name(), "Running on http://{}", local_addr);

        let active = Arc::new(AtomicUsize::new(0));
        let max_body_size = self.config.max_body_size;
        let keep_alive = self.config.keep_alive;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = accept_result?;
                    let io = TokioIo::new(stream);
                    let app = Arc::clone(&self.app);
                    let active = Arc::clone(&active);

                    tokio::task::spawn(async move {
                        active.fetch_add(1, Ordering::Relaxed);
                        let service = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            async move {
                                handle_request(app, req, remote_addr, local_addr, max_body_size).await
                            }
                        });
                        if let Err(err) = http1::Builder::new()
                            .keep_alive(keep_alive)
                            .serve_connection(io, service)
                            .await
                        {
                            error!("Error serving connection: {:?}", err);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = &mut shutdown => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        let drain = async {
            while active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            warn!(
                open = active.load(Ordering::Relaxed),
                "Shutdown timeout reached with connections still open"
            );
        }
        Ok(())
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Build the gateway environment for a hyper request
///
/// # Errors
///
/// Returns `Error::PayloadTooLarge` when the declared or actual body size
/// exceeds `max_body_size`; body read failures as `Error::Io`.
pub async fn environ_from_hyper<B>(
    req: hyper::Request<B>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    max_body_size: usize,
) -> Result<Environ>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();

    let declared = parts
        .headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(content_len) = declared {
        if content_len > max_body_size {
            return Err(Error::PayloadTooLarge {
                limit: max_body_size,
                actual: content_len,
            });
        }
    }

    let body = body
        .collect()
        .await
        .map_err(|e| Error::Io(Arc::new(std::io::Error::other(e.to_string()))))?
        .to_bytes();
    if body.len() > max_body_size {
        return Err(Error::PayloadTooLarge {
            limit: max_body_size,
            actual: body.len(),
        });
    }

    let raw_path = parts.uri.path();
    let path_info = urlencoding::decode(raw_path)
        .map_or_else(|_| raw_path.to_string(), |p| p.into_owned());

    Ok(Environ {
        method: parts.method.as_str().to_uppercase(),
        script_name: String::new(),
        path_info,
        query_string: parts.uri.query().unwrap_or_default().to_string(),
        url_scheme: "http".to_string(),
        server_name: local_addr.ip().to_string(),
        server_port: local_addr.port(),
        remote_addr: Some(remote_addr.ip().to_string()),
        headers: parts.headers,
        body,
        preserve_context: false,
    })
}

fn error_response(http: &HttpException, method: &str) -> hyper::Response<Full<Bytes>> {
    http.get_response().into_hyper(method)
}

/// Run one hyper request through the application
///
/// # Errors
///
/// Never fails; failures become 4xx/5xx responses.
pub async fn handle_request<B>(
    app: Arc<App>,
    req: hyper::Request<B>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    max_body_size: usize,
) -> std::result::Result<hyper::Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let method = req.method().as_str().to_uppercase();
    let path = req.uri().path().to_string();
    let version = format!("{:?}", req.version());

    let response = match environ_from_hyper(req, remote_addr, local_addr, max_body_size).await {
        Ok(environ) => {
            let dispatched = tokio::task::spawn_blocking(move || app.dispatch(environ)).await;
            match dispatched {
                Ok(Ok(response)) => response.into_hyper(&method),
                Ok(Err(e)) => {
                    error!(error = %e, path = %path, "Unhandled error escaped dispatch");
                    error_response(&HttpException::internal_server_error(Some(e)), &method)
                }
                Err(e) => {
                    error!(error = %e, path = %path, "Dispatch task failed");
                    error_response(&HttpException::internal_server_error(None), &method)
                }
            }
        }
        Err(Error::PayloadTooLarge { limit, actual }) => {
            warn!(limit, actual, path = %path, "Request body too large");
            error_response(&HttpException::payload_too_large(), &method)
        }
        Err(e) => {
            error!("Failed to read request: {}", e);
            error_response(&HttpException::bad_request(), &method)
        }
    };

    info!(
        "    {} - \"{} {} {}\" {}",
        remote_addr,
        method,
        path,
        version,
        response.status().as_u16()
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (([10, 0, 0, 1], 40000).into(), ([127, 0, 0, 1], 5000).into())
    }

    fn app() -> Arc<App> {
        let app = App::new("server");
        app.route("/hello/<name>", "hello", |_, args| {
            Ok(format!("Hi {}", args["name"]))
        })
        .unwrap();
        app.route_with(
            "/echo",
            "echo",
            crate::app::RouteOptions::new().methods(&["POST"]),
            |ctx, _| Ok(ctx.request().body_str().unwrap_or_default().to_string()),
        )
        .unwrap();
        app
    }

    fn request(method: &str, uri: &str, body: &'static str) -> hyper::Request<Full<Bytes>> {
        hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "localhost:5000")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.address.port(), 5000);
        assert!(config.keep_alive);
        let server = Server::new(App::new("s")).with_max_body_size(10);
        assert_eq!(server.config().max_body_size, 10);
    }

    #[test]
    fn test_environ_from_hyper_decodes_path() {
        let (remote, local) = addrs();
        let environ = tokio_test::block_on(environ_from_hyper(
            request("get", "/hello/J%C3%BCrgen?x=1", ""),
            remote,
            local,
            1024,
        ))
        .unwrap();
        assert_eq!(environ.method, "GET");
        assert_eq!(environ.path_info, "/hello/Jürgen");
        assert_eq!(environ.query_string, "x=1");
        assert_eq!(environ.remote_addr.as_deref(), Some("10.0.0.1"));
        assert_eq!(environ.server_port, 5000);
    }

    #[test]
    fn test_handle_request_dispatches() {
        let (remote, local) = addrs();
        let response = tokio_test::block_on(handle_request(
            app(),
            request("GET", "/hello/Ann", ""),
            remote,
            local,
            1024,
        ))
        .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response.headers()["content-type"],
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_body_limit_is_413() {
        let (remote, local) = addrs();
        let response = tokio_test::block_on(handle_request(
            app(),
            request("POST", "/echo", "0123456789abcdef"),
            remote,
            local,
            8,
        ))
        .unwrap();
        assert_eq!(response.status().as_u16(), 413);
    }

    #[test]
    fn test_propagated_error_becomes_500() {
        let mut config = Config::default();
        config.propagate_exceptions = Some(true);
        let app = App::with_config("server", config);
        app.route("/fail", "fail", |_, _| -> Result<&'static str> {
            Err(Error::Config("broken".to_string()))
        })
        .unwrap();

        let (remote, local) = addrs();
        let response = tokio_test::block_on(handle_request(
            app,
            request("GET", "/fail", ""),
            remote,
            local,
            1024,
        ))
        .unwrap();
        assert_eq!(response.status().as_u16(), 500);
    }
}
