use std::{future::Future, net::SocketAddr, pin::Pin};

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::Service,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use log::{info, warn};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

use crate::metrics::exporter::Exporter;

type ServerResponse = anyhow::Result<Response<Full<Bytes>>>;

#[derive(Clone)]
pub struct Server {
    addr: SocketAddr,
    metrics: Option<Exporter>,
    health_check: bool,
}

impl Server {
    pub fn new(
        addr: SocketAddr,
        metrics: Exporter,
        expose_metrics: bool,
        health_check: bool,
    ) -> Self {
        let metrics = if expose_metrics { Some(metrics) } else { None };
        Server {
            addr,
            metrics,
            health_check,
        }
    }

    pub fn start(self, mut running: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        // If there is nothing to expose, we don't run the hyper server
        if self.metrics.is_none() && !self.health_check {
            return None;
        }

        let handle = tokio::spawn(async move {
            let listener = match TcpListener::bind(self.addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!("Failed to bind {}: {e}", self.addr);
                    return;
                }
            };

            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        let io = TokioIo::new(stream);
                        let s = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = http1::Builder::new().serve_connection(io, s).await {
                                warn!("Error serving connection: {e:?}");
                            }
                        });
                    },
                    _ = running.changed() => {
                        if !*running.borrow() {
                            drop(listener);
                            info!("Stopping endpoints...");
                            break;
                        }
                    }
                }
            }
        });
        Some(handle)
    }

    fn response(res: StatusCode, body: impl Into<Bytes>) -> ServerResponse {
        Response::builder()
            .status(res)
            .body(Full::new(body.into()))
            .map_err(anyhow::Error::new)
    }

    fn response_with_content_type(
        res: StatusCode,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> ServerResponse {
        Response::builder()
            .status(res)
            .header(hyper::header::CONTENT_TYPE, content_type)
            .body(Full::new(body.into()))
            .map_err(anyhow::Error::new)
    }

    fn handle_metrics(&self) -> ServerResponse {
        match &self.metrics {
            Some(metrics) => metrics.encode().map(|buf| {
                Server::response_with_content_type(
                    StatusCode::OK,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                    buf,
                )
            })?,
            None => Server::response(StatusCode::SERVICE_UNAVAILABLE, ""),
        }
    }

    fn handle_health_check(&self) -> ServerResponse {
        let res = if self.health_check {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        Server::response(res, "")
    }
}

impl Service<Request<Incoming>> for Server {
    type Response = Response<Full<Bytes>>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let s = self.clone();
        Box::pin(async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/metrics") => s.handle_metrics(),
                (&Method::GET, "/health_check") => s.handle_health_check(),
                _ => Server::response(StatusCode::NOT_FOUND, ""),
            }
        })
    }
}
