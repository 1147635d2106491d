//! HTTP control plane.
//!
//! A small JSON API for observing and reconfiguring the running pipeline:
//!
//! - `GET/POST /api/stations`, `DELETE /api/stations/{name}`
//! - `GET /api/metrics`, `GET /api/status`
//! - `GET/POST /api/config` (POST takes a partial config)
//! - `POST /api/pause`, `POST /api/resume`
//!
//! Served with hyper on the process runtime, one task per connection.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::pipeline::config::ConfigUpdate;
use crate::pipeline::Ingestor;
use crate::store::FrameStore;

/// Default control-plane port.
pub const DEFAULT_ADMIN_PORT: u16 = 13480;

/// The admin API surface over a running pipeline.
pub struct AdminServer {
    ingestor: Arc<Ingestor>,
    store: Arc<FrameStore>,
    started_at: Instant,
}

impl AdminServer {
    pub fn new(ingestor: Arc<Ingestor>, store: Arc<FrameStore>) -> Arc<Self> {
        Arc::new(AdminServer {
            ingestor,
            store,
            started_at: Instant::now(),
        })
    }

    /// Bind the control-plane listener. Failure here is a fatal startup
    /// error for the caller to surface.
    pub async fn bind(port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("bind :{}: {}", port, e))))?;
        info!("admin server listening on port {}", port);
        Ok(listener)
    }

    /// Serve connections until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("admin accept error: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { Ok::<_, Infallible>(server.handle(req).await) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            error!("admin connection error: {}", e);
                        }
                    });
                }
            }
        }
        info!("admin server stopped");
        Ok(())
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method == Method::GET {
            return match path.as_str() {
                "/api/stations" => self.get_stations(),
                "/api/metrics" => self.get_metrics(),
                "/api/status" => json_response(StatusCode::OK, self.ingestor.statistics()),
                "/api/config" => json_response(StatusCode::OK, json!(self.ingestor.config())),
                _ => not_found(&path),
            };
        }

        if method == Method::POST {
            return match path.as_str() {
                "/api/stations" => match read_body(req).await {
                    Ok(body) => self.post_stations(&body),
                    Err(response) => response,
                },
                "/api/config" => match read_body(req).await {
                    Ok(body) => self.post_config(&body),
                    Err(response) => response,
                },
                "/api/pause" => {
                    self.ingestor.pause();
                    json_response(StatusCode::OK, json!({"success": true, "paused": true}))
                }
                "/api/resume" => {
                    self.ingestor.resume();
                    json_response(StatusCode::OK, json!({"success": true, "paused": false}))
                }
                _ => not_found(&path),
            };
        }

        if method == Method::DELETE {
            if let Some(name) = path.strip_prefix("/api/stations/") {
                return self.delete_station(name);
            }
        }

        not_found(&path)
    }

    fn get_stations(&self) -> Response<Full<Bytes>> {
        let stations: Vec<_> = self
            .ingestor
            .monitored_stations()
            .into_iter()
            .map(|name| json!({"name": name, "status": "active"}))
            .collect();
        json_response(StatusCode::OK, json!(stations))
    }

    fn post_stations(&self, body: &[u8]) -> Response<Full<Bytes>> {
        #[derive(serde::Deserialize)]
        struct AddStation {
            name: String,
        }
        match serde_json::from_slice::<AddStation>(body) {
            Ok(request) if !request.name.is_empty() => {
                self.ingestor.add_monitored_station(&request.name);
                json_response(
                    StatusCode::OK,
                    json!({"success": true, "station": request.name}),
                )
            }
            Ok(_) => json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "station name required"}),
            ),
            Err(e) => json_response(StatusCode::BAD_REQUEST, json!({"error": e.to_string()})),
        }
    }

    fn delete_station(&self, name: &str) -> Response<Full<Bytes>> {
        if name.is_empty() {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "station name required"}),
            );
        }
        self.ingestor.remove_monitored_station(name);
        json_response(StatusCode::OK, json!({"success": true, "station": name}))
    }

    fn post_config(&self, body: &[u8]) -> Response<Full<Bytes>> {
        match ConfigUpdate::from_json(body) {
            Ok(update) => {
                let config = self.ingestor.reconfigure(&update);
                json_response(StatusCode::OK, json!({"success": true, "config": config}))
            }
            Err(e) => json_response(StatusCode::BAD_REQUEST, json!({"error": e.to_string()})),
        }
    }

    fn get_metrics(&self) -> Response<Full<Bytes>> {
        let stats = self.ingestor.statistics();
        let fetched = stats["frames_fetched"].as_u64().unwrap_or(0);
        let failed = stats["frames_failed"].as_u64().unwrap_or(0);
        let total = fetched + failed;
        let uptime = self.started_at.elapsed().as_secs();
        let disk_bytes = self.store.total_disk_usage();

        json_response(
            StatusCode::OK,
            json!({
                "frames_fetched": fetched,
                "frames_failed": failed,
                "success_rate": if total > 0 { fetched as f64 / total as f64 } else { 0.0 },
                "disk_usage_mb": disk_bytes / (1024 * 1024),
                "disk_usage_gb": disk_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
                "frame_count": self.store.frame_count(),
                "avg_frames_per_minute": if uptime > 0 {
                    fetched as f64 / (uptime as f64 / 60.0)
                } else {
                    0.0
                },
                "uptime_seconds": uptime,
            }),
        )
    }
}

async fn read_body(req: Request<Incoming>) -> std::result::Result<Bytes, Response<Full<Bytes>>> {
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| json_response(StatusCode::BAD_REQUEST, json!({"error": e.to_string()})))
}

fn not_found(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        json!({"error": "not found", "path": path}),
    )
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    // Static parts; the builder cannot fail here
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}
