//! HTTP stats server for bundle monitoring.
//!
//! Serves `GET /stats` with a JSON array holding one snapshot per bundle.
//! Runs on a plain thread with `tiny_http`, independent of the async
//! runtime that drives the bundles.
//!
//! # Example Response
//!
//! ```json
//! [
//!   {
//!     "name": "uplink",
//!     "uptime_secs": 42,
//!     "totals": { "xmit_frames": 10, "recv_frames": 12, "drop_fragments": 1, ... },
//!     "delivered": 6,
//!     "stale_deliveries": 0,
//!     "forced_advances": 0,
//!     "links": [ { "id": 0, "xmit_frames": 5, ... } ]
//!   }
//! ]
//! ```

use super::BundleStats;
use log::{error, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// Poll interval for the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// HTTP stats server.
///
/// Drop it to stop the server.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    port: u16,
}

impl StatsServer {
    /// Start serving the given bundles.
    ///
    /// `bind_addr` of `None` binds to all interfaces. Port 0 picks a free
    /// port; see [`StatsServer::port`].
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        bundles: Vec<Arc<BundleStats>>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .unwrap_or(port);

        info!("Stats server listening on port {} (/stats)", port);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::spawn(move || {
            Self::run_server(server, bundles, shutdown_clone);
        });

        Ok(Self {
            handle: Some(handle),
            shutdown,
            port,
        })
    }

    /// Port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn run_server(server: Server, bundles: Vec<Arc<BundleStats>>, shutdown: Arc<AtomicBool>) {
        let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]);
        let allow_get = Header::from_bytes(&b"Allow"[..], &b"GET"[..]);

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            let request = match server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    error!("Stats server error: {}", e);
                    break;
                }
            };

            if request.method() != &Method::Get {
                let mut response = Response::from_string("Method Not Allowed").with_status_code(405);
                if let Ok(h) = allow_get.clone() {
                    response = response.with_header(h);
                }
                let _ = request.respond(response);
                continue;
            }

            let is_stats = matches!(request.url(), "/stats" | "/stats/");
            let result = if is_stats {
                let mut response = Response::from_string(render(&bundles)).with_status_code(200);
                if let Ok(h) = content_type.clone() {
                    response = response.with_header(h);
                }
                request.respond(response)
            } else {
                request.respond(Response::from_string("Not Found").with_status_code(404))
            };
            if let Err(e) = result {
                warn!("Failed to send stats response: {}", e);
            }
        }
    }

    /// Stop the server and wait for its thread.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// JSON array of bundle snapshots.
fn render(bundles: &[Arc<BundleStats>]) -> String {
    let snapshots: Vec<_> = bundles.iter().map(|b| b.snapshot()).collect();
    serde_json::to_string(&snapshots).unwrap_or_else(|_| "[]".to_string())
}
