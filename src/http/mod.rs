//! The HTTP side-channel.
//!
//! Served over a Unix-domain socket; a local reverse proxy terminates the
//! public side and enforces access to the admin surface. The router and
//! its shared state live here; the per-zone endpoint handlers live next to
//! their zones.

pub mod admin;
pub mod ipinfo;
pub mod lookup;
pub mod turnstile;
pub mod values;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use camino::Utf8Path;
use tokio::net::UnixListener;
use tracing::info;

use crate::store::TtlStore;
use crate::zones::dnscheck::watch::WatcherHub;
use crate::zones::dnscheck::ws;
use crate::zones::{challenges, dynaddr, myaddr};

use self::turnstile::Turnstile;

/// Shared state of every HTTP endpoint.
pub struct App {
    pub persistent: Arc<TtlStore>,
    pub challenges: Arc<TtlStore>,
    /// The challenges zone name, when one is configured.
    pub challenges_zone: Option<String>,
    /// The dyn zone name, when one is configured.
    pub dyn_zone: Option<String>,
    pub myaddr_prefix: String,
    pub turnstile: Option<Turnstile>,
    pub watchers: Arc<WatcherHub>,
    pub lookup_upstream: Option<String>,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/challenges", any(challenges::http_handler))
        .route("/dyn", any(dynaddr::http_handler))
        .route("/myaddr-reg", any(myaddr::registration_handler))
        .route("/myaddr-update", any(myaddr::update_handler))
        .route("/admin/db", any(admin::handler))
        .route("/admin/db/", any(admin::handler))
        .route("/admin/db/{*key}", any(admin::handler))
        .route("/dns/{name}/{type}", get(lookup::handler))
        .route("/watch/{watcher}", get(ws::handler))
        .with_state(app)
}

/// Bind the Unix socket (replacing any stale one), open it up mode 0666
/// and serve forever.
pub async fn serve_unix(path: &Utf8Path, router: Router) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    info!("http listening on {path}");
    axum::serve(listener, router).await
}
