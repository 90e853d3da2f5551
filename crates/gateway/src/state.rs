use std::sync::Arc;

use dd_backend::SandboxBackend;
use dd_domain::config::Config;
use dd_store::Store;

use crate::lifecycle::LifecycleManager;
use crate::tunnel::registry::TunnelRegistry;

/// Shared application state passed to all handlers.
///
/// Everything is composed once at startup and injected; components talk to
/// the store and backend through their traits so tests can slot in fakes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub backend: Arc<dyn SandboxBackend>,
    pub lifecycle: Arc<LifecycleManager>,
    pub tunnels: Arc<TunnelRegistry>,
    /// Client for forwarding proxied requests. Built without a total
    /// timeout: responses stream indefinitely (SSE), guarded by idle reads.
    pub http: reqwest::Client,
    /// The operator's real upstream credential, resolved from the
    /// environment once at startup. `None` disables the upstream proxy.
    pub upstream_key: Option<Arc<str>>,
}
