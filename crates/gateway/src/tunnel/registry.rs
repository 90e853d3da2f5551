//! In-memory registry of connected tunnels and per-request stream fan-out.
//!
//! One tunnel per sandbox: registering a new connection evicts any prior
//! tunnel for that sandbox (reconnect scenario). Each in-flight proxied
//! request owns a bounded channel; stream frames arriving on the WebSocket
//! are pushed onto it in arrival order and the proxy drains it to the
//! browser. Channel closure is the only completion signal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dd_protocol::FrameHeader;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stream-channel capacity per in-flight request. Reads from the tunnel
/// block on channel space, which throttles the local agent when a browser
/// reads slowly.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// One decoded `stream` frame, ready for the waiting proxy.
#[derive(Debug)]
pub struct StreamEvent {
    pub status: Option<u16>,
    pub headers: Option<std::collections::BTreeMap<String, String>>,
    pub chunk: Vec<u8>,
    pub done: bool,
}

/// A message the server pushes to the tunnel's WebSocket writer task.
pub type TunnelSink = mpsc::Sender<Vec<u8>>;

/// A connected tunnel for one local sandbox.
pub struct Tunnel {
    pub sandbox_id: Uuid,
    pub connected_at: DateTime<Utc>,
    sink: TunnelSink,
    /// request id → stream channel of the waiting proxy request.
    pending: Mutex<HashMap<String, mpsc::Sender<StreamEvent>>>,
    shutdown: CancellationToken,
    last_seen: Mutex<DateTime<Utc>>,
}

impl Tunnel {
    pub fn new(sandbox_id: Uuid, sink: TunnelSink) -> Self {
        Self {
            sandbox_id,
            connected_at: Utc::now(),
            sink,
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            last_seen: Mutex::new(Utc::now()),
        }
    }

    /// Fires when the tunnel is evicted or torn down.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Utc::now();
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    /// Send an encoded request frame to the agent, registering a stream
    /// channel for its response. Returns the receiving end.
    pub async fn open_request(
        &self,
        request_id: &str,
        encoded: Vec<u8>,
    ) -> Result<mpsc::Receiver<StreamEvent>, TunnelGone> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.pending.lock().insert(request_id.to_string(), tx);
        if self.sink.send(encoded).await.is_err() {
            self.pending.lock().remove(request_id);
            return Err(TunnelGone);
        }
        Ok(rx)
    }

    /// Deliver one stream frame to its waiter, preserving socket arrival
    /// order. Awaits channel space (backpressure on the agent). Frames for
    /// unknown ids are dropped — the browser has gone away.
    pub async fn deliver(&self, header: &FrameHeader, payload: Vec<u8>) {
        let FrameHeader::Stream { id, status, headers, done } = header else {
            tracing::debug!(sandbox_id = %self.sandbox_id, "ignoring non-stream frame from agent");
            return;
        };
        let sender = self.pending.lock().get(id).cloned();
        let Some(sender) = sender else {
            tracing::debug!(request_id = %id, "stream frame for unknown request");
            return;
        };
        let event = StreamEvent {
            status: *status,
            headers: headers.clone(),
            chunk: payload,
            done: *done,
        };
        let done = event.done;
        if sender.send(event).await.is_err() {
            // Waiter dropped mid-stream (browser disconnect).
            self.pending.lock().remove(id);
            return;
        }
        if done {
            self.pending.lock().remove(id);
        }
    }

    /// Forget a waiter (browser disconnected). No abort frame is sent to
    /// the agent; its own timeouts cover the dangling request.
    pub fn deregister(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
    }

    /// Evict all waiters (tunnel teardown). Dropping the senders closes
    /// every stream channel, which the proxy surfaces as a gateway error.
    pub fn fail_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn close(&self) {
        let failed = self.fail_pending();
        self.shutdown.cancel();
        if failed > 0 {
            tracing::warn!(
                sandbox_id = %self.sandbox_id,
                failed_in_flight = failed,
                "tunnel closed with requests in flight"
            );
        }
    }
}

/// Thread-safe registry of all connected tunnels.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<Uuid, Arc<Tunnel>>>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self { tunnels: RwLock::new(HashMap::new()) }
    }

    /// Register a tunnel, evicting (and closing) any prior one for the
    /// same sandbox.
    pub fn register(&self, tunnel: Arc<Tunnel>) {
        let prior = self
            .tunnels
            .write()
            .insert(tunnel.sandbox_id, tunnel.clone());
        if let Some(prior) = prior {
            tracing::info!(sandbox_id = %tunnel.sandbox_id, "evicting replaced tunnel");
            prior.close();
        }
        tracing::info!(sandbox_id = %tunnel.sandbox_id, "tunnel registered");
    }

    pub fn get(&self, sandbox_id: Uuid) -> Option<Arc<Tunnel>> {
        self.tunnels.read().get(&sandbox_id).cloned()
    }

    /// Remove and close the tunnel for a sandbox (delete, token rotation).
    pub fn remove(&self, sandbox_id: Uuid) -> Option<Arc<Tunnel>> {
        let removed = self.tunnels.write().remove(&sandbox_id);
        if let Some(tunnel) = &removed {
            tunnel.close();
        }
        removed
    }

    /// Remove only if `tunnel` is still the registered instance, so a
    /// disconnecting socket never tears down its replacement.
    pub fn remove_exact(&self, tunnel: &Arc<Tunnel>) -> bool {
        let mut tunnels = self.tunnels.write();
        match tunnels.get(&tunnel.sandbox_id) {
            Some(current) if Arc::ptr_eq(current, tunnel) => {
                tunnels.remove(&tunnel.sandbox_id);
                tunnel.close();
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.read().is_empty()
    }

    /// Close every tunnel (graceful shutdown).
    pub fn drain(&self) {
        let mut tunnels = self.tunnels.write();
        for tunnel in tunnels.values() {
            tunnel.close();
        }
        tunnels.clear();
    }
}

/// The tunnel's outbound socket is gone.
#[derive(Debug)]
pub struct TunnelGone;

impl std::fmt::Display for TunnelGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tunnel disconnected")
    }
}

impl std::error::Error for TunnelGone {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn stream_header(id: &str, first: bool, done: bool) -> FrameHeader {
        FrameHeader::Stream {
            id: id.into(),
            status: first.then_some(200),
            headers: first.then(BTreeMap::new),
            done,
        }
    }

    #[tokio::test]
    async fn frames_arrive_in_order_and_done_completes() {
        let (sink, mut outbound) = mpsc::channel(8);
        let tunnel = Tunnel::new(Uuid::new_v4(), sink);

        let mut rx = tunnel.open_request("r1", vec![1, 2, 3]).await.unwrap();
        // The encoded request frame reached the writer.
        assert_eq!(outbound.recv().await.unwrap(), vec![1, 2, 3]);

        tunnel.deliver(&stream_header("r1", true, false), b"he".to_vec()).await;
        tunnel.deliver(&stream_header("r1", false, false), b"ll".to_vec()).await;
        tunnel.deliver(&stream_header("r1", false, true), b"o".to_vec()).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, Some(200));
        assert_eq!(first.chunk, b"he");
        assert!(!first.done);
        assert_eq!(rx.recv().await.unwrap().chunk, b"ll");
        let last = rx.recv().await.unwrap();
        assert!(last.done);
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_request_frames_are_dropped() {
        let (sink, _outbound) = mpsc::channel(8);
        let tunnel = Tunnel::new(Uuid::new_v4(), sink);
        // Must not panic or register anything.
        tunnel.deliver(&stream_header("ghost", true, true), vec![]).await;
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn eviction_closes_prior_tunnel_and_fails_waiters() {
        let registry = TunnelRegistry::new();
        let id = Uuid::new_v4();

        let (sink_a, _out_a) = mpsc::channel(8);
        let a = Arc::new(Tunnel::new(id, sink_a));
        registry.register(a.clone());
        let mut rx = a.open_request("r1", vec![]).await.unwrap();

        let (sink_b, _out_b) = mpsc::channel(8);
        let b = Arc::new(Tunnel::new(id, sink_b));
        registry.register(b.clone());

        // Prior tunnel's waiters are gone and its shutdown fired.
        assert!(rx.recv().await.is_none());
        assert!(a.shutdown_signal().is_cancelled());
        assert!(!b.shutdown_signal().is_cancelled());
        assert_eq!(registry.len(), 1);

        // The stale connection's cleanup must not evict the replacement.
        assert!(!registry.remove_exact(&a));
        assert!(registry.get(id).is_some());
        assert!(registry.remove_exact(&b));
        assert!(registry.get(id).is_none());
    }

    #[tokio::test]
    async fn deregistered_waiters_stop_receiving() {
        let (sink, _out) = mpsc::channel(8);
        let tunnel = Tunnel::new(Uuid::new_v4(), sink);
        let mut rx = tunnel.open_request("r1", vec![]).await.unwrap();
        tunnel.deregister("r1");
        tunnel.deliver(&stream_header("r1", true, true), b"x".to_vec()).await;
        assert!(rx.recv().await.is_none());
    }
}
