//! Protocol adapters.
//!
//! Each wire family implements [`ProtocolAdapter`]: a sniffer for the
//! multiplexer, a factory producing the per-connection handler (which owns
//! that connection's stream decoder), and the downlink encoders the command
//! path and outbound worker use. Frame handlers are registered on a
//! [`Router`] keyed by cmd; an unregistered cmd is logged and ignored,
//! never fatal.
//!
//! Handlers are side-effect-free with respect to the wire: they emit
//! [`CoreEvent`]s into the sink and enqueue replies on the outbound queue.

use crate::driver::EventSink;
use crate::gateway::conn::ConnContext;
use crate::metrics::Metrics;
use crate::outbound::OutboundQueue;
use crate::session::SessionRegistry;
use crate::store::Store;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use gw_protocol::{CoreCommand, ProtocolFamily};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod ap3000;
pub mod bkv;

pub use ap3000::Ap3000Adapter;
pub use bkv::BkvAdapter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("cannot encode command: {0}")]
    Encode(String),
    #[error("command not supported by family {family}: {kind}")]
    Unsupported {
        family: ProtocolFamily,
        kind: &'static str,
    },
    #[error("event sink: {0}")]
    Sink(String),
}

// ---------------------------------------------------------------------------
// Shared dependencies
// ---------------------------------------------------------------------------

/// Everything a frame handler may touch, injected once at startup.
pub struct AdapterDeps {
    pub sink: Arc<dyn EventSink>,
    pub registry: Arc<dyn SessionRegistry>,
    pub queue: Arc<OutboundQueue>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<Metrics>,
    /// Family B end-reason dictionary (code -> label), possibly empty.
    pub reason_map: HashMap<u8, String>,
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

/// One registered wire family.
pub trait ProtocolAdapter: Send + Sync {
    fn family(&self) -> ProtocolFamily;

    /// Whether the first bytes of a connection look like this family's
    /// leading magic.
    fn sniff(&self, prefix: &[u8]) -> bool;

    /// Produce the per-connection handler (owning its own decoder state).
    fn bind(&self, conn: Arc<ConnContext>) -> Box<dyn ConnHandler>;

    /// Encode a protocol-agnostic command into this family's (cmd, payload).
    fn encode_command(&self, command: &CoreCommand) -> Result<(u16, Vec<u8>), AdapterError>;

    /// Build the downlink frame bytes for an already-encoded command.
    fn build_downlink(&self, device_id: &str, msg_id: u32, cmd: u16, payload: &[u8]) -> Vec<u8>;
}

/// Per-connection byte consumer. The read loop feeds it every chunk after
/// the multiplexer has decided the family.
#[async_trait]
pub trait ConnHandler: Send {
    async fn process_bytes(&mut self, data: &[u8]) -> Result<(), AdapterError>;
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub type RouteFuture = BoxFuture<'static, Result<(), AdapterError>>;

/// A frame handler: plain fn taking owned Arcs so the future is 'static.
pub type RouteFn<F> = fn(Arc<AdapterDeps>, Arc<ConnContext>, F) -> RouteFuture;

/// cmd -> handler mapping for one family.
pub struct Router<F> {
    family: ProtocolFamily,
    routes: HashMap<u16, RouteFn<F>>,
}

impl<F> Router<F> {
    pub fn new(family: ProtocolFamily) -> Router<F> {
        Router {
            family,
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, cmd: u16, handler: RouteFn<F>) {
        self.routes.insert(cmd, handler);
    }

    pub fn registered_cmds(&self) -> Vec<u16> {
        let mut cmds: Vec<u16> = self.routes.keys().copied().collect();
        cmds.sort_unstable();
        cmds
    }

    /// Dispatch one frame. Handler errors are returned to the caller; the
    /// adapter logs them without tearing the connection down.
    pub async fn dispatch(
        &self,
        deps: Arc<AdapterDeps>,
        conn: Arc<ConnContext>,
        cmd: u16,
        frame: F,
    ) -> Result<(), AdapterError> {
        deps.metrics
            .route_total
            .with_label_values(&[self.family.as_str(), &format!("{cmd:#06x}")])
            .inc();
        match self.routes.get(&cmd) {
            Some(handler) => handler(deps, conn, frame).await,
            None => {
                debug!(family = %self.family, cmd = %format!("{cmd:#06x}"), "unregistered cmd, ignoring");
                Ok(())
            }
        }
    }
}

/// Log-and-continue wrapper used by both families' `process_bytes`.
pub(crate) fn log_handler_error(family: ProtocolFamily, cmd: u16, result: Result<(), AdapterError>) {
    if let Err(e) = result {
        warn!(family = %family, cmd = %format!("{cmd:#06x}"), error = %e, "frame handler failed");
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
