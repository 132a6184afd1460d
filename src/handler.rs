use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::call::inbound::InboundCall;
use crate::checksum::Checksum;
use crate::connection::ConnInner;
use crate::error::CallError;
use crate::fragment::reader::InFragment;
use crate::frame::Frame;
use crate::messages::{CallReqFields, ErrorCode};

/// Application entry point for incoming calls. A handler reads arg2/arg3
///  from the call and answers through `call.response()`; returning an error
///  before the response is complete produces a system error frame.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, call: InboundCall) -> Result<(), CallError>;
}

/// Adapter that lets a plain async closure act as a `Handler`.
pub(crate) struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub(crate) fn new(f: F) -> FnHandler<F> {
        FnHandler { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallError>> + Send + 'static,
{
    async fn handle(&self, call: InboundCall) -> Result<(), CallError> {
        (self.f)(call).await
    }
}

/// Registry of handlers by service and operation, shared by all connections
///  of a channel.
pub(crate) struct HandlerMap {
    handlers: RwLock<FxHashMap<String, FxHashMap<Vec<u8>, Arc<dyn Handler>>>>,
}

impl HandlerMap {
    pub(crate) fn new() -> HandlerMap {
        HandlerMap {
            handlers: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) async fn register(&self, service: &str, operation: &[u8], handler: Arc<dyn Handler>) {
        let mut handlers = self.handlers.write().await;
        let operations = handlers.entry(service.to_string()).or_default();
        if operations.insert(operation.to_vec(), handler).is_some() {
            warn!("replacing handler for {}::{:?}", service, String::from_utf8_lossy(operation));
        }
    }

    pub(crate) async fn find(&self, service: &str, operation: &[u8]) -> Option<Arc<dyn Handler>> {
        self.handlers.read().await
            .get(service)
            .and_then(|operations| operations.get(operation))
            .cloned()
    }
}

/// Runs an inbound call: reads the operation, resolves the handler, and
///  polices the call's deadline around the handler body. Cleanup of the
///  call's registry entry happens here, exactly once.
pub(crate) fn spawn_inbound_dispatch(
    conn: Arc<ConnInner>,
    id: u32,
    fields: CallReqFields,
    first: InFragment,
    checksum: Option<Checksum>,
    rx: mpsc::Receiver<Frame>,
) {
    tokio::spawn(async move {
        let deadline = Instant::now() + Duration::from_millis(fields.ttl_ms.into());
        let service = fields.service.clone();

        let mut call = InboundCall::new(conn.clone(), id, fields, first, checksum, rx, deadline);
        let completed = call.response().completion_flag();

        if let Err(e) = call.read_operation().await {
            warn!("could not read operation of call {}: {}", id, e);
            conn.inbound_call_complete(id);
            return;
        }
        let operation = call.operation().to_vec();

        let Some(handler) = conn.handlers().find(&service, &operation).await else {
            error!("no handler for {}::{}", service, String::from_utf8_lossy(&operation));
            let _ = conn.sender().send_error(ErrorCode::BadRequest, id, "no handler for service and operation");
            conn.inbound_call_complete(id);
            return;
        };

        debug!("dispatching call {} to {}::{}", id, service, String::from_utf8_lossy(&operation));

        match timeout_at(deadline, handler.handle(call)).await {
            Err(_elapsed) => {
                if !completed.load(Ordering::Relaxed) {
                    debug!("call {} exceeded its deadline in the handler", id);
                    let _ = conn.sender().send_error(ErrorCode::Timeout, id, "request timed out");
                }
            }
            Ok(Err(e)) => {
                if !completed.load(Ordering::Relaxed) {
                    warn!("handler for call {} failed: {}", id, e);
                    let _ = conn.sender().send_error(e.wire_code(), id, &e.to_string());
                }
            }
            Ok(Ok(())) => {
                if !completed.load(Ordering::Relaxed) {
                    warn!("handler for call {} returned without completing the response", id);
                    let _ = conn.sender().send_error(ErrorCode::UnexpectedError, id, "handler did not produce a response");
                }
            }
        }

        conn.inbound_call_complete(id);
    });
}
