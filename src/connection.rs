use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::call::outbound::OutboundCall;
use crate::checksum::Checksum;
use crate::config::ChannelConfig;
use crate::error::{CallError, ProtocolError};
use crate::fixed_buffer::FixedBuf;
use crate::fragment::reader::InFragment;
use crate::frame::{Frame, FrameHeader, FrameType, FRAME_HEADER_LEN};
use crate::frame_pool::FramePool;
use crate::handler::{spawn_inbound_dispatch, HandlerMap};
use crate::messages::{
    CallReqFields, ErrorBody, ErrorCode, InitFields, Tracing, INIT_HEADER_HOST_PORT,
    INIT_HEADER_PROCESS_NAME, PROTOCOL_VERSION,
};
use crate::safe_converter::SafeCast;

/// Identity of an endpoint: where it can be reached and what it calls itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub host_port: String,
    pub process_name: String,
}

impl Display for PeerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.host_port, self.process_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// accepted connection waiting for the peer's InitReq
    WaitRecvInitReq,
    /// dialed connection that has not sent its InitReq yet
    WaitSendInitReq,
    /// dialed connection waiting for the peer's InitRes
    WaitRecvInitRes,
    Active,
    /// local close initiated: new inbound calls are declined, pending
    /// outbound calls may complete
    StartClose,
    /// all inbound calls drained, waiting for outbound calls
    InboundClosed,
    Closed,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::WaitRecvInitReq => "WaitRecvInitReq",
            ConnectionState::WaitSendInitReq => "WaitSendInitReq",
            ConnectionState::WaitRecvInitRes => "WaitRecvInitRes",
            ConnectionState::Active => "Active",
            ConnectionState::StartClose => "StartClose",
            ConnectionState::InboundClosed => "InboundClosed",
            ConnectionState::Closed => "Closed",
        }
    }

    /// call frames are accepted in these states (subject to drain rules)
    fn handshake_done(&self) -> bool {
        matches!(
            self,
            ConnectionState::Active | ConnectionState::StartClose | ConnectionState::InboundClosed
        )
    }
}

/// Handle for enqueueing frames on a connection's bounded writer queue.
///  Enqueueing never blocks: a saturated queue surfaces as `SendBufferFull`.
#[derive(Clone)]
pub(crate) struct FrameSender {
    tx: mpsc::Sender<Frame>,
    pool: Arc<FramePool>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<Frame>, pool: Arc<FramePool>) -> FrameSender {
        FrameSender { tx, pool }
    }

    pub(crate) fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub(crate) fn send(&self, id: u32, frame_type: FrameType, payload: FixedBuf) -> Result<(), CallError> {
        let frame = match Frame::new(id, frame_type, payload) {
            Ok(frame) => frame,
            Err(e) => return Err(CallError::Protocol(e)),
        };

        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.pool.release(frame.payload);
                Err(CallError::SendBufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                self.pool.release(frame.payload);
                Err(CallError::ConnectionClosed)
            }
        }
    }

    pub(crate) fn send_error(&self, code: ErrorCode, id: u32, message: &str) -> Result<(), CallError> {
        let mut payload = self.pool.get();
        ErrorBody { code, id, message: message.to_string() }.ser(&mut payload);
        self.send(id, FrameType::Error, payload)
    }

    fn send_init(&self, frame_type: FrameType, id: u32, fields: &InitFields) -> Result<(), CallError> {
        let mut payload = self.pool.get();
        fields.ser(&mut payload);
        self.send(id, frame_type, payload)
    }
}

pub(crate) struct ConnInner {
    config: Arc<ChannelConfig>,
    local_peer: PeerInfo,
    remote_peer: RwLock<Option<PeerInfo>>,
    state: RwLock<ConnectionState>,
    sender: FrameSender,
    pool: Arc<FramePool>,
    next_id: AtomicU32,
    /// message id -> fragment channel of the inbound call being reassembled
    inbound: Mutex<FxHashMap<u32, mpsc::Sender<Frame>>>,
    /// message id -> response waiter of an outbound call (or init / ping)
    outbound: Mutex<FxHashMap<u32, mpsc::Sender<Frame>>>,
    handlers: Arc<HandlerMap>,
    shutdown: Notify,
}

impl ConnInner {
    pub(crate) fn sender(&self) -> &FrameSender {
        &self.sender
    }

    pub(crate) fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn handlers(&self) -> &Arc<HandlerMap> {
        &self.handlers
    }

    pub(crate) fn remote_peer_info(&self) -> Option<PeerInfo> {
        self.remote_peer.read().unwrap().clone()
    }

    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    /// Reserves the next free outbound message id and registers a response
    ///  waiter for it. Ids wrap around skipping the reserved value 0 and any
    ///  id still held by a pending call.
    pub(crate) fn register_outbound(&self) -> (u32, mpsc::Receiver<Frame>) {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }

            let (tx, rx) = mpsc::channel(self.config.recv_buffer_size);
            let mut outbound = self.outbound.lock().unwrap();
            if outbound.contains_key(&id) {
                continue;
            }
            outbound.insert(id, tx);
            return (id, rx);
        }
    }

    pub(crate) fn inbound_call_complete(&self, id: u32) {
        if self.inbound.lock().unwrap().remove(&id).is_some() {
            trace!("inbound call {} released", id);
        }
        self.maybe_advance_close();
    }

    pub(crate) fn outbound_call_complete(&self, id: u32) {
        if self.outbound.lock().unwrap().remove(&id).is_some() {
            trace!("outbound call {} released", id);
        }
        self.maybe_advance_close();
    }

    /// A protocol violation was observed: report it to the peer if the send
    ///  queue still has room, then tear the connection down.
    pub(crate) fn protocol_fault(&self, error: &ProtocolError) {
        error!("protocol error, closing connection: {}", error);
        let _ = self.sender.send_error(ErrorCode::ProtocolError, 0, &error.to_string());
        self.to_closed();
    }

    /// Moves the connection to `Closed` and releases everything exactly once.
    fn to_closed(&self) {
        {
            let mut state = self.state.write().unwrap();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        debug!("connection to {:?} closed", self.remote_peer.read().unwrap().as_ref().map(|p| p.to_string()));
        self.shutdown.notify_waiters();

        // dropping the per-call senders wakes every live call with a
        // cancellation error
        self.inbound.lock().unwrap().clear();
        self.outbound.lock().unwrap().clear();
    }

    /// Drives the graceful-close ladder: StartClose empties into
    ///  InboundClosed once no inbound call is live, InboundClosed into
    ///  Closed once the last outbound call is released.
    fn maybe_advance_close(&self) {
        let close_now = {
            let mut state = self.state.write().unwrap();
            if *state == ConnectionState::StartClose && self.inbound.lock().unwrap().is_empty() {
                debug!("all inbound calls drained");
                *state = ConnectionState::InboundClosed;
            }
            *state == ConnectionState::InboundClosed && self.outbound.lock().unwrap().is_empty()
        };

        if close_now {
            self.to_closed();
        }
    }
}

/// A bidirectional connection to one remote peer, multiplexing any number of
///  in-flight calls in both directions over a single TCP stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Wraps an accepted socket; the peer is expected to initiate the
    ///  handshake.
    pub(crate) fn inbound(
        stream: TcpStream,
        config: Arc<ChannelConfig>,
        handlers: Arc<HandlerMap>,
        local_peer: PeerInfo,
    ) -> Connection {
        Self::spawn(stream, config, handlers, local_peer, ConnectionState::WaitRecvInitReq)
    }

    /// Wraps a dialed socket and runs the init handshake.
    pub(crate) async fn outbound(
        stream: TcpStream,
        config: Arc<ChannelConfig>,
        handlers: Arc<HandlerMap>,
        local_peer: PeerInfo,
    ) -> anyhow::Result<Connection> {
        let conn = Self::spawn(stream, config, handlers, local_peer, ConnectionState::WaitSendInitReq);
        conn.send_init().await?;
        Ok(conn)
    }

    fn spawn(
        stream: TcpStream,
        config: Arc<ChannelConfig>,
        handlers: Arc<HandlerMap>,
        local_peer: PeerInfo,
        initial_state: ConnectionState,
    ) -> Connection {
        let (send_tx, send_rx) = mpsc::channel(config.send_buffer_size);
        let pool = Arc::new(FramePool::new(config.frame_pool_size));

        let inner = Arc::new(ConnInner {
            config,
            local_peer,
            remote_peer: RwLock::new(None),
            state: RwLock::new(initial_state),
            sender: FrameSender::new(send_tx, pool.clone()),
            pool,
            next_id: AtomicU32::new(0),
            inbound: Mutex::new(FxHashMap::default()),
            outbound: Mutex::new(FxHashMap::default()),
            handlers,
            shutdown: Notify::new(),
        });

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(reader_loop(inner.clone(), read_half));
        tokio::spawn(writer_loop(inner.clone(), write_half, send_rx));

        Connection { inner }
    }

    /// Initiates the handshake with the peer and waits for its InitRes.
    async fn send_init(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write().unwrap();
            match *state {
                ConnectionState::WaitSendInitReq => *state = ConnectionState::WaitRecvInitRes,
                ConnectionState::WaitRecvInitReq => bail!("connection is waiting for the peer to send init"),
                ConnectionState::Closed | ConnectionState::StartClose | ConnectionState::InboundClosed => {
                    bail!("connection is closed")
                }
                _ => bail!("connection is already active"),
            }
        }

        let (id, mut rx) = inner.register_outbound();
        let fields = InitFields::new(&inner.local_peer.host_port, &inner.local_peer.process_name);
        if let Err(e) = inner.sender.send_init(FrameType::InitReq, id, &fields) {
            inner.outbound_call_complete(id);
            inner.to_closed();
            bail!("could not send init request: {}", e);
        }

        let received = timeout(inner.config.handshake_timeout, rx.recv()).await;
        inner.outbound_call_complete(id);

        let frame = match received {
            Err(_) => {
                inner.to_closed();
                bail!("handshake timed out");
            }
            Ok(None) => bail!("connection closed during handshake"),
            Ok(Some(frame)) => frame,
        };

        if frame.header.frame_type == FrameType::Error {
            let body = ErrorBody::deser(&mut frame.payload.as_ref())?;
            inner.pool.release(frame.payload);
            inner.to_closed();
            bail!("peer rejected init: {:?}: {}", body.code, body.message);
        }

        let init = InitFields::deser(&mut frame.payload.as_ref());
        inner.pool.release(frame.payload);
        let init = init?;

        if init.version != PROTOCOL_VERSION {
            let fault = ProtocolError::VersionMismatch { expected: PROTOCOL_VERSION, actual: init.version };
            inner.protocol_fault(&fault);
            bail!(fault);
        }

        *inner.remote_peer.write().unwrap() = Some(remote_peer_from_init(&init)?);

        {
            let mut state = inner.state.write().unwrap();
            if *state == ConnectionState::WaitRecvInitRes {
                *state = ConnectionState::Active;
            }
        }

        info!("connection to {} is active", self.remote_peer().expect("remote peer set during handshake"));
        Ok(())
    }

    pub fn remote_peer(&self) -> Option<PeerInfo> {
        self.inner.remote_peer.read().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state() == ConnectionState::Closed
    }

    /// Begins a graceful close: new inbound calls are declined, pending
    ///  calls drain, and the socket closes once both registries are empty.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.write().unwrap();
            match *state {
                ConnectionState::Active => *state = ConnectionState::StartClose,
                ConnectionState::StartClose | ConnectionState::InboundClosed | ConnectionState::Closed => {}
                _ => {
                    // handshake never completed, nothing to drain
                    drop(state);
                    self.inner.to_closed();
                    return;
                }
            }
        }
        self.inner.maybe_advance_close();
    }

    /// Starts an outbound call: reserves a message id, sends the operation
    ///  name as arg1, and hands back the call for writing arg2 / arg3.
    pub async fn begin_call(
        &self,
        service: &str,
        operation: &[u8],
        ttl: Duration,
    ) -> Result<OutboundCall, CallError> {
        if self.inner.state() != ConnectionState::Active {
            return Err(CallError::ConnectionClosed);
        }

        let (id, rx) = self.inner.register_outbound();
        debug!("beginning call {} to service {:?}", id, service);

        let fields = CallReqFields {
            ttl_ms: ttl.as_millis().min(u32::MAX as u128) as u32,
            tracing: Tracing::default(),
            service: service.to_string(),
            headers: Vec::new(),
        };

        let mut call = OutboundCall::new(self.inner.clone(), id, rx, fields, Instant::now() + ttl);
        call.write_operation(operation).await?;
        Ok(call)
    }

    /// Round-trips an empty control message through the peer.
    pub async fn ping(&self) -> Result<(), CallError> {
        if !self.inner.state().handshake_done() {
            return Err(CallError::ConnectionClosed);
        }

        let (id, mut rx) = self.inner.register_outbound();
        if let Err(e) = self.inner.sender.send(id, FrameType::PingReq, self.inner.pool.get()) {
            self.inner.outbound_call_complete(id);
            return Err(e);
        }

        let received = timeout(self.inner.config.handshake_timeout, rx.recv()).await;
        self.inner.outbound_call_complete(id);

        match received {
            Err(_) => Err(CallError::TimedOut),
            Ok(None) => Err(CallError::Cancelled),
            Ok(Some(frame)) => {
                let frame_type = frame.header.frame_type;
                self.inner.pool.release(frame.payload);
                match frame_type {
                    FrameType::PingRes => Ok(()),
                    other => Err(CallError::Protocol(ProtocolError::UnexpectedFrame(other, "Active"))),
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ConnInner> {
        &self.inner
    }
}

fn remote_peer_from_init(init: &InitFields) -> Result<PeerInfo, ProtocolError> {
    let host_port = init.header(INIT_HEADER_HOST_PORT)
        .ok_or(ProtocolError::MissingInitHeader(INIT_HEADER_HOST_PORT))?;
    let process_name = init.header(INIT_HEADER_PROCESS_NAME)
        .ok_or(ProtocolError::MissingInitHeader(INIT_HEADER_PROCESS_NAME))?;
    Ok(PeerInfo {
        host_port: host_port.to_string(),
        process_name: process_name.to_string(),
    })
}

/// Single consumer of the socket: reads exactly one frame at a time and
///  dispatches it without blocking on application work.
async fn reader_loop(inner: Arc<ConnInner>, read_half: OwnedReadHalf) {
    tokio::select! {
        _ = inner.shutdown.notified() => {
            trace!("reader loop shutting down");
        }
        result = read_frames(&inner, read_half) => {
            if let Err(e) = result {
                debug!("reader loop terminated: {}", e);
                match e.downcast_ref::<ProtocolError>() {
                    Some(protocol_error) => inner.protocol_fault(protocol_error),
                    None => inner.to_closed(),
                }
            }
        }
    }
}

async fn read_frames(inner: &Arc<ConnInner>, mut read_half: OwnedReadHalf) -> anyhow::Result<()> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];

    loop {
        read_half.read_exact(&mut header_buf).await?;
        let header = FrameHeader::deser(&mut header_buf.as_slice())?;

        let mut payload = inner.pool.get();
        payload.maximize_len();
        let size: usize = header.size.safe_cast();
        read_half.read_exact(&mut payload.as_mut()[..size]).await?;
        payload.truncate(size);

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "frame_received", ?correlation_id);
        span.in_scope(|| {
            trace!("received frame id={} type={:?} size={}", header.id, header.frame_type, header.size);
            dispatch_frame(inner, header, payload)
        })?;
    }
}

/// Routes one received frame. O(1) apart from parsing; call frames are
///  handed to their per-call channels without waiting for the application.
fn dispatch_frame(inner: &Arc<ConnInner>, header: FrameHeader, payload: FixedBuf) -> anyhow::Result<()> {
    let state = inner.state();
    if state == ConnectionState::Closed {
        inner.pool.release(payload);
        return Ok(());
    }

    match header.frame_type {
        FrameType::InitReq => handle_init_req(inner, state, header, payload),
        FrameType::InitRes => {
            if state != ConnectionState::WaitRecvInitRes {
                inner.pool.release(payload);
                bail!(ProtocolError::UnexpectedFrame(FrameType::InitRes, state.name()));
            }
            deliver_outbound(inner, header.id, Frame { header, payload });
            Ok(())
        }
        frame_type if !state.handshake_done() => {
            // only init frames are legal before the handshake completes
            inner.pool.release(payload);
            bail!(ProtocolError::UnexpectedFrame(frame_type, state.name()));
        }
        FrameType::CallReq => handle_call_req(inner, state, header, payload),
        FrameType::CallReqCont => {
            handle_call_req_cont(inner, state, header, payload);
            Ok(())
        }
        FrameType::CallRes | FrameType::CallResCont | FrameType::PingRes => {
            deliver_outbound(inner, header.id, Frame { header, payload });
            Ok(())
        }
        FrameType::PingReq => {
            inner.pool.release(payload);
            if let Err(e) = inner.sender.send(header.id, FrameType::PingRes, inner.pool.get()) {
                warn!("could not answer ping {}: {}", header.id, e);
            }
            Ok(())
        }
        FrameType::Error => handle_error_frame(inner, header, payload),
    }
}

fn handle_init_req(
    inner: &Arc<ConnInner>,
    state: ConnectionState,
    header: FrameHeader,
    payload: FixedBuf,
) -> anyhow::Result<()> {
    let init = InitFields::deser(&mut payload.as_ref());
    inner.pool.release(payload);
    let init = init?;

    if state != ConnectionState::WaitRecvInitReq {
        bail!(ProtocolError::UnexpectedFrame(FrameType::InitReq, state.name()));
    }

    if init.version != PROTOCOL_VERSION {
        bail!(ProtocolError::VersionMismatch { expected: PROTOCOL_VERSION, actual: init.version });
    }

    *inner.remote_peer.write().unwrap() = Some(remote_peer_from_init(&init)?);

    let fields = InitFields::new(&inner.local_peer.host_port, &inner.local_peer.process_name);
    if let Err(e) = inner.sender.send_init(FrameType::InitRes, header.id, &fields) {
        bail!("could not send init response: {}", e);
    }

    {
        let mut state = inner.state.write().unwrap();
        if *state == ConnectionState::WaitRecvInitReq {
            *state = ConnectionState::Active;
        }
    }

    info!("connection from {:?} is active", inner.remote_peer.read().unwrap().as_ref().map(|p| p.to_string()));
    Ok(())
}

fn handle_call_req(
    inner: &Arc<ConnInner>,
    state: ConnectionState,
    header: FrameHeader,
    payload: FixedBuf,
) -> anyhow::Result<()> {
    if state != ConnectionState::Active {
        // draining: decline instead of processing
        debug!("declining call {} received in state {}", header.id, state.name());
        inner.pool.release(payload);
        let _ = inner.sender.send_error(ErrorCode::Declined, header.id, "connection is draining");
        return Ok(());
    }

    let mut checksum: Option<Checksum> = None;
    let (fragment, fields) = match InFragment::parse::<CallReqFields>(payload, &mut checksum) {
        Ok(parsed) => parsed,
        Err(CallError::Protocol(e)) => bail!(e),
        Err(e) => {
            warn!("could not decode call request {}: {}", header.id, e);
            let _ = inner.sender.send_error(e.wire_code(), header.id, &e.to_string());
            return Ok(());
        }
    };

    let (tx, rx) = mpsc::channel(inner.config.recv_buffer_size);
    {
        let mut inbound = inner.inbound.lock().unwrap();
        if inbound.contains_key(&header.id) {
            drop(inbound);
            let e = CallError::DuplicateRequest(header.id);
            warn!("{}", e);
            let _ = inner.sender.send_error(e.wire_code(), header.id, &e.to_string());
            return Ok(());
        }
        inbound.insert(header.id, tx);
    }

    spawn_inbound_dispatch(inner.clone(), header.id, fields, fragment, checksum, rx);
    Ok(())
}

fn handle_call_req_cont(inner: &Arc<ConnInner>, state: ConnectionState, header: FrameHeader, payload: FixedBuf) {
    if state == ConnectionState::InboundClosed {
        // no new fragments are accepted while waiting for outbound drain
        inner.pool.release(payload);
        return;
    }

    let tx = inner.inbound.lock().unwrap().get(&header.id).cloned();
    let Some(tx) = tx else {
        // the call may have timed out or been cancelled - not an error
        trace!("dropping continuation for unknown inbound id {}", header.id);
        inner.pool.release(payload);
        return;
    };

    match tx.try_send(Frame { header, payload }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            // the handler is not consuming fragments fast enough; abort the
            // call, never the connection
            warn!("inbound fragment queue for call {} overflowed", header.id);
            inner.pool.release(frame.payload);
            let _ = inner.sender.send_error(ErrorCode::Busy, header.id, "inbound fragment queue overflow");
            inner.inbound_call_complete(header.id);
        }
        Err(mpsc::error::TrySendError::Closed(frame)) => {
            trace!("dropping continuation for finished inbound id {}", header.id);
            inner.pool.release(frame.payload);
        }
    }
}

fn deliver_outbound(inner: &Arc<ConnInner>, id: u32, frame: Frame) {
    let tx = inner.outbound.lock().unwrap().get(&id).cloned();
    let Some(tx) = tx else {
        // the waiter may have timed out or been cancelled - not an error
        trace!("dropping {:?} for unknown outbound id {}", frame.header.frame_type, id);
        inner.pool.release(frame.payload);
        return;
    };

    match tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            warn!("response queue for outbound call {} overflowed, cancelling the call", id);
            inner.pool.release(frame.payload);
            inner.outbound_call_complete(id);
        }
        Err(mpsc::error::TrySendError::Closed(frame)) => {
            trace!("dropping {:?} for finished outbound id {}", frame.header.frame_type, id);
            inner.pool.release(frame.payload);
        }
    }
}

fn handle_error_frame(inner: &Arc<ConnInner>, header: FrameHeader, payload: FixedBuf) -> anyhow::Result<()> {
    let body = ErrorBody::deser(&mut payload.as_ref());
    match body {
        Err(e) => {
            inner.pool.release(payload);
            bail!(e);
        }
        Ok(body) if body.id == 0 => {
            inner.pool.release(payload);
            error!("peer reported a connection-fatal error: {:?}: {}", body.code, body.message);
            bail!("peer reported a connection-fatal error: {:?}: {}", body.code, body.message);
        }
        Ok(body) => {
            debug!("peer errored call {}: {:?}: {}", body.id, body.code, body.message);
            deliver_outbound(inner, body.id, Frame { header, payload });
            Ok(())
        }
    }
}

/// Single producer to the socket: drains the bounded frame queue, returning
///  payload buffers to the pool after each successful write.
async fn writer_loop(inner: Arc<ConnInner>, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.notified() => {
                // flush frames enqueued before shutdown (e.g. the final
                // error frame) as far as the socket allows
                while let Ok(frame) = rx.try_recv() {
                    if write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                    inner.pool.release(frame.payload);
                }
                trace!("writer loop shutting down");
                return;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        if let Err(e) = write_frame(&mut write_half, &frame).await {
            error!("error writing frame to socket: {}", e);
            inner.to_closed();
            return;
        }
        inner.pool.release(frame.payload);
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    {
        let mut cursor = &mut header_buf[..];
        frame.header.ser(&mut cursor);
    }
    write_half.write_all(&header_buf).await?;
    write_half.write_all(frame.payload.as_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerMap;
    use tokio::net::TcpListener;

    fn test_config() -> Arc<ChannelConfig> {
        Arc::new(ChannelConfig::new("test-process"))
    }

    async fn connected_pair(config: Arc<ChannelConfig>) -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::inbound(
                stream,
                server_config,
                Arc::new(HandlerMap::new()),
                PeerInfo { host_port: addr.to_string(), process_name: "server".to_string() },
            )
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = Connection::outbound(
            stream,
            config,
            Arc::new(HandlerMap::new()),
            PeerInfo { host_port: "client:0".to_string(), process_name: "client".to_string() },
        )
        .await
        .unwrap();

        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_exchanges_peer_info() {
        let (client, server) = connected_pair(test_config()).await;

        let remote = client.remote_peer().unwrap();
        assert_eq!(remote.process_name, "server");

        // the server learns the client's identity once its reader has
        // processed the InitReq
        tokio::time::sleep(Duration::from_millis(50)).await;
        let remote = server.remote_peer().unwrap();
        assert_eq!(remote.process_name, "client");
        assert_eq!(remote.host_port, "client:0");
    }

    #[tokio::test]
    async fn test_ping() {
        let (client, server) = connected_pair(test_config()).await;
        client.ping().await.unwrap();
        server.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_ids_are_distinct_and_skip_zero() {
        let (client, _server) = connected_pair(test_config()).await;
        let inner = client.inner().clone();

        // force the counter to the wrap-around region
        inner.next_id.store(u32::MAX - 2, Ordering::Relaxed);

        let (id1, _rx1) = inner.register_outbound();
        let (id2, _rx2) = inner.register_outbound();
        let (id3, _rx3) = inner.register_outbound();

        assert_eq!(id1, u32::MAX - 1);
        assert_eq!(id2, u32::MAX);
        // 0 is reserved and must be skipped on wrap
        assert_eq!(id3, 1);
    }

    #[tokio::test]
    async fn test_in_use_id_is_skipped_until_released() {
        let (client, _server) = connected_pair(test_config()).await;
        let inner = client.inner().clone();

        let (id1, _rx1) = inner.register_outbound();
        assert_eq!(id1, 1);

        // wrap the counter so the next candidate is the id still in use
        inner.next_id.store(u32::MAX, Ordering::Relaxed);
        let (id2, _rx2) = inner.register_outbound();
        assert_eq!(id2, 2, "id 1 is still registered and must be skipped");

        inner.outbound_call_complete(id1);
        inner.next_id.store(0, Ordering::Relaxed);
        let (id3, _rx3) = inner.register_outbound();
        assert_eq!(id3, 1, "released ids may be reused");
    }

    #[tokio::test]
    async fn test_graceful_close_without_calls() {
        let (client, _server) = connected_pair(test_config()).await;

        assert_eq!(client.inner().state(), ConnectionState::Active);
        client.close();
        assert!(client.is_closed());

        // new outbound calls are rejected
        let result = client.begin_call("svc", b"op", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CallError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_graceful_close_waits_for_outbound() {
        let (client, _server) = connected_pair(test_config()).await;
        let inner = client.inner().clone();

        let (id, _rx) = inner.register_outbound();
        client.close();

        // inbound side drains immediately, outbound still pending
        assert_eq!(inner.state(), ConnectionState::InboundClosed);

        inner.outbound_call_complete(id);
        assert_eq!(inner.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_draining_connection_declines_new_calls() {
        let (client, server) = connected_pair(test_config()).await;

        // hold the server open with a synthetic pending outbound call
        let server_inner = server.inner().clone();
        let (pending_id, _pending_rx) = server_inner.register_outbound();
        server.close();
        assert_eq!(server_inner.state(), ConnectionState::InboundClosed);

        let result = client.begin_call("svc", b"op", Duration::from_secs(1)).await;
        let mut call = result.expect("client side is still active");
        call.write_arg2(b"").await.unwrap();
        call.write_arg3(b"").await.unwrap();

        let mut response = call.into_response();
        let result = response.ok().await;
        match result {
            Err(CallError::Remote { code, .. }) => assert_eq!(code, ErrorCode::Declined),
            other => panic!("expected a declined call, got {:?}", other.map(|_| ())),
        }

        drop(response);
        server_inner.outbound_call_complete(pending_id);
        assert_eq!(server_inner.state(), ConnectionState::Closed);
    }
}
