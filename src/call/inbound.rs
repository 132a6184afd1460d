use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::checksum::{Checksum, ChecksumKind};
use crate::connection::{ConnInner, PeerInfo};
use crate::error::CallError;
use crate::fragment::reader::{FragmentStream, InFragment};
use crate::fragment::writer::{ArgWriter, CallFragmentSink, FirstFrame};
use crate::frame::Frame;
use crate::messages::{CallReqFields, CallResFields, ErrorCode, ResponseCode, Tracing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundCallState {
    PreRead,
    ReadyToReadArg2,
    ReadyToReadArg3,
    AllRead,
    Errored,
}

impl InboundCallState {
    fn name(&self) -> &'static str {
        match self {
            InboundCallState::PreRead => "PreRead",
            InboundCallState::ReadyToReadArg2 => "ReadyToReadArg2",
            InboundCallState::ReadyToReadArg3 => "ReadyToReadArg3",
            InboundCallState::AllRead => "AllRead",
            InboundCallState::Errored => "Errored",
        }
    }
}

/// An incoming call from a peer. The dispatcher reads arg1 (the operation)
///  to resolve the handler; the handler reads arg2 and arg3 and answers
///  through `response()`.
pub struct InboundCall {
    conn: Arc<ConnInner>,
    id: u32,
    service: String,
    headers: Vec<(String, String)>,
    operation: Vec<u8>,
    stream: FragmentStream,
    state: InboundCallState,
    response: InboundResponse,
}

impl InboundCall {
    pub(crate) fn new(
        conn: Arc<ConnInner>,
        id: u32,
        fields: CallReqFields,
        first: InFragment,
        checksum: Option<Checksum>,
        rx: mpsc::Receiver<Frame>,
        deadline: Instant,
    ) -> InboundCall {
        // the response mirrors the checksum kind the request arrived with
        let checksum_kind = checksum.as_ref().map(|c| c.kind()).unwrap_or(ChecksumKind::None);
        let stream = FragmentStream::new(rx, conn.pool().clone(), deadline, first, checksum);
        let response = InboundResponse::new(conn.clone(), id, checksum_kind, fields.tracing);

        InboundCall {
            conn,
            id,
            service: fields.service,
            headers: fields.headers,
            operation: Vec::new(),
            stream,
            state: InboundCallState::PreRead,
            response,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The operation being called (arg1), available once the dispatcher has
    ///  read it.
    pub fn operation(&self) -> &[u8] {
        &self.operation
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The peer this call came from.
    pub fn remote_peer(&self) -> Option<PeerInfo> {
        self.conn.remote_peer_info()
    }

    pub fn response(&mut self) -> &mut InboundResponse {
        &mut self.response
    }

    /// Reads all of arg1. Called by the dispatcher before handler lookup.
    pub(crate) async fn read_operation(&mut self) -> Result<(), CallError> {
        if self.state != InboundCallState::PreRead {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }

        let operation = match self.stream.read_arg().await {
            Ok(operation) => operation,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.stream.end_arg(false).await {
            return Err(self.fail(e));
        }

        trace!("call {} requests operation {:?}", self.id, String::from_utf8_lossy(&operation));
        self.operation = operation;
        self.state = InboundCallState::ReadyToReadArg2;
        Ok(())
    }

    /// Reads all of arg2.
    pub async fn read_arg2(&mut self) -> Result<Vec<u8>, CallError> {
        if self.state != InboundCallState::ReadyToReadArg2 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        let arg = match self.stream.read_arg().await {
            Ok(arg) => arg,
            Err(e) => return Err(self.fail(e)),
        };
        self.end_arg().await?;
        Ok(arg)
    }

    /// Reads all of arg3.
    pub async fn read_arg3(&mut self) -> Result<Vec<u8>, CallError> {
        if self.state != InboundCallState::ReadyToReadArg3 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        let arg = match self.stream.read_arg().await {
            Ok(arg) => arg,
            Err(e) => return Err(self.fail(e)),
        };
        self.end_arg().await?;
        Ok(arg)
    }

    /// Streaming read: the next piece of the current argument, `None` once
    ///  the argument is exhausted. Use `end_arg` to move to the next one.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, CallError> {
        match self.state {
            InboundCallState::ReadyToReadArg2 | InboundCallState::ReadyToReadArg3 => {}
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        }
        match self.stream.read_chunk().await {
            Ok(piece) => Ok(piece),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Ends the argument currently being read.
    pub async fn end_arg(&mut self) -> Result<(), CallError> {
        let (last, next) = match self.state {
            InboundCallState::ReadyToReadArg2 => (false, InboundCallState::ReadyToReadArg3),
            InboundCallState::ReadyToReadArg3 => (true, InboundCallState::AllRead),
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        };

        if let Err(e) = self.stream.end_arg(last).await {
            return Err(self.fail(e));
        }
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, error: CallError) -> CallError {
        debug!("inbound call {} failed: {}", self.id, error);
        self.state = InboundCallState::Errored;
        if let CallError::Protocol(protocol_error) = &error {
            self.conn.protocol_fault(protocol_error);
        }
        error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    ReadyToWriteArg2,
    ReadyToWriteArg3,
    Complete,
    Errored,
}

impl ResponseState {
    fn name(&self) -> &'static str {
        match self {
            ResponseState::ReadyToWriteArg2 => "ReadyToWriteArg2",
            ResponseState::ReadyToWriteArg3 => "ReadyToWriteArg3",
            ResponseState::Complete => "Complete",
            ResponseState::Errored => "Errored",
        }
    }
}

/// The write side of an inbound call, sending the response back to the
///  calling peer.
pub struct InboundResponse {
    conn: Arc<ConnInner>,
    id: u32,
    checksum_kind: ChecksumKind,
    tracing: Tracing,
    state: ResponseState,
    application_error: bool,
    writer: Option<ArgWriter<CallFragmentSink>>,
    completed: Arc<AtomicBool>,
}

impl InboundResponse {
    fn new(conn: Arc<ConnInner>, id: u32, checksum_kind: ChecksumKind, tracing: Tracing) -> InboundResponse {
        InboundResponse {
            conn,
            id,
            checksum_kind,
            tracing,
            state: ResponseState::ReadyToWriteArg2,
            application_error: false,
            writer: None,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set when the dispatcher needs to know whether the handler produced a
    ///  terminal response (normal completion or a system error frame).
    pub(crate) fn completion_flag(&self) -> Arc<AtomicBool> {
        self.completed.clone()
    }

    /// Marks the response as an application-level error. Legal only before
    ///  any response bytes have been written; the response code of the first
    ///  fragment carries the flag.
    pub fn set_application_error(&mut self) -> Result<(), CallError> {
        if self.state != ResponseState::ReadyToWriteArg2 || self.writer.is_some() {
            return Err(CallError::StateMismatch(self.state.name()));
        }
        self.application_error = true;
        Ok(())
    }

    /// Writes all of arg2 of the response.
    pub async fn write_arg2(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        if self.state != ResponseState::ReadyToWriteArg2 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        self.write(bytes).await?;
        self.end_arg().await
    }

    /// Writes all of arg3 and completes the response.
    pub async fn write_arg3(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        if self.state != ResponseState::ReadyToWriteArg3 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        self.write(bytes).await?;
        self.end_arg().await
    }

    /// Streaming write into the current argument.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        match self.state {
            ResponseState::ReadyToWriteArg2 | ResponseState::ReadyToWriteArg3 => {}
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        }
        if let Err(e) = self.started_writer().await {
            return Err(self.fail(e));
        }
        if let Err(e) = self.writer.as_mut().expect("writer started above").write(bytes).await {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Ends the argument currently being written; ending arg3 flushes the
    ///  terminal fragment.
    pub async fn end_arg(&mut self) -> Result<(), CallError> {
        let next = match self.state {
            ResponseState::ReadyToWriteArg2 => ResponseState::ReadyToWriteArg3,
            ResponseState::ReadyToWriteArg3 => ResponseState::Complete,
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        };

        if let Err(e) = self.started_writer().await {
            return Err(self.fail(e));
        }
        if let Err(e) = self.writer.as_mut().expect("writer started above").end_arg().await {
            return Err(self.fail(e));
        }

        self.state = next;
        if next == ResponseState::Complete {
            debug!("response for call {} complete", self.id);
            self.completed.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Short-circuits the response with an error frame: no (further)
    ///  response fragments are sent and the inbound side is cancelled.
    pub async fn send_system_error(&mut self, code: ErrorCode, message: &str) -> Result<(), CallError> {
        match self.state {
            ResponseState::Complete | ResponseState::Errored => {
                return Err(CallError::StateMismatch(self.state.name()));
            }
            _ => {}
        }

        debug!("call {} answers with system error {:?}: {}", self.id, code, message);
        self.conn.sender().send_error(code, self.id, message)?;
        self.state = ResponseState::Complete;
        self.completed.store(true, Ordering::Relaxed);

        // stop feeding fragments to the request side of this call
        self.conn.inbound_call_complete(self.id);
        Ok(())
    }

    /// The first response fragment carries the response code, so the writer
    ///  is only built once the application-error flag is settled. Responses
    ///  carry an empty arg1.
    async fn started_writer(&mut self) -> Result<(), CallError> {
        if self.writer.is_some() {
            return Ok(());
        }

        let fields = CallResFields {
            code: if self.application_error { ResponseCode::ApplicationError } else { ResponseCode::Ok },
            tracing: self.tracing,
            headers: Vec::new(),
        };
        let sink = CallFragmentSink::new(
            self.conn.sender().clone(),
            self.id,
            FirstFrame::CallRes(fields),
            self.checksum_kind,
            self.conn.config().max_fragment_len,
        );
        let mut writer = ArgWriter::new(sink, self.checksum_kind);
        writer.end_arg().await?;

        self.writer = Some(writer);
        Ok(())
    }

    fn fail(&mut self, error: CallError) -> CallError {
        debug!("response for call {} failed: {}", self.id, error);
        self.state = ResponseState::Errored;
        if let CallError::Protocol(protocol_error) = &error {
            self.conn.protocol_fault(protocol_error);
        }
        error
    }
}
