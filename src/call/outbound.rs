use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::checksum::Checksum;
use crate::connection::ConnInner;
use crate::error::{CallError, ProtocolError};
use crate::fragment::reader::{FragmentStream, InFragment};
use crate::fragment::writer::{ArgWriter, CallFragmentSink, FirstFrame};
use crate::frame::{Frame, FrameType};
use crate::messages::{CallReqFields, CallResFields, ErrorBody, ResponseCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundWriteState {
    ReadyToWriteArg1,
    ReadyToWriteArg2,
    ReadyToWriteArg3,
    Sent,
    Errored,
}

impl OutboundWriteState {
    fn name(&self) -> &'static str {
        match self {
            OutboundWriteState::ReadyToWriteArg1 => "ReadyToWriteArg1",
            OutboundWriteState::ReadyToWriteArg2 => "ReadyToWriteArg2",
            OutboundWriteState::ReadyToWriteArg3 => "ReadyToWriteArg3",
            OutboundWriteState::Sent => "Sent",
            OutboundWriteState::Errored => "Errored",
        }
    }
}

/// An outgoing call. The connection writes the operation (arg1) when the
///  call begins; the caller writes arg2 and arg3 and then turns the call
///  into its response.
pub struct OutboundCall {
    conn: Arc<ConnInner>,
    id: u32,
    writer: ArgWriter<CallFragmentSink>,
    state: OutboundWriteState,
    response: Option<OutboundResponse>,
}

impl OutboundCall {
    pub(crate) fn new(
        conn: Arc<ConnInner>,
        id: u32,
        rx: mpsc::Receiver<Frame>,
        fields: CallReqFields,
        deadline: Instant,
    ) -> OutboundCall {
        let checksum_kind = conn.config().checksum_kind;
        let sink = CallFragmentSink::new(
            conn.sender().clone(),
            id,
            FirstFrame::CallReq(fields),
            checksum_kind,
            conn.config().max_fragment_len,
        );
        let response = OutboundResponse::new(conn.clone(), id, rx, deadline);

        OutboundCall {
            conn,
            id,
            writer: ArgWriter::new(sink, checksum_kind),
            state: OutboundWriteState::ReadyToWriteArg1,
            response: Some(response),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Writes the operation name as arg1.
    pub(crate) async fn write_operation(&mut self, operation: &[u8]) -> Result<(), CallError> {
        if self.state != OutboundWriteState::ReadyToWriteArg1 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        if let Err(e) = self.writer.write_arg(operation).await {
            return Err(self.fail(e));
        }
        self.state = OutboundWriteState::ReadyToWriteArg2;
        Ok(())
    }

    /// Writes all of arg2.
    pub async fn write_arg2(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        if self.state != OutboundWriteState::ReadyToWriteArg2 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        self.write(bytes).await?;
        self.end_arg().await
    }

    /// Writes all of arg3, sending the terminal request fragment.
    pub async fn write_arg3(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        if self.state != OutboundWriteState::ReadyToWriteArg3 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        self.write(bytes).await?;
        self.end_arg().await
    }

    /// Streaming write into the current argument.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        match self.state {
            OutboundWriteState::ReadyToWriteArg2 | OutboundWriteState::ReadyToWriteArg3 => {}
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        }
        if let Err(e) = self.writer.write(bytes).await {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Ends the argument currently being written.
    pub async fn end_arg(&mut self) -> Result<(), CallError> {
        let next = match self.state {
            OutboundWriteState::ReadyToWriteArg2 => OutboundWriteState::ReadyToWriteArg3,
            OutboundWriteState::ReadyToWriteArg3 => OutboundWriteState::Sent,
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        };
        if let Err(e) = self.writer.end_arg().await {
            return Err(self.fail(e));
        }
        self.state = next;
        if next == OutboundWriteState::Sent {
            trace!("request for call {} fully sent", self.id);
        }
        Ok(())
    }

    /// Hands over the response side of the call. Dropping it releases the
    ///  message id.
    pub fn into_response(mut self) -> OutboundResponse {
        self.response.take().expect("response is only handed over once")
    }

    fn fail(&mut self, error: CallError) -> CallError {
        debug!("outbound call {} failed: {}", self.id, error);
        self.state = OutboundWriteState::Errored;
        if let CallError::Protocol(protocol_error) = &error {
            self.conn.protocol_fault(protocol_error);
        }
        error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundReadState {
    ReadyToReadArg2,
    ReadyToReadArg3,
    AllRead,
    Errored,
}

impl OutboundReadState {
    fn name(&self) -> &'static str {
        match self {
            OutboundReadState::ReadyToReadArg2 => "ReadyToReadArg2",
            OutboundReadState::ReadyToReadArg3 => "ReadyToReadArg3",
            OutboundReadState::AllRead => "AllRead",
            OutboundReadState::Errored => "Errored",
        }
    }
}

/// The response to an outbound call. `ok()` reflects the response code; a
///  response with `ok() == false` still carries regular arg2/arg3.
pub struct OutboundResponse {
    conn: Arc<ConnInner>,
    id: u32,
    deadline: Instant,
    rx: Option<mpsc::Receiver<Frame>>,
    stream: Option<FragmentStream>,
    ok: bool,
    headers: Vec<(String, String)>,
    state: OutboundReadState,
}

impl OutboundResponse {
    fn new(conn: Arc<ConnInner>, id: u32, rx: mpsc::Receiver<Frame>, deadline: Instant) -> OutboundResponse {
        OutboundResponse {
            conn,
            id,
            deadline,
            rx: Some(rx),
            stream: None,
            ok: false,
            headers: Vec::new(),
            state: OutboundReadState::ReadyToReadArg2,
        }
    }

    /// Waits for the response to begin and returns whether the peer answered
    ///  without an application error.
    pub async fn ok(&mut self) -> Result<bool, CallError> {
        self.ensure_response_started().await?;
        Ok(self.ok)
    }

    /// Response headers, available once the response has begun.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Reads all of the response's arg2.
    pub async fn read_arg2(&mut self) -> Result<Vec<u8>, CallError> {
        if self.state != OutboundReadState::ReadyToReadArg2 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        self.ensure_response_started().await?;
        let arg = match self.stream.as_mut().expect("stream started above").read_arg().await {
            Ok(arg) => arg,
            Err(e) => return Err(self.fail(e)),
        };
        self.end_arg().await?;
        Ok(arg)
    }

    /// Reads all of the response's arg3, completing the call.
    pub async fn read_arg3(&mut self) -> Result<Vec<u8>, CallError> {
        if self.state != OutboundReadState::ReadyToReadArg3 {
            return Err(self.fail(CallError::StateMismatch(self.state.name())));
        }
        let arg = match self.stream.as_mut().expect("arg2 was read before arg3").read_arg().await {
            Ok(arg) => arg,
            Err(e) => return Err(self.fail(e)),
        };
        self.end_arg().await?;
        Ok(arg)
    }

    /// Streaming read of the current response argument.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, CallError> {
        match self.state {
            OutboundReadState::ReadyToReadArg2 | OutboundReadState::ReadyToReadArg3 => {}
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        }
        self.ensure_response_started().await?;
        match self.stream.as_mut().expect("stream started above").read_chunk().await {
            Ok(piece) => Ok(piece),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Ends the response argument currently being read.
    pub async fn end_arg(&mut self) -> Result<(), CallError> {
        let (last, next) = match self.state {
            OutboundReadState::ReadyToReadArg2 => (false, OutboundReadState::ReadyToReadArg3),
            OutboundReadState::ReadyToReadArg3 => (true, OutboundReadState::AllRead),
            other => return Err(self.fail(CallError::StateMismatch(other.name()))),
        };
        self.ensure_response_started().await?;
        if let Err(e) = self.stream.as_mut().expect("stream started above").end_arg(last).await {
            return Err(self.fail(e));
        }

        self.state = next;
        if next == OutboundReadState::AllRead {
            debug!("outbound call {} complete", self.id);
            self.conn.outbound_call_complete(self.id);
        }
        Ok(())
    }

    /// Waits for the first response frame: an error frame fails the call, a
    ///  CallRes opens the fragment stream. Responses carry an empty arg1,
    ///  which is consumed here.
    async fn ensure_response_started(&mut self) -> Result<(), CallError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(CallError::StateMismatch(self.state.name())),
        };

        let frame = match timeout_at(self.deadline, rx.recv()).await {
            Err(_) => return Err(self.fail(CallError::TimedOut)),
            Ok(None) => return Err(self.fail(CallError::Cancelled)),
            Ok(Some(frame)) => frame,
        };

        match frame.header.frame_type {
            FrameType::Error => {
                let body = ErrorBody::deser(&mut frame.payload.as_ref());
                self.conn.pool().release(frame.payload);
                match body {
                    Ok(body) => Err(self.fail(CallError::Remote { code: body.code, message: body.message })),
                    Err(e) => Err(self.fail(CallError::Protocol(e))),
                }
            }
            FrameType::CallRes => {
                let mut checksum: Option<Checksum> = None;
                let (fragment, fields) = match InFragment::parse::<CallResFields>(frame.payload, &mut checksum) {
                    Ok(parsed) => parsed,
                    Err(e) => return Err(self.fail(e)),
                };

                self.ok = fields.code == ResponseCode::Ok;
                self.headers = fields.headers;

                let mut stream = FragmentStream::new(rx, self.conn.pool().clone(), self.deadline, fragment, checksum);
                let arg1 = match stream.read_arg().await {
                    Ok(arg1) => arg1,
                    Err(e) => return Err(self.fail(e)),
                };
                if !arg1.is_empty() {
                    trace!("response for call {} carries {} unexpected arg1 bytes", self.id, arg1.len());
                }
                if let Err(e) = stream.end_arg(false).await {
                    return Err(self.fail(e));
                }

                self.stream = Some(stream);
                Ok(())
            }
            other => Err(self.fail(CallError::Protocol(ProtocolError::UnexpectedFrame(other, "AwaitingResponse")))),
        }
    }

    fn fail(&mut self, error: CallError) -> CallError {
        debug!("response for outbound call {} failed: {}", self.id, error);
        self.state = OutboundReadState::Errored;
        if let CallError::Protocol(protocol_error) = &error {
            self.conn.protocol_fault(protocol_error);
        }
        self.conn.outbound_call_complete(self.id);
        error
    }
}

impl Drop for OutboundResponse {
    fn drop(&mut self) {
        // releasing the id is idempotent; this covers abandoned calls
        self.conn.outbound_call_complete(self.id);
    }
}
