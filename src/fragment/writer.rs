use std::cmp::min;

use async_trait::async_trait;
use bytes::BufMut;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::checksum::{Checksum, ChecksumKind};
use crate::connection::FrameSender;
use crate::error::{CallError, ProtocolError};
use crate::fixed_buffer::FixedBuf;
use crate::fragment::FLAG_MORE_FRAGMENTS;
use crate::frame::FrameType;
use crate::messages::{CallFields, CallReqFields, CallResFields};
use crate::safe_converter::PrecheckedCast;

/// A call fragment under construction: flag byte and message header are
///  already written, chunks are appended behind them, and the flag, chunk
///  lengths and checksum are patched in before the fragment is flushed.
pub(crate) struct OutFragment {
    frame_type: FrameType,
    buf: FixedBuf,
    limit: usize,
    checksum_pos: usize,
    checksum_len: usize,
    chunk_start: Option<usize>,
}

impl OutFragment {
    pub(crate) fn new(
        frame_type: FrameType,
        mut buf: FixedBuf,
        limit: usize,
        checksum_kind: ChecksumKind,
        first_frame: Option<&FirstFrame>,
    ) -> Result<OutFragment, CallError> {
        debug_assert!(buf.is_empty());
        let limit = min(limit, buf.capacity());

        buf.put_u8(0); // fragment flags, patched on finish
        if let Some(first_frame) = first_frame {
            match first_frame {
                FirstFrame::CallReq(fields) => fields.ser(&mut buf),
                FirstFrame::CallRes(fields) => fields.ser(&mut buf),
            }
        }
        buf.put_u8(checksum_kind.into());
        let checksum_pos = buf.len();
        let checksum_len = checksum_kind.value_len();
        buf.put_bytes(0, checksum_len);

        // there must be room for at least one chunk behind the headers
        if buf.len() + 3 > limit {
            return Err(CallError::Protocol(ProtocolError::BodyTooLarge(buf.len())));
        }

        Ok(OutFragment {
            frame_type,
            buf,
            limit,
            checksum_pos,
            checksum_len,
            chunk_start: None,
        })
    }

    fn bytes_remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    fn chunk_open(&self) -> bool {
        self.chunk_start.is_some()
    }

    fn can_fit_new_chunk(&self) -> bool {
        self.bytes_remaining() > 2
    }

    fn begin_chunk(&mut self) {
        assert!(!self.chunk_open(), "beginning a chunk with one already open");
        self.chunk_start = Some(self.buf.len());
        self.buf.put_u16(0); // chunk length, patched on end_chunk
    }

    /// Appends data to the open chunk and feeds it into the rolling checksum.
    ///  The data must fit into the fragment.
    fn write_chunk_data(&mut self, bytes: &[u8], checksum: &mut Checksum) {
        assert!(self.chunk_open(), "writing chunk data with no open chunk");
        assert!(bytes.len() <= self.bytes_remaining(), "data exceeds remaining fragment size");
        self.buf.put_slice(bytes);
        checksum.update(bytes);
    }

    fn end_chunk(&mut self) {
        let start = self.chunk_start.take().expect("ending a chunk with none open");
        let data_len = self.buf.len() - start - 2;
        self.buf.patch_u16_at(start, data_len.prechecked_cast());
    }

    /// Closes any open chunk, stamps the fragment flag and the rolling
    ///  checksum, and hands the finished payload back for sending.
    fn finish(mut self, last: bool, checksum: &Checksum) -> (FrameType, FixedBuf) {
        if self.chunk_open() {
            self.end_chunk();
        }

        self.buf.patch_u8_at(0, if last { 0 } else { FLAG_MORE_FRAGMENTS });

        let mut value = [0u8; 4];
        checksum.write_value(&mut value[..self.checksum_len]);
        self.buf.patch_slice_at(self.checksum_pos, &value[..self.checksum_len]);

        (self.frame_type, self.buf)
    }
}

/// The message header written into the first fragment of a message.
pub(crate) enum FirstFrame {
    CallReq(CallReqFields),
    CallRes(CallResFields),
}

/// Where finished fragments go. Implemented by the per-call sink that wraps
///  the connection's send queue; mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait FragmentSink: Send {
    /// Opens a fresh fragment. The first call produces the message's first
    ///  frame (CallReq / CallRes header), every later call a continuation.
    fn begin_fragment(&mut self) -> Result<OutFragment, CallError>;

    /// Enqueues a finished fragment for the writer loop.
    async fn flush_fragment(&mut self, frame_type: FrameType, payload: FixedBuf) -> Result<(), CallError>;
}

/// Production sink: builds fragments from pooled buffers and enqueues them
///  on the connection's bounded writer queue under one message id.
pub(crate) struct CallFragmentSink {
    sender: FrameSender,
    id: u32,
    first: Option<FirstFrame>,
    cont_type: FrameType,
    checksum_kind: ChecksumKind,
    max_fragment_len: usize,
}

impl CallFragmentSink {
    pub(crate) fn new(
        sender: FrameSender,
        id: u32,
        first: FirstFrame,
        checksum_kind: ChecksumKind,
        max_fragment_len: usize,
    ) -> CallFragmentSink {
        let cont_type = match &first {
            FirstFrame::CallReq(_) => FrameType::CallReqCont,
            FirstFrame::CallRes(_) => FrameType::CallResCont,
        };
        CallFragmentSink {
            sender,
            id,
            first: Some(first),
            cont_type,
            checksum_kind,
            max_fragment_len,
        }
    }
}

#[async_trait]
impl FragmentSink for CallFragmentSink {
    fn begin_fragment(&mut self) -> Result<OutFragment, CallError> {
        let buf = self.sender.pool().get();
        let first = self.first.take();
        let frame_type = match &first {
            Some(FirstFrame::CallReq(_)) => FrameType::CallReq,
            Some(FirstFrame::CallRes(_)) => FrameType::CallRes,
            None => self.cont_type,
        };
        OutFragment::new(frame_type, buf, self.max_fragment_len, self.checksum_kind, first.as_ref())
    }

    async fn flush_fragment(&mut self, frame_type: FrameType, payload: FixedBuf) -> Result<(), CallError> {
        trace!("flushing {:?} fragment of {} bytes for message {}", frame_type, payload.len(), self.id);
        self.sender.send(self.id, frame_type, payload)
    }
}

/// Splits the three sequential argument byte streams of one message into
///  chunked fragments. All fragments of a message are produced by the single
///  task driving this writer, which is what keeps them ordered on the wire.
pub(crate) struct ArgWriter<S: FragmentSink> {
    sink: S,
    checksum: Checksum,
    fragment: Option<OutFragment>,
    aligns_at_end: bool,
    complete: bool,
    args_ended: u8,
}

impl<S: FragmentSink> ArgWriter<S> {
    pub(crate) fn new(sink: S, checksum_kind: ChecksumKind) -> ArgWriter<S> {
        ArgWriter {
            sink,
            checksum: Checksum::new(checksum_kind),
            fragment: None,
            aligns_at_end: false,
            complete: false,
            args_ended: 0,
        }
    }

    /// Writes bytes of the current argument, splitting across fragments as
    ///  capacity runs out.
    pub(crate) async fn write(&mut self, mut bytes: &[u8]) -> Result<(), CallError> {
        if self.complete {
            return Err(CallError::WriteAfterComplete);
        }

        while !bytes.is_empty() {
            self.ensure_open_chunk().await?;
            let fragment = self.fragment.as_mut().expect("ensure_open_chunk leaves a fragment in place");

            let remaining = fragment.bytes_remaining();
            if remaining < bytes.len() {
                // not enough room - fill this fragment and continue the
                // argument in a fresh one
                fragment.write_chunk_data(&bytes[..remaining], &mut self.checksum);
                self.finish_fragment(false).await?;
                bytes = &bytes[remaining..];
            }
            else {
                fragment.write_chunk_data(bytes, &mut self.checksum);
                self.aligns_at_end = fragment.bytes_remaining() == 0;
                bytes = &[];
            }
        }

        let fragment_full = self.fragment.as_ref().is_some_and(|f| f.bytes_remaining() == 0);
        if fragment_full {
            self.finish_fragment(false).await?;
        }

        Ok(())
    }

    /// Ends the current argument. After the third argument this flushes the
    ///  terminal fragment and completes the message.
    pub(crate) async fn end_arg(&mut self) -> Result<(), CallError> {
        if self.complete {
            return Err(CallError::WriteAfterComplete);
        }

        let last = self.args_ended == 2;

        if self.aligns_at_end {
            // the argument ended exactly at a fragment boundary - emit a
            // fragment with an empty chunk so the reader can tell this
            // argument is complete
            debug_assert!(self.fragment.is_none());
            let mut fragment = self.sink.begin_fragment()?;
            fragment.begin_chunk();
            self.fragment = Some(fragment);
            self.aligns_at_end = false;
        }
        else {
            // an argument owns at least one chunk, even an empty one
            self.ensure_open_chunk().await?;
        }

        self.fragment.as_mut().expect("fragment in place after ensure/begin").end_chunk();

        if last {
            self.finish_fragment(true).await?;
            self.complete = true;
        }
        self.args_ended += 1;
        Ok(())
    }

    /// Writes a whole argument and ends it.
    pub(crate) async fn write_arg(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        self.write(bytes).await?;
        self.end_arg().await
    }

    async fn ensure_open_chunk(&mut self) -> Result<(), CallError> {
        loop {
            if self.fragment.is_none() {
                self.fragment = Some(self.sink.begin_fragment()?);
            }
            let fragment = self.fragment.as_mut().unwrap();

            if fragment.chunk_open() {
                return Ok(());
            }
            if fragment.can_fit_new_chunk() {
                fragment.begin_chunk();
                return Ok(());
            }

            // no room for another chunk - flush and retry with a fresh fragment
            self.finish_fragment(false).await?;
        }
    }

    async fn finish_fragment(&mut self, last: bool) -> Result<(), CallError> {
        let fragment = self.fragment.take().expect("finishing with no open fragment");
        let (frame_type, payload) = fragment.finish(last, &self.checksum);
        self.sink.flush_fragment(frame_type, payload).await
    }
}
