use std::collections::VecDeque;
use std::sync::Arc;

use bytes_varint::try_get_fixed::TryGetFixedSupport;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::checksum::{Checksum, ChecksumKind};
use crate::error::{CallError, ProtocolError};
use crate::fixed_buffer::FixedBuf;
use crate::fragment::FLAG_MORE_FRAGMENTS;
use crate::frame::{Frame, FrameType};
use crate::frame_pool::FramePool;
use crate::messages::{CallFields, ErrorBody};
use crate::safe_converter::SafeCast;

/// One received call fragment: parsed flags and chunk boundaries over the
///  pooled payload buffer, with the rolling checksum already verified.
pub(crate) struct InFragment {
    pub(crate) last: bool,
    payload: FixedBuf,
    chunks: VecDeque<(usize, usize)>,
}

impl InFragment {
    /// Parses a call fragment: flag byte, the message-type specific header,
    ///  checksum declaration, then chunks until the payload is exhausted.
    ///
    /// `checksum` is the rolling digest for this message id; the first
    ///  fragment creates it from the declared kind, every later fragment
    ///  must declare the same kind. The digest is advanced over this
    ///  fragment's chunk bytes and compared to the declared value.
    pub(crate) fn parse<F: CallFields>(
        payload: FixedBuf,
        checksum: &mut Option<Checksum>,
    ) -> Result<(InFragment, F), CallError> {
        let total = payload.len();
        let mut rest: &[u8] = payload.as_ref();

        let flags = rest.try_get_u8().map_err(|_| ProtocolError::Truncated)?;
        let fields = F::deser(&mut rest)?;

        let raw_kind = rest.try_get_u8().map_err(|_| ProtocolError::Truncated)?;
        let kind = ChecksumKind::deser(raw_kind)?;
        match checksum {
            Some(existing) if existing.kind() != kind => {
                return Err(CallError::MismatchedChecksumTypes);
            }
            Some(_) => {}
            None => *checksum = Some(Checksum::new(kind)),
        }
        let checksum = checksum.as_mut().expect("rolling checksum initialized above");

        let claimed_len = kind.value_len();
        if rest.len() < claimed_len {
            return Err(CallError::Protocol(ProtocolError::Truncated));
        }
        let claimed = rest[..claimed_len].to_vec();
        rest = &rest[claimed_len..];

        let mut chunks = VecDeque::new();
        while !rest.is_empty() {
            let chunk_len: usize = rest.try_get_u16().map_err(|_| ProtocolError::Truncated)?.safe_cast();
            if rest.len() < chunk_len {
                // chunk overruns the fragment
                return Err(CallError::Protocol(ProtocolError::Truncated));
            }
            chunks.push_back((total - rest.len(), chunk_len));
            checksum.update(&rest[..chunk_len]);
            rest = &rest[chunk_len..];
        }

        if !checksum.matches(&claimed) {
            return Err(CallError::ChecksumMismatch);
        }

        Ok((
            InFragment {
                last: flags & FLAG_MORE_FRAGMENTS == 0,
                payload,
                chunks,
            },
            fields,
        ))
    }

    fn next_chunk(&mut self) -> Option<&[u8]> {
        let (offset, len) = self.chunks.pop_front()?;
        Some(&self.payload.as_ref()[offset..offset + len])
    }

    fn has_more_chunks(&self) -> bool {
        !self.chunks.is_empty()
    }
}

/// The receiving end of one message id: pulls continuation frames off the
///  per-call channel, verifies them, and reassembles the three argument
///  streams in order.
///
/// Chunk-to-argument assignment: the first chunk taken from a fragment
///  continues whatever argument was active, every further chunk in the same
///  fragment advances to the next argument. A zero-length chunk advances
///  without contributing bytes.
pub(crate) struct FragmentStream {
    rx: mpsc::Receiver<Frame>,
    pool: Arc<FramePool>,
    deadline: Instant,
    checksum: Option<Checksum>,
    cur: Option<InFragment>,
    seen_last: bool,

    // cursor of the argument currently being read
    chunk: Vec<u8>,
    chunk_pos: usize,
    arg_ended: bool,
    arg_has_chunk: bool,
}

impl FragmentStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Frame>,
        pool: Arc<FramePool>,
        deadline: Instant,
        first: InFragment,
        checksum: Option<Checksum>,
    ) -> FragmentStream {
        let seen_last = first.last;
        FragmentStream {
            rx,
            pool,
            deadline,
            checksum,
            cur: Some(first),
            seen_last,
            chunk: Vec::new(),
            chunk_pos: 0,
            arg_ended: false,
            arg_has_chunk: false,
        }
    }

    /// Reads the next piece of the current argument. `Ok(None)` means the
    ///  argument is complete.
    pub(crate) async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, CallError> {
        loop {
            if self.chunk_pos < self.chunk.len() {
                let piece = self.chunk[self.chunk_pos..].to_vec();
                self.chunk_pos = self.chunk.len();
                return Ok(Some(piece));
            }
            if self.arg_ended {
                return Ok(None);
            }

            if !self.wait_for_fragment().await? {
                // the message is exhausted; an argument that never got a
                // chunk means the sender finished before three arguments
                if !self.arg_has_chunk {
                    return Err(CallError::IncompleteMessage);
                }
                return Ok(None);
            }

            let cur = self.cur.as_mut().expect("wait_for_fragment leaves a fragment with chunks");
            let chunk = cur.next_chunk().expect("fragment guaranteed to have a chunk").to_vec();
            self.arg_ended = cur.has_more_chunks();
            self.arg_has_chunk = true;
            self.chunk = chunk;
            self.chunk_pos = 0;
        }
    }

    /// Reads the current argument to its end.
    pub(crate) async fn read_arg(&mut self) -> Result<Vec<u8>, CallError> {
        let mut out = Vec::new();
        while let Some(piece) = self.read_chunk().await? {
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    /// Ends the current argument and prepares for the next one.
    ///
    /// If the argument's last chunk ended exactly at a fragment boundary,
    ///  the sender emitted a fragment starting with an empty chunk as the
    ///  boundary marker; it is consumed here (unless reading already did).
    pub(crate) async fn end_arg(&mut self, last_arg: bool) -> Result<(), CallError> {
        if self.chunk_pos < self.chunk.len() {
            return Err(CallError::DataLeftover);
        }

        if !self.arg_ended && !last_arg {
            if !self.wait_for_fragment().await? {
                return Err(CallError::IncompleteMessage);
            }
            let cur = self.cur.as_mut().expect("wait_for_fragment leaves a fragment with chunks");
            let boundary = cur.next_chunk().expect("fragment guaranteed to have a chunk");
            if !boundary.is_empty() {
                return Err(CallError::DataLeftover);
            }
        }

        if last_arg {
            // nothing may follow the third argument
            if let Some(cur) = &self.cur {
                if cur.has_more_chunks() {
                    return Err(CallError::Protocol(ProtocolError::TooManyArgs));
                }
            }
        }

        self.chunk = Vec::new();
        self.chunk_pos = 0;
        self.arg_ended = false;
        self.arg_has_chunk = false;
        Ok(())
    }

    /// Ensures `cur` holds a fragment with at least one unconsumed chunk.
    ///  Returns false when the terminal fragment is fully consumed.
    async fn wait_for_fragment(&mut self) -> Result<bool, CallError> {
        loop {
            match self.cur.as_ref().map(|cur| cur.has_more_chunks()) {
                Some(true) => return Ok(true),
                Some(false) => {
                    let exhausted = self.cur.take().expect("checked above");
                    self.pool.release(exhausted.payload);
                    if self.seen_last {
                        return Ok(false);
                    }
                }
                None => {
                    if self.seen_last {
                        return Ok(false);
                    }
                }
            }

            let frame = match timeout_at(self.deadline, self.rx.recv()).await {
                Err(_) => return Err(CallError::TimedOut),
                Ok(None) => return Err(CallError::Cancelled),
                Ok(Some(frame)) => frame,
            };

            trace!("received {:?} fragment for message {}", frame.header.frame_type, frame.header.id);

            if frame.header.frame_type == FrameType::Error {
                let body = ErrorBody::deser(&mut frame.payload.as_ref())?;
                self.pool.release(frame.payload);
                return Err(CallError::Remote { code: body.code, message: body.message });
            }

            let (fragment, _) = InFragment::parse::<crate::messages::ContFields>(
                frame.payload,
                &mut self.checksum,
            )?;
            if fragment.last {
                self.seen_last = true;
            }
            self.cur = Some(fragment);
        }
    }
}
