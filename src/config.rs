use std::time::Duration;
use anyhow::bail;

use crate::checksum::ChecksumKind;
use crate::frame::MAX_BODY_LEN;

/// Settings shared by a channel and all of its connections.
pub struct ChannelConfig {
    /// The logical process name reported to peers during the handshake,
    ///  used for logging and debugging only.
    pub process_name: String,

    /// The checksum type stamped on outgoing call requests. Responses
    ///  always mirror the type of the incoming request.
    pub checksum_kind: ChecksumKind,

    /// Depth of the per-connection outbound frame queue. A producer that
    ///  finds the queue full observes send-buffer backpressure rather than
    ///  blocking the connection.
    pub send_buffer_size: usize,

    /// Depth of each per-call fragment queue. A peer that outruns the
    ///  application by more than this many fragments gets the call aborted
    ///  with a busy error.
    pub recv_buffer_size: usize,

    /// Number of frame buffers retained in the pool per connection -
    ///  buffers in excess of this are discarded when returned.
    pub frame_pool_size: usize,

    /// Upper bound for an outgoing fragment's payload. Smaller values force
    ///  more fragmentation; the wire maximum is the header's u16 size field.
    pub max_fragment_len: usize,

    /// How long to wait for the peer's init response (and for pings).
    pub handshake_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(process_name: &str) -> ChannelConfig {
        ChannelConfig {
            process_name: process_name.to_string(),
            checksum_kind: ChecksumKind::Crc32,
            send_buffer_size: 512,
            recv_buffer_size: 512,
            frame_pool_size: 128,
            max_fragment_len: MAX_BODY_LEN,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_fragment_len > MAX_BODY_LEN {
            bail!("max_fragment_len {} exceeds the wire limit of {}", self.max_fragment_len, MAX_BODY_LEN);
        }
        if self.max_fragment_len < 128 {
            bail!("max_fragment_len {} leaves no room for call headers", self.max_fragment_len);
        }
        if self.send_buffer_size == 0 || self.recv_buffer_size == 0 {
            bail!("buffer sizes must be at least 1");
        }
        Ok(())
    }
}
