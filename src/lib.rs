//! A bidirectional, connection-oriented RPC transport that multiplexes many
//!  in-flight calls over a single TCP connection. Peers are symmetric: every
//!  endpoint both initiates and accepts calls, and responses complete out of
//!  order.
//!
//! ## Design goals
//!
//! * One TCP connection per peer pair carries any number of concurrent
//!   calls in both directions, each identified by a per-connection message id
//! * Large payloads stream through fixed-size fragments instead of being
//!   buffered whole; per-fragment checksums catch corruption early
//! * A call is three ordered byte streams (arg1 = operation name, arg2,
//!   arg3), written and read with explicit end-of-argument boundaries
//! * Backpressure everywhere: the socket writer queue and every per-call
//!   fragment queue are bounded, and saturation surfaces to the producer
//!   (send-buffer-full) or aborts only the slow call (busy), never the
//!   connection
//! * Frame buffers are pooled and reused; steady-state operation does not
//!   allocate per frame
//!
//! ## Wire format
//!
//! Frame header - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  payload size (u16)
//! 2:  frame type (u8):
//!       0x01 init request        0x02 init response
//!       0x03 call request        0x04 call response
//!       0x13 call req continue   0x14 call res continue
//!       0xd0 ping request        0xd1 ping response
//!       0xff error
//! 3:  reserved (u8)
//! 4:  message id (u32) - scoped to the connection; 0 is reserved for
//!      connection-fatal errors
//! 8:  reserved (u64)
//! ```
//!
//! Init request / response payload:
//!
//! ```ascii
//! 0:  protocol version (u16) - currently 0x02
//! 2:  number of headers (u16)
//! *:  (repeated) key (len:u16 + utf-8), value (len:u16 + utf-8)
//!      required headers: host_port, process_name
//! ```
//!
//! Call request payload (first fragment of a request):
//!
//! ```ascii
//! 0:  flags (u8) - bit 0: more fragments follow
//! 1:  time to live (u32, ms)
//! 5:  tracing (25 bytes, opaque)
//! 30: service (len:u8 + utf-8)
//! *:  number of headers (u8), then (key:str1, value:str1) pairs
//! *:  checksum type (u8): 0x00 none, 0x01 crc-32, 0x02 farmhash32
//! *:  checksum value (0 or 4 bytes)
//! *:  chunks until the end of the fragment: length (u16) + bytes
//! ```
//!
//! A call response replaces ttl/service with a response code (u8, 0x00 ok /
//!  0x01 application error); continuation fragments carry only flags,
//!  checksum and chunks. An error frame carries a code (u8), the id being
//!  errored (u32) and a message (str2).
//!
//! ## Fragmentation
//!
//! The three argument streams of a message are chunked across its fragments
//!  in strict order. Within a fragment, the first chunk continues the
//!  argument left open by the previous fragment, and each further chunk
//!  advances to the next argument. A zero-length chunk marks an argument
//!  boundary that falls exactly on a fragment boundary. The checksum of each
//!  fragment is the rolling digest over all chunk bytes of the message so
//!  far, so corruption in any fragment is detected at that fragment.
//!
//! ## Connection lifecycle
//!
//! ```ascii
//! accepted:  WaitRecvInitReq --InitReq/InitRes--> Active
//! dialed:    WaitSendInitReq --send InitReq--> WaitRecvInitRes
//!                            --valid InitRes--> Active
//! Active    --local close--> StartClose (new inbound calls are declined)
//! StartClose    --no live inbound calls-->  InboundClosed
//! InboundClosed --no live outbound calls--> Closed
//! any       --protocol violation or I/O error--> Closed
//! ```
//!
//! Each connection runs exactly two I/O workers: a reader that is the only
//!  consumer of the socket and dispatches frames without blocking on
//!  application work, and a writer that is the only producer to the socket,
//!  fed by the bounded frame queue. Every in-flight call runs as its own
//!  task and owns a bounded fragment channel fed by the reader.

pub mod call;
pub mod channel;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod fixed_buffer;
pub mod frame;
pub mod frame_pool;
mod fragment;
pub mod handler;
pub mod messages;
pub mod safe_converter;
