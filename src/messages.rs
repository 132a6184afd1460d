//! Payload headers of the individual frame types, between the fragment flag
//!  byte and the checksum/chunk section. All numbers big-endian, strings
//!  length-prefixed utf-8.

use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtocolError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const PROTOCOL_VERSION: u16 = 0x02;

pub const INIT_HEADER_HOST_PORT: &str = "host_port";
pub const INIT_HEADER_PROCESS_NAME: &str = "process_name";

/// Wire codes carried by error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Timeout = 0x01,
    Cancelled = 0x02,
    Busy = 0x03,
    Declined = 0x04,
    UnexpectedError = 0x05,
    BadRequest = 0x06,
    NetworkError = 0x07,
    ProtocolError = 0xff,
}

/// Response code of a call response - `ApplicationError` is a well-formed
///  response, not a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    ApplicationError = 0x01,
}

pub(crate) fn put_str1(buf: &mut impl BufMut, s: &str) {
    buf.put_u8(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
}

pub(crate) fn try_get_str1(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    let len: usize = buf.try_get_u8().map_err(|_| ProtocolError::Truncated)?.into();
    try_get_string(buf, len)
}

pub(crate) fn put_str2(buf: &mut impl BufMut, s: &str) {
    buf.put_u16(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
}

pub(crate) fn try_get_str2(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    let len: usize = buf.try_get_u16().map_err(|_| ProtocolError::Truncated)?.safe_cast();
    try_get_string(buf, len)
}

fn try_get_string(buf: &mut impl Buf, len: usize) -> Result<String, ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidString)
}

/// Opaque 25-byte tracing block on call requests and responses. It is
///  carried and echoed, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tracing {
    pub span_id: u64,
    pub parent_id: u64,
    pub trace_id: u64,
    pub flags: u8,
}

impl Tracing {
    pub const SERIALIZED_LEN: usize = 25;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.span_id);
        buf.put_u64(self.parent_id);
        buf.put_u64(self.trace_id);
        buf.put_u8(self.flags);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Tracing, ProtocolError> {
        Ok(Tracing {
            span_id: buf.try_get_u64().map_err(|_| ProtocolError::Truncated)?,
            parent_id: buf.try_get_u64().map_err(|_| ProtocolError::Truncated)?,
            trace_id: buf.try_get_u64().map_err(|_| ProtocolError::Truncated)?,
            flags: buf.try_get_u8().map_err(|_| ProtocolError::Truncated)?,
        })
    }
}

fn put_headers_u8(buf: &mut impl BufMut, headers: &[(String, String)]) {
    buf.put_u8(headers.len().prechecked_cast());
    for (key, value) in headers {
        put_str1(buf, key);
        put_str1(buf, value);
    }
}

fn try_get_headers_u8(buf: &mut impl Buf) -> Result<Vec<(String, String)>, ProtocolError> {
    let count = buf.try_get_u8().map_err(|_| ProtocolError::Truncated)?;
    let mut headers = Vec::with_capacity(count.into());
    for _ in 0..count {
        headers.push((try_get_str1(buf)?, try_get_str1(buf)?));
    }
    Ok(headers)
}

/// Payload of InitReq / InitRes frames: protocol version plus a string
///  header map that must contain `host_port` and `process_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFields {
    pub version: u16,
    pub headers: Vec<(String, String)>,
}

impl InitFields {
    pub fn new(host_port: &str, process_name: &str) -> InitFields {
        InitFields {
            version: PROTOCOL_VERSION,
            headers: vec![
                (INIT_HEADER_HOST_PORT.to_string(), host_port.to_string()),
                (INIT_HEADER_PROCESS_NAME.to_string(), process_name.to_string()),
            ],
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.version);
        buf.put_u16(self.headers.len().prechecked_cast());
        for (key, value) in &self.headers {
            put_str2(buf, key);
            put_str2(buf, value);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<InitFields, ProtocolError> {
        let version = buf.try_get_u16().map_err(|_| ProtocolError::Truncated)?;
        let count = buf.try_get_u16().map_err(|_| ProtocolError::Truncated)?;
        let mut headers = Vec::with_capacity(count.safe_cast());
        for _ in 0..count {
            headers.push((try_get_str2(buf)?, try_get_str2(buf)?));
        }
        Ok(InitFields { version, headers })
    }
}

/// Per-message header of the first fragment of a call request, following the
///  fragment flag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReqFields {
    pub ttl_ms: u32,
    pub tracing: Tracing,
    pub service: String,
    pub headers: Vec<(String, String)>,
}

/// Per-message header of the first fragment of a call response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResFields {
    pub code: ResponseCode,
    pub tracing: Tracing,
    pub headers: Vec<(String, String)>,
}

/// Continuation fragments carry no per-message header of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContFields;

/// The message-type specific header between a call fragment's flag byte and
///  its checksum section.
pub(crate) trait CallFields: Sized {
    fn ser(&self, buf: &mut impl BufMut);
    fn deser(buf: &mut impl Buf) -> Result<Self, ProtocolError>;
}

impl CallFields for CallReqFields {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ttl_ms);
        self.tracing.ser(buf);
        put_str1(buf, &self.service);
        put_headers_u8(buf, &self.headers);
    }

    fn deser(buf: &mut impl Buf) -> Result<CallReqFields, ProtocolError> {
        Ok(CallReqFields {
            ttl_ms: buf.try_get_u32().map_err(|_| ProtocolError::Truncated)?,
            tracing: Tracing::deser(buf)?,
            service: try_get_str1(buf)?,
            headers: try_get_headers_u8(buf)?,
        })
    }
}

impl CallFields for CallResFields {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.code.into());
        self.tracing.ser(buf);
        put_headers_u8(buf, &self.headers);
    }

    fn deser(buf: &mut impl Buf) -> Result<CallResFields, ProtocolError> {
        let raw_code = buf.try_get_u8().map_err(|_| ProtocolError::Truncated)?;
        Ok(CallResFields {
            code: ResponseCode::try_from(raw_code)
                .map_err(|_| ProtocolError::UnknownResponseCode(raw_code))?,
            tracing: Tracing::deser(buf)?,
            headers: try_get_headers_u8(buf)?,
        })
    }
}

impl CallFields for ContFields {
    fn ser(&self, _buf: &mut impl BufMut) {}

    fn deser(_buf: &mut impl Buf) -> Result<ContFields, ProtocolError> {
        Ok(ContFields)
    }
}

/// Payload of an error frame. `id` names the message being errored; id 0
///  declares the error fatal to the whole connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub id: u32,
    pub message: String,
}

impl ErrorBody {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.code.into());
        buf.put_u32(self.id);
        put_str2(buf, &self.message);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ErrorBody, ProtocolError> {
        let raw_code = buf.try_get_u8().map_err(|_| ProtocolError::Truncated)?;
        Ok(ErrorBody {
            code: ErrorCode::try_from(raw_code)
                .map_err(|_| ProtocolError::UnknownErrorCode(raw_code))?,
            id: buf.try_get_u32().map_err(|_| ProtocolError::Truncated)?,
            message: try_get_str2(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::simple("op", vec![2, b'o', b'p'])]
    fn test_str1(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        put_str1(&mut buf, s);
        assert_eq!(buf, expected);
        assert_eq!(try_get_str1(&mut buf.as_slice()).unwrap(), s);
    }

    #[rstest]
    #[case::empty("", vec![0, 0])]
    #[case::unicode("\u{2603}", vec![0, 3, 0xe2, 0x98, 0x83])]
    fn test_str2(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        put_str2(&mut buf, s);
        assert_eq!(buf, expected);
        assert_eq!(try_get_str2(&mut buf.as_slice()).unwrap(), s);
    }

    #[rstest]
    #[case::truncated_len(vec![])]
    #[case::truncated_body(vec![3, b'a'])]
    fn test_str1_truncated(#[case] bytes: Vec<u8>) {
        assert_eq!(try_get_str1(&mut bytes.as_slice()), Err(ProtocolError::Truncated));
    }

    #[test]
    fn test_str1_invalid_utf8() {
        let bytes = vec![2u8, 0xff, 0xfe];
        assert_eq!(try_get_str1(&mut bytes.as_slice()), Err(ProtocolError::InvalidString));
    }

    #[test]
    fn test_tracing_roundtrip() {
        let tracing = Tracing { span_id: 1, parent_id: 2, trace_id: 3, flags: 9 };

        let mut buf = Vec::new();
        tracing.ser(&mut buf);
        assert_eq!(buf.len(), Tracing::SERIALIZED_LEN);
        assert_eq!(buf, vec![
            0,0,0,0,0,0,0,1,
            0,0,0,0,0,0,0,2,
            0,0,0,0,0,0,0,3,
            9,
        ]);

        assert_eq!(Tracing::deser(&mut buf.as_slice()).unwrap(), tracing);
    }

    #[test]
    fn test_init_fields() {
        let fields = InitFields::new("1.2.3.4:80", "worker");
        assert_eq!(fields.version, PROTOCOL_VERSION);
        assert_eq!(fields.header(INIT_HEADER_HOST_PORT), Some("1.2.3.4:80"));
        assert_eq!(fields.header(INIT_HEADER_PROCESS_NAME), Some("worker"));
        assert_eq!(fields.header("nope"), None);

        let mut buf = Vec::new();
        fields.ser(&mut buf);

        let mut expected = vec![0u8, 2, 0, 2];
        expected.extend_from_slice(&[0, 9]);
        expected.extend_from_slice(b"host_port");
        expected.extend_from_slice(&[0, 10]);
        expected.extend_from_slice(b"1.2.3.4:80");
        expected.extend_from_slice(&[0, 12]);
        expected.extend_from_slice(b"process_name");
        expected.extend_from_slice(&[0, 6]);
        expected.extend_from_slice(b"worker");
        assert_eq!(buf, expected);

        assert_eq!(InitFields::deser(&mut buf.as_slice()).unwrap(), fields);
    }

    #[test]
    fn test_call_req_fields_roundtrip() {
        let fields = CallReqFields {
            ttl_ms: 1500,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: vec![("as".to_string(), "raw".to_string())],
        };

        let mut buf = Vec::new();
        fields.ser(&mut buf);

        let mut expected = vec![0u8, 0, 0x05, 0xdc];
        expected.extend_from_slice(&[0; 25]);
        expected.extend_from_slice(&[3]);
        expected.extend_from_slice(b"svc");
        expected.extend_from_slice(&[1, 2]);
        expected.extend_from_slice(b"as");
        expected.extend_from_slice(&[3]);
        expected.extend_from_slice(b"raw");
        assert_eq!(buf, expected);

        assert_eq!(CallReqFields::deser(&mut buf.as_slice()).unwrap(), fields);
    }

    #[rstest]
    #[case::ok(ResponseCode::Ok, 0x00)]
    #[case::app_error(ResponseCode::ApplicationError, 0x01)]
    fn test_call_res_fields_roundtrip(#[case] code: ResponseCode, #[case] raw: u8) {
        let fields = CallResFields {
            code,
            tracing: Tracing::default(),
            headers: vec![],
        };

        let mut buf = Vec::new();
        fields.ser(&mut buf);
        assert_eq!(buf[0], raw);
        assert_eq!(buf.len(), 1 + 25 + 1);

        assert_eq!(CallResFields::deser(&mut buf.as_slice()).unwrap(), fields);
    }

    #[test]
    fn test_call_res_unknown_code() {
        let mut buf = vec![9u8];
        buf.extend_from_slice(&[0; 26]);
        assert_eq!(
            CallResFields::deser(&mut buf.as_slice()),
            Err(ProtocolError::UnknownResponseCode(9)),
        );
    }

    #[rstest]
    #[case::busy(ErrorBody { code: ErrorCode::Busy, id: 7, message: "slow down".to_string() },
        {
            let mut v = vec![0x03u8, 0, 0, 0, 7, 0, 9];
            v.extend_from_slice(b"slow down");
            v
        })]
    #[case::fatal(ErrorBody { code: ErrorCode::ProtocolError, id: 0, message: String::new() },
        vec![0xff, 0, 0, 0, 0, 0, 0])]
    fn test_error_body(#[case] body: ErrorBody, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        body.ser(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(ErrorBody::deser(&mut buf.as_slice()).unwrap(), body);
    }

    #[test]
    fn test_error_body_unknown_code() {
        let bytes = vec![0x20u8, 0, 0, 0, 1, 0, 0];
        assert_eq!(
            ErrorBody::deser(&mut bytes.as_slice()),
            Err(ProtocolError::UnknownErrorCode(0x20)),
        );
    }
}
