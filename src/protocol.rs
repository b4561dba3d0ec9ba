//! Request/reply framing on the data channel
//!
//! Two frames cross a channel before it starts forwarding: the initiator
//! sends a connect request naming `host:port`, the responder answers with a
//! reply carrying a result code and the bound address of its outbound
//! socket. Both frames are a fixed 5-byte prefix followed by a variable
//! host, with multi-byte fields in network order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};

/// Protocol version of the request frame
pub const REQUEST_VERSION: u8 = 0;
/// The only supported command
pub const COMMAND_CONNECT: u8 = 1;
/// Bytes before the variable host in either frame
const PREFIX_LEN: usize = 5;
/// Host length is carried in one byte
pub const MAX_HOST_LEN: usize = 255;

/// Connect request, sent exactly once by the initiator on data-channel open.
///
/// ```text
/// u8  version   = 0
/// u8  command   = 1 (CONNECT)
/// u16 port      (network order)
/// u8  len       (1..=255)
/// u8[len] host
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Encode the request frame.
    pub fn encode(&self) -> Result<Bytes> {
        if self.host.is_empty() {
            return Err(Error::InvalidFrame("empty host".into()));
        }
        if self.host.len() > MAX_HOST_LEN {
            return Err(Error::InvalidFrame(format!(
                "host too long: {} bytes",
                self.host.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + self.host.len());
        buf.put_u8(REQUEST_VERSION);
        buf.put_u8(COMMAND_CONNECT);
        buf.put_u16(self.port);
        buf.put_u8(self.host.len() as u8);
        buf.put_slice(self.host.as_bytes());
        Ok(buf.freeze())
    }

    /// Incremental decode: `Ok(None)` while the buffer is still short of a
    /// complete frame, `Ok(Some(_))` once one has been consumed from the
    /// front of `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ConnectRequest>> {
        if buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = buf[4] as usize;
        if len == 0 {
            return Err(Error::InvalidFrame("zero-length host".into()));
        }
        if buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        let version = buf.get_u8();
        if version != REQUEST_VERSION {
            return Err(Error::InvalidFrame(format!(
                "unsupported version: {}",
                version
            )));
        }
        let command = buf.get_u8();
        if command != COMMAND_CONNECT {
            return Err(Error::InvalidFrame(format!(
                "unsupported command: {}",
                command
            )));
        }
        let port = buf.get_u16();
        let _ = buf.get_u8();
        let host_bytes = buf.split_to(len);
        let host = String::from_utf8(host_bytes.to_vec())
            .map_err(|_| Error::InvalidFrame("host is not valid ASCII".into()))?;
        Ok(Some(ConnectRequest { host, port }))
    }
}

/// Connect reply, sent exactly once by the responder.
///
/// ```text
/// u8  rep       (0 = success, else an ErrorKind wire code)
/// u8  reserved  = 0
/// u16 port      (responder's bound port, network order)
/// u8  len
/// u8[len] host  (responder's bound address; empty on failure)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub kind: ErrorKind,
    pub host: String,
    pub port: u16,
}

impl ConnectReply {
    pub fn success(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ErrorKind::Success,
            host: host.into(),
            port,
        }
    }

    pub fn failure(kind: ErrorKind) -> Self {
        Self {
            kind,
            host: String::new(),
            port: 0,
        }
    }

    /// Encode the reply frame.
    pub fn encode(&self) -> Result<Bytes> {
        if self.host.len() > MAX_HOST_LEN {
            return Err(Error::InvalidFrame(format!(
                "bound host too long: {} bytes",
                self.host.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + self.host.len());
        buf.put_u8(self.kind.code());
        buf.put_u8(0);
        buf.put_u16(self.port);
        buf.put_u8(self.host.len() as u8);
        buf.put_slice(self.host.as_bytes());
        Ok(buf.freeze())
    }

    /// Incremental decode, same contract as [`ConnectRequest::decode`]. A
    /// zero-length host is valid here (failure replies carry none).
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ConnectReply>> {
        if buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = buf[4] as usize;
        if buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        let rep = buf.get_u8();
        let _reserved = buf.get_u8();
        let port = buf.get_u16();
        let _ = buf.get_u8();
        let host_bytes = buf.split_to(len);
        let host = String::from_utf8(host_bytes.to_vec())
            .map_err(|_| Error::InvalidFrame("bound host is not valid ASCII".into()))?;
        Ok(Some(ConnectReply {
            kind: ErrorKind::from_code(rep),
            host,
            port,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_and_decodes() {
        let req = ConnectRequest::new("example.org", 80);
        let encoded = req.encode().unwrap();
        assert_eq!(encoded[0], REQUEST_VERSION);
        assert_eq!(encoded[1], COMMAND_CONNECT);
        assert_eq!(&encoded[2..4], &80u16.to_be_bytes());
        assert_eq!(encoded[4] as usize, "example.org".len());

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = ConnectRequest::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn request_decode_waits_for_complete_frame() {
        let encoded = ConnectRequest::new("example.org", 443).encode().unwrap();

        // Feed the frame one byte short, then the rest
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(ConnectRequest::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 1);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        let decoded = ConnectRequest::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.host, "example.org");
        assert_eq!(decoded.port, 443);
    }

    #[test]
    fn request_rejects_zero_length_host() {
        let mut buf = BytesMut::from(&[0u8, 1, 0, 80, 0][..]);
        assert!(ConnectRequest::decode(&mut buf).is_err());
    }

    #[test]
    fn request_rejects_bad_version_and_command() {
        let mut buf = BytesMut::from(&[9u8, 1, 0, 80, 1, b'a'][..]);
        assert!(ConnectRequest::decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0u8, 2, 0, 80, 1, b'a'][..]);
        assert!(ConnectRequest::decode(&mut buf).is_err());
    }

    #[test]
    fn request_rejects_overlong_host_on_encode() {
        let req = ConnectRequest::new("x".repeat(256), 80);
        assert!(req.encode().is_err());
    }

    #[test]
    fn reply_round_trips_with_trailing_data() {
        let reply = ConnectReply::success("203.0.113.7", 54321);
        let encoded = reply.encode().unwrap();

        // Forwarded application bytes may sit right behind the reply
        let mut buf = BytesMut::from(&encoded[..]);
        buf.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
        let decoded = ConnectReply::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(&buf[..], b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn failure_reply_has_no_host() {
        let reply = ConnectReply::failure(ErrorKind::ConnectionRefused);
        let encoded = reply.encode().unwrap();
        assert_eq!(encoded.len(), 5);
        assert_eq!(encoded[0], 5);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = ConnectReply::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, ErrorKind::ConnectionRefused);
        assert!(decoded.host.is_empty());
        assert_eq!(decoded.port, 0);
    }
}
