//! Network-byte-order framing for opcodes, integers and length-prefixed fields.
//!
//! Every request starts with a 2-byte opcode. Feature payloads are made of
//! length-prefixed fields:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! A declared length larger than the receiving capacity is rejected before any
//! payload byte is read. Responses are an opcode tag, a status code and an
//! optional body field:
//!
//! ```text
//! +-----------+-----------+---------------------------+
//! | opcode    | status    | body field (optional)     |
//! | u16 BE    | u16 BE    | u32 BE length + bytes     |
//! +-----------+-----------+---------------------------+
//! ```

use std::io::{self, Read, Write};

/// Largest single packet the server buffers for one field.
pub const MAX_PACKET_BUF_SZ: usize = 8192;

const DRAIN_CHUNK: usize = 1024;

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared payload size exceeds the receiving capacity.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared payload size.
        size: u32,
        /// The receiving capacity.
        max: u32,
    },

    /// The connection was closed before a complete field was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the error is a read or write timeout rather than a broken stream.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::ConnectionClosed
        } else {
            FrameError::Io(e)
        }
    })
}

/// Read the 2-byte opcode that starts every request.
///
/// Returns `Ok(None)` when the peer closed the connection before sending the
/// first byte.
pub fn read_opcode<R: Read>(reader: &mut R) -> Result<Option<u16>, FrameError> {
    let mut buf = [0u8; 2];
    let n = loop {
        match reader.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::Io(e)),
        }
    };
    match n {
        0 => Ok(None),
        1 => {
            read_exact(reader, &mut buf[1..])?;
            Ok(Some(u16::from_be_bytes(buf)))
        }
        _ => Ok(Some(u16::from_be_bytes(buf))),
    }
}

/// Progress of a non-blocking opcode read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeRead {
    /// Both opcode bytes are in.
    Complete(u16),
    /// The socket ran dry first. A lone first byte is kept in `pending`.
    Incomplete,
    /// The peer closed the connection.
    Closed,
}

/// Read an opcode from a non-blocking stream, resuming from a byte left in
/// `pending` by an earlier call.
///
/// Never waits: if only the first byte has arrived it is stored in `pending`
/// and [`OpcodeRead::Incomplete`] is returned, so the next readiness event can
/// finish the opcode without losing it.
pub fn resume_opcode<R: Read>(
    reader: &mut R,
    pending: &mut Option<u8>,
) -> Result<OpcodeRead, FrameError> {
    let mut buf = [0u8; 2];
    let mut filled = 0;
    if let Some(first) = pending.take() {
        buf[0] = first;
        filled = 1;
    }

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(OpcodeRead::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if filled == 1 {
                    *pending = Some(buf[0]);
                }
                return Ok(OpcodeRead::Incomplete);
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(OpcodeRead::Complete(u16::from_be_bytes(buf)))
}

/// Read a network-order `u16`.
pub fn read_u16<R: Read>(reader: &mut R) -> Result<u16, FrameError> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Read a network-order `u32`.
pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32, FrameError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_payload<R: Read>(reader: &mut R, len: u32, capacity: usize) -> Result<Vec<u8>, FrameError> {
    if len as usize > capacity {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: u32::try_from(capacity).unwrap_or(u32::MAX),
        });
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        read_exact(reader, &mut payload)?;
    }
    Ok(payload)
}

/// Read a field with a 4-byte length prefix.
///
/// Fails with [`FrameError::PayloadTooLarge`] without consuming the payload if
/// the declared length exceeds `capacity`.
pub fn read_field<R: Read>(reader: &mut R, capacity: usize) -> Result<Vec<u8>, FrameError> {
    let len = read_u32(reader)?;
    read_payload(reader, len, capacity)
}

/// Read a field with a 2-byte length prefix.
pub fn read_short_field<R: Read>(reader: &mut R, capacity: usize) -> Result<Vec<u8>, FrameError> {
    let len = read_u16(reader)?;
    read_payload(reader, u32::from(len), capacity)
}

fn encode_field(buf: &mut Vec<u8>, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Write a field with a 4-byte length prefix.
pub fn write_field<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    encode_field(&mut buf, payload)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Write a response: opcode tag, status code and an optional body field.
pub fn write_response<W: Write>(
    writer: &mut W,
    opcode: u16,
    status: u16,
    body: Option<&[u8]>,
) -> Result<(), FrameError> {
    let body_len = body.map_or(0, |b| 4 + b.len());
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(&status.to_be_bytes());
    if let Some(body) = body {
        encode_field(&mut buf, body)?;
    }
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read and discard everything currently pending on a non-blocking reader.
///
/// Stops at `WouldBlock`, a timeout or end of stream. Returns the number of
/// bytes discarded.
pub fn drain<R: Read>(reader: &mut R) -> io::Result<usize> {
    let mut trash = [0u8; DRAIN_CHUNK];
    let mut total = 0;
    loop {
        match reader.read(&mut trash) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(total);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields its data one byte per `read` call, then `WouldBlock`.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn test_field_roundtrip() {
        let mut wire = Vec::new();
        write_field(&mut wire, b"hello").unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let received = read_field(&mut Cursor::new(wire), MAX_PACKET_BUF_SZ).unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn test_opcode_is_big_endian() {
        let mut reader = Cursor::new(vec![0x03, 0xE7]);
        assert_eq!(read_opcode(&mut reader).unwrap(), Some(999));
    }

    #[test]
    fn test_opcode_on_closed_stream() {
        let mut reader = Cursor::new(Vec::new());
        assert_eq!(read_opcode(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_opcode_split_across_reads() {
        let mut reader = Trickle {
            data: vec![0x00, 0x07],
            pos: 0,
        };
        assert_eq!(read_opcode(&mut reader).unwrap(), Some(7));
    }

    #[test]
    fn test_opcode_resumes_after_lone_first_byte() {
        let mut pending = None;
        let mut first = Trickle {
            data: vec![0x00],
            pos: 0,
        };
        assert_eq!(
            resume_opcode(&mut first, &mut pending).unwrap(),
            OpcodeRead::Incomplete
        );
        assert_eq!(pending, Some(0x00));

        let mut rest = Trickle {
            data: vec![0x07, 0x00],
            pos: 0,
        };
        assert_eq!(
            resume_opcode(&mut rest, &mut pending).unwrap(),
            OpcodeRead::Complete(7)
        );
        assert_eq!(pending, None);
        // The byte after the opcode is left for the handler.
        assert_eq!(rest.pos, 1);
    }

    #[test]
    fn test_resume_opcode_on_idle_and_closed_streams() {
        let mut pending = None;
        let mut idle = Trickle {
            data: Vec::new(),
            pos: 0,
        };
        assert_eq!(
            resume_opcode(&mut idle, &mut pending).unwrap(),
            OpcodeRead::Incomplete
        );
        assert_eq!(pending, None);

        let mut pending = Some(0x03);
        let mut closed = Cursor::new(Vec::new());
        assert_eq!(
            resume_opcode(&mut closed, &mut pending).unwrap(),
            OpcodeRead::Closed
        );
    }

    #[test]
    fn test_oversized_field_rejected_before_payload() {
        let mut wire = 1024u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[0xAA; 1024]);
        let mut reader = Cursor::new(wire);

        let result = read_field(&mut reader, 16);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })
        ));
        // Only the length prefix was consumed.
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn test_short_field_uses_two_byte_length() {
        let mut reader = Cursor::new(vec![0x00, 0x03, b'a', b'b', b'c', b'z']);
        assert_eq!(read_short_field(&mut reader, 8).unwrap(), b"abc");
        assert_eq!(reader.position(), 5);
    }

    #[test]
    fn test_truncated_field_reports_closed() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let result = read_field(&mut Cursor::new(wire), 64);
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[test]
    fn test_zero_length_field() {
        let mut wire = Vec::new();
        write_field(&mut wire, &[]).unwrap();
        let received = read_field(&mut Cursor::new(wire), 0).unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn test_response_layout() {
        let mut wire = Vec::new();
        write_response(&mut wire, 7, 0, Some(b"hi")).unwrap();
        assert_eq!(wire, vec![0, 7, 0, 0, 0, 0, 0, 2, b'h', b'i']);

        let mut bare = Vec::new();
        write_response(&mut bare, 1, 2507, None).unwrap();
        assert_eq!(bare, vec![0, 1, 0x09, 0xCB]);
    }

    #[test]
    fn test_drain_stops_at_would_block() {
        let mut reader = Trickle {
            data: vec![1, 2, 3, 4, 5],
            pos: 0,
        };
        assert_eq!(drain(&mut reader).unwrap(), 5);
        assert_eq!(drain(&mut reader).unwrap(), 0);
    }

    #[test]
    fn test_timeout_detection() {
        let err = FrameError::Io(io::ErrorKind::WouldBlock.into());
        assert!(err.is_timeout());
        assert!(!FrameError::ConnectionClosed.is_timeout());
    }
}
