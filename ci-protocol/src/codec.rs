//! Framing codecs for the link, transport, session and application layers.
//!
//! Every layer uses the same tag + length prefix:
//! ```text
//! +--------+----------------+------------------+
//! |  Tag   |     Length     |     Payload      |
//! | 1..3 B | 1..3 B (ASN.1) |  Length bytes    |
//! +--------+----------------+------------------+
//! ```
//!
//! Link frames (LPDU) are the exception: they carry a connection id and a
//! more/last byte in front of a TPDU fragment.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// LPDU header: connection id + more/last byte.
pub const LPDU_HEADER_SIZE: usize = 2;

/// `more_last` byte value announcing further fragments.
pub const LPDU_MORE: u8 = 0x80;
/// `more_last` byte value of the final fragment.
pub const LPDU_LAST: u8 = 0x00;

// ---------------------------------------------------------------------------
// Length field
// ---------------------------------------------------------------------------

/// Write an ASN.1 length field.
pub fn encode_length(buf: &mut BytesMut, len: usize) -> Result<(), ProtocolError> {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len <= 0xFF {
        buf.put_u8(0x81);
        buf.put_u8(len as u8);
    } else if len <= MAX_ENCODED_LENGTH {
        buf.put_u8(0x82);
        buf.put_u16(len as u16);
    } else {
        return Err(ProtocolError::LengthTooLarge(len, MAX_ENCODED_LENGTH));
    }
    Ok(())
}

/// Read an ASN.1 length field.
///
/// Returns the decoded length and the number of bytes the field occupied.
pub fn decode_length(buf: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let first = *buf.first().ok_or(ProtocolError::Incomplete {
        expected: 1,
        actual: 0,
    })?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > 4 {
        return Err(ProtocolError::InvalidLengthField(first));
    }
    if buf.len() < 1 + count {
        return Err(ProtocolError::Incomplete {
            expected: 1 + count,
            actual: buf.len(),
        });
    }

    let len = buf[1..1 + count]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((len, 1 + count))
}

/// Split `data` after a length field, checking the announced length is present.
fn split_length_prefixed(data: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    let (len, consumed) = decode_length(data)?;
    let rest = &data[consumed..];
    if rest.len() < len {
        return Err(ProtocolError::Incomplete {
            expected: len,
            actual: rest.len(),
        });
    }
    Ok(rest.split_at(len))
}

// ---------------------------------------------------------------------------
// Link layer
// ---------------------------------------------------------------------------

/// Split a TPDU into link-layer fragments that fit `buffer_size`.
pub fn fragment_lpdu(tcid: u8, tpdu: &[u8], buffer_size: usize) -> Vec<Bytes> {
    let chunk = buffer_size.max(MIN_LINK_BUFFER_SIZE) - LPDU_HEADER_SIZE;
    let mut frames = Vec::with_capacity(tpdu.len() / chunk + 1);

    let mut pieces = tpdu.chunks(chunk).peekable();
    if pieces.peek().is_none() {
        frames.push(Bytes::from(vec![tcid, LPDU_LAST]));
        return frames;
    }
    while let Some(piece) = pieces.next() {
        let mut frame = BytesMut::with_capacity(LPDU_HEADER_SIZE + piece.len());
        frame.put_u8(tcid);
        frame.put_u8(if pieces.peek().is_some() {
            LPDU_MORE
        } else {
            LPDU_LAST
        });
        frame.put_slice(piece);
        frames.push(frame.freeze());
    }
    frames
}

/// Reassembles link-layer fragments per connection id.
#[derive(Debug, Default)]
pub struct LinkReassembler {
    partial: HashMap<u8, BytesMut>,
    /// Upper bound for one reassembled TPDU.
    limit: usize,
}

impl LinkReassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            partial: HashMap::new(),
            limit,
        }
    }

    /// Feed one LPDU. Returns the complete TPDU once the last fragment arrives.
    pub fn push(&mut self, lpdu: &[u8]) -> Result<Option<(u8, Bytes)>, ProtocolError> {
        if lpdu.len() < LPDU_HEADER_SIZE {
            return Err(ProtocolError::Incomplete {
                expected: LPDU_HEADER_SIZE,
                actual: lpdu.len(),
            });
        }
        let tcid = lpdu[0];
        let more = lpdu[1] & LPDU_MORE != 0;
        let payload = &lpdu[LPDU_HEADER_SIZE..];

        let buf = self.partial.entry(tcid).or_default();
        if buf.len() + payload.len() > self.limit {
            self.partial.remove(&tcid);
            return Err(ProtocolError::LengthTooLarge(
                self.limit + 1,
                self.limit,
            ));
        }
        buf.put_slice(payload);

        if more {
            return Ok(None);
        }
        let complete = self.partial.remove(&tcid).unwrap_or_default();
        Ok(Some((tcid, complete.freeze())))
    }

    /// Drop any half-received TPDU for `tcid`.
    pub fn reset(&mut self, tcid: u8) {
        self.partial.remove(&tcid);
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

// ---------------------------------------------------------------------------
// Transport layer
// ---------------------------------------------------------------------------

/// A transport protocol data unit, without its connection id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tpdu {
    CreateTc,
    CreateTcReply,
    DeleteTc,
    DeleteTcReply,
    RequestTc,
    NewTc { new_tcid: u8 },
    TcError { code: u8 },
    /// Receive request for buffered module data.
    Rcv,
    DataLast(Bytes),
    DataMore(Bytes),
}

impl Tpdu {
    pub fn tag(&self) -> u8 {
        match self {
            Tpdu::CreateTc => tpdu_tag::CREATE_TC,
            Tpdu::CreateTcReply => tpdu_tag::CREATE_TC_REPLY,
            Tpdu::DeleteTc => tpdu_tag::DELETE_TC,
            Tpdu::DeleteTcReply => tpdu_tag::DELETE_TC_REPLY,
            Tpdu::RequestTc => tpdu_tag::REQUEST_TC,
            Tpdu::NewTc { .. } => tpdu_tag::NEW_TC,
            Tpdu::TcError { .. } => tpdu_tag::TC_ERROR,
            Tpdu::Rcv => tpdu_tag::RCV,
            Tpdu::DataLast(_) => tpdu_tag::DATA_LAST,
            Tpdu::DataMore(_) => tpdu_tag::DATA_MORE,
        }
    }
}

/// A decoded module-to-host TPDU with its trailing status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReply {
    pub tcid: u8,
    /// `None` when the module sent only a status block.
    pub tpdu: Option<Tpdu>,
    /// The status block's "data available" bit.
    pub data_available: bool,
}

fn put_tpdu(frame: &mut BytesMut, tcid: u8, tpdu: &Tpdu) -> Result<(), ProtocolError> {
    let body: &[u8] = match tpdu {
        Tpdu::NewTc { new_tcid } => std::slice::from_ref(new_tcid),
        Tpdu::TcError { code } => std::slice::from_ref(code),
        Tpdu::DataLast(data) | Tpdu::DataMore(data) => data,
        _ => &[],
    };
    frame.put_u8(tpdu.tag());
    encode_length(frame, body.len() + 1)?;
    frame.put_u8(tcid);
    frame.put_slice(body);
    Ok(())
}

/// Encode a host-to-module TPDU.
pub fn encode_tpdu(tcid: u8, tpdu: &Tpdu) -> Result<Bytes, ProtocolError> {
    let mut frame = BytesMut::new();
    put_tpdu(&mut frame, tcid, tpdu)?;
    Ok(frame.freeze())
}

/// Encode a module-to-host TPDU followed by a status block.
pub fn encode_module_reply(
    tcid: u8,
    tpdu: Option<&Tpdu>,
    data_available: bool,
) -> Result<Bytes, ProtocolError> {
    let mut frame = BytesMut::new();
    if let Some(tpdu) = tpdu {
        put_tpdu(&mut frame, tcid, tpdu)?;
    }
    frame.put_u8(tpdu_tag::SB);
    frame.put_u8(2);
    frame.put_u8(tcid);
    frame.put_u8(if data_available { 0x80 } else { 0x00 });
    Ok(frame.freeze())
}

fn decode_tpdu_body(tag: u8, body: &[u8]) -> Result<Tpdu, ProtocolError> {
    let one_byte = |body: &[u8]| {
        body.first().copied().ok_or(ProtocolError::InvalidBodyLength {
            tag: tag as u32,
            len: body.len(),
        })
    };
    Ok(match tag {
        tpdu_tag::CREATE_TC => Tpdu::CreateTc,
        tpdu_tag::CREATE_TC_REPLY => Tpdu::CreateTcReply,
        tpdu_tag::DELETE_TC => Tpdu::DeleteTc,
        tpdu_tag::DELETE_TC_REPLY => Tpdu::DeleteTcReply,
        tpdu_tag::REQUEST_TC => Tpdu::RequestTc,
        tpdu_tag::NEW_TC => Tpdu::NewTc {
            new_tcid: one_byte(body)?,
        },
        tpdu_tag::TC_ERROR => Tpdu::TcError {
            code: one_byte(body)?,
        },
        tpdu_tag::RCV => Tpdu::Rcv,
        tpdu_tag::DATA_LAST => Tpdu::DataLast(Bytes::copy_from_slice(body)),
        tpdu_tag::DATA_MORE => Tpdu::DataMore(Bytes::copy_from_slice(body)),
        other => return Err(ProtocolError::UnknownTag(other as u32)),
    })
}

/// Decode one `tag | length | tcid | body` unit, returning it and the rest.
fn decode_tpdu_unit(buf: &[u8]) -> Result<(u8, u8, &[u8], &[u8]), ProtocolError> {
    let tag = *buf.first().ok_or(ProtocolError::Incomplete {
        expected: 1,
        actual: 0,
    })?;
    let (value, rest) = split_length_prefixed(&buf[1..])?;
    let (tcid, body) = value.split_first().ok_or(ProtocolError::InvalidBodyLength {
        tag: tag as u32,
        len: 0,
    })?;
    Ok((tag, *tcid, body, rest))
}

/// Decode a host-to-module TPDU (used by module simulators).
pub fn decode_tpdu(buf: &[u8]) -> Result<(u8, Tpdu), ProtocolError> {
    let (tag, tcid, body, _) = decode_tpdu_unit(buf)?;
    Ok((tcid, decode_tpdu_body(tag, body)?))
}

/// Decode a module-to-host TPDU and its status block.
pub fn decode_module_reply(buf: &[u8]) -> Result<ModuleReply, ProtocolError> {
    let (tag, tcid, body, rest) = decode_tpdu_unit(buf)?;

    if tag == tpdu_tag::SB {
        return Ok(ModuleReply {
            tcid,
            tpdu: None,
            data_available: body.first().map_or(false, |sb| sb & 0x80 != 0),
        });
    }

    let tpdu = decode_tpdu_body(tag, body)?;
    let (sb_tag, sb_tcid, sb_body, _) = decode_tpdu_unit(rest)?;
    if sb_tag != tpdu_tag::SB {
        return Err(ProtocolError::UnknownTag(sb_tag as u32));
    }
    if sb_tcid != tcid {
        return Err(ProtocolError::ConnectionMismatch {
            expected: tcid,
            actual: sb_tcid,
        });
    }
    Ok(ModuleReply {
        tcid,
        tpdu: Some(tpdu),
        data_available: sb_body.first().map_or(false, |sb| sb & 0x80 != 0),
    })
}

// ---------------------------------------------------------------------------
// Session layer
// ---------------------------------------------------------------------------

/// A session protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spdu {
    /// Session data carrying one or more APDUs.
    SessionNumber { session: u16, apdu: Bytes },
    OpenSessionRequest { resource: ResourceId },
    OpenSessionResponse {
        status: SessionStatus,
        resource: ResourceId,
        session: u16,
    },
    CreateSession { resource: ResourceId, session: u16 },
    CreateSessionResponse {
        status: SessionStatus,
        resource: ResourceId,
        session: u16,
    },
    CloseSessionRequest { session: u16 },
    CloseSessionResponse { status: SessionStatus, session: u16 },
}

/// Encode a session protocol data unit.
pub fn encode_spdu(spdu: &Spdu) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::with_capacity(8);
    let tag = match spdu {
        Spdu::SessionNumber { session, .. } => {
            body.put_u16(*session);
            spdu_tag::SESSION_NUMBER
        }
        Spdu::OpenSessionRequest { resource } => {
            body.put_u32(resource.0);
            spdu_tag::OPEN_SESSION_REQUEST
        }
        Spdu::OpenSessionResponse {
            status,
            resource,
            session,
        } => {
            body.put_u8((*status).into());
            body.put_u32(resource.0);
            body.put_u16(*session);
            spdu_tag::OPEN_SESSION_RESPONSE
        }
        Spdu::CreateSession { resource, session } => {
            body.put_u32(resource.0);
            body.put_u16(*session);
            spdu_tag::CREATE_SESSION
        }
        Spdu::CreateSessionResponse {
            status,
            resource,
            session,
        } => {
            body.put_u8((*status).into());
            body.put_u32(resource.0);
            body.put_u16(*session);
            spdu_tag::CREATE_SESSION_RESPONSE
        }
        Spdu::CloseSessionRequest { session } => {
            body.put_u16(*session);
            spdu_tag::CLOSE_SESSION_REQUEST
        }
        Spdu::CloseSessionResponse { status, session } => {
            body.put_u8((*status).into());
            body.put_u16(*session);
            spdu_tag::CLOSE_SESSION_RESPONSE
        }
    };

    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.put_u8(tag);
    encode_length(&mut frame, body.len())?;
    frame.put_slice(&body);
    if let Spdu::SessionNumber { apdu, .. } = spdu {
        frame.put_slice(apdu);
    }
    Ok(frame.freeze())
}

/// Decode a session protocol data unit.
pub fn decode_spdu(buf: &[u8]) -> Result<Spdu, ProtocolError> {
    let tag = *buf.first().ok_or(ProtocolError::Incomplete {
        expected: 1,
        actual: 0,
    })?;
    let (body, rest) = split_length_prefixed(&buf[1..])?;

    let expect = |len: usize| {
        if body.len() == len {
            Ok(())
        } else {
            Err(ProtocolError::InvalidBodyLength {
                tag: tag as u32,
                len: body.len(),
            })
        }
    };
    let mut b = body;

    Ok(match tag {
        spdu_tag::SESSION_NUMBER => {
            expect(2)?;
            Spdu::SessionNumber {
                session: b.get_u16(),
                apdu: Bytes::copy_from_slice(rest),
            }
        }
        spdu_tag::OPEN_SESSION_REQUEST => {
            expect(4)?;
            Spdu::OpenSessionRequest {
                resource: ResourceId(b.get_u32()),
            }
        }
        spdu_tag::OPEN_SESSION_RESPONSE => {
            expect(7)?;
            Spdu::OpenSessionResponse {
                status: b.get_u8().into(),
                resource: ResourceId(b.get_u32()),
                session: b.get_u16(),
            }
        }
        spdu_tag::CREATE_SESSION => {
            expect(6)?;
            Spdu::CreateSession {
                resource: ResourceId(b.get_u32()),
                session: b.get_u16(),
            }
        }
        spdu_tag::CREATE_SESSION_RESPONSE => {
            expect(7)?;
            Spdu::CreateSessionResponse {
                status: b.get_u8().into(),
                resource: ResourceId(b.get_u32()),
                session: b.get_u16(),
            }
        }
        spdu_tag::CLOSE_SESSION_REQUEST => {
            expect(2)?;
            Spdu::CloseSessionRequest {
                session: b.get_u16(),
            }
        }
        spdu_tag::CLOSE_SESSION_RESPONSE => {
            expect(3)?;
            Spdu::CloseSessionResponse {
                status: b.get_u8().into(),
                session: b.get_u16(),
            }
        }
        other => return Err(ProtocolError::UnknownTag(other as u32)),
    })
}

// ---------------------------------------------------------------------------
// Application layer framing
// ---------------------------------------------------------------------------

/// Encode an APDU: 24-bit tag, length field, body.
pub fn encode_apdu(tag: u32, body: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut frame = BytesMut::with_capacity(6 + body.len());
    put_apdu(&mut frame, tag, body)?;
    Ok(frame.freeze())
}

/// Append an APDU to an existing buffer.
pub fn put_apdu(frame: &mut BytesMut, tag: u32, body: &[u8]) -> Result<(), ProtocolError> {
    frame.put_u8((tag >> 16) as u8);
    frame.put_u8((tag >> 8) as u8);
    frame.put_u8(tag as u8);
    encode_length(frame, body.len())?;
    frame.put_slice(body);
    Ok(())
}

/// Decode one APDU, returning its tag, body, and the bytes following it.
pub fn decode_apdu(buf: &[u8]) -> Result<(u32, &[u8], &[u8]), ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::Incomplete {
            expected: 4,
            actual: buf.len(),
        });
    }
    let tag = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32;
    let (body, rest) = split_length_prefixed(&buf[3..])?;
    Ok((tag, body, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_forms() {
        let mut buf = BytesMut::new();
        encode_length(&mut buf, 0x7F).unwrap();
        encode_length(&mut buf, 0x80).unwrap();
        encode_length(&mut buf, 0x1234).unwrap();
        assert_eq!(&buf[..], &[0x7F, 0x81, 0x80, 0x82, 0x12, 0x34]);

        assert_eq!(decode_length(&[0x7F]).unwrap(), (0x7F, 1));
        assert_eq!(decode_length(&[0x81, 0x80]).unwrap(), (0x80, 2));
        assert_eq!(decode_length(&[0x82, 0x12, 0x34]).unwrap(), (0x1234, 3));
    }

    #[test]
    fn test_length_rejects_bad_forms() {
        assert_eq!(
            decode_length(&[0x80]),
            Err(ProtocolError::InvalidLengthField(0x80))
        );
        assert!(matches!(
            decode_length(&[0x82, 0x01]),
            Err(ProtocolError::Incomplete { .. })
        ));
        let mut buf = BytesMut::new();
        assert!(encode_length(&mut buf, 0x10000).is_err());
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let tpdu: Vec<u8> = (0..100u8).collect();
        let frames = fragment_lpdu(1, &tpdu, 32);
        assert_eq!(frames.len(), 4);
        assert!(frames[..3].iter().all(|f| f[1] == LPDU_MORE));
        assert_eq!(frames[3][1], LPDU_LAST);

        let mut reassembler = LinkReassembler::new(4096);
        let mut out = None;
        for frame in &frames {
            out = reassembler.push(frame).unwrap();
        }
        let (tcid, data) = out.unwrap();
        assert_eq!(tcid, 1);
        assert_eq!(&data[..], &tpdu[..]);
    }

    #[test]
    fn test_reassembler_limit() {
        let mut reassembler = LinkReassembler::new(4);
        assert!(reassembler.push(&[1, LPDU_MORE, 1, 2, 3]).unwrap().is_none());
        assert!(reassembler.push(&[1, LPDU_LAST, 4, 5]).is_err());
        // State was discarded, a fresh TPDU goes through.
        assert_eq!(
            reassembler.push(&[1, LPDU_LAST, 9]).unwrap(),
            Some((1, Bytes::from_static(&[9])))
        );
    }

    #[test]
    fn test_tpdu_create() {
        let encoded = encode_tpdu(1, &Tpdu::CreateTc).unwrap();
        assert_eq!(&encoded[..], &[0x82, 0x01, 0x01]);
        assert_eq!(decode_tpdu(&encoded).unwrap(), (1, Tpdu::CreateTc));
    }

    #[test]
    fn test_module_reply_with_status() {
        let data = Tpdu::DataLast(Bytes::from_static(&[0x90, 0x02, 0x00, 0x01]));
        let encoded = encode_module_reply(1, Some(&data), true).unwrap();
        let reply = decode_module_reply(&encoded).unwrap();
        assert_eq!(reply.tcid, 1);
        assert_eq!(reply.tpdu, Some(data));
        assert!(reply.data_available);

        let status_only = encode_module_reply(1, None, false).unwrap();
        assert_eq!(&status_only[..], &[0x80, 0x02, 0x01, 0x00]);
        let reply = decode_module_reply(&status_only).unwrap();
        assert!(reply.tpdu.is_none());
        assert!(!reply.data_available);
    }

    #[test]
    fn test_module_reply_status_mismatch() {
        let bad = [0x83, 0x01, 0x01, 0x80, 0x02, 0x02, 0x00];
        assert_eq!(
            decode_module_reply(&bad),
            Err(ProtocolError::ConnectionMismatch {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn test_spdu_open_session() {
        let msg = Spdu::OpenSessionResponse {
            status: SessionStatus::Ok,
            resource: ResourceId::CONDITIONAL_ACCESS,
            session: 3,
        };
        let encoded = encode_spdu(&msg).unwrap();
        assert_eq!(
            &encoded[..],
            &[0x92, 0x07, 0x00, 0x00, 0x03, 0x00, 0x41, 0x00, 0x03]
        );
        assert_eq!(decode_spdu(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_spdu_session_data() {
        let apdu = encode_apdu(apdu_tag::CA_INFO_ENQ, &[]).unwrap();
        let msg = Spdu::SessionNumber {
            session: 5,
            apdu: apdu.clone(),
        };
        let encoded = encode_spdu(&msg).unwrap();
        assert_eq!(&encoded[..4], &[0x90, 0x02, 0x00, 0x05]);
        assert_eq!(decode_spdu(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_spdu_bad_length() {
        assert!(matches!(
            decode_spdu(&[0x95, 0x01, 0x00]),
            Err(ProtocolError::InvalidBodyLength { .. })
        ));
    }

    #[test]
    fn test_apdu_framing() {
        let body = vec![0xAB; 300];
        let encoded = encode_apdu(apdu_tag::CA_PMT, &body).unwrap();
        assert_eq!(&encoded[..6], &[0x9F, 0x80, 0x32, 0x82, 0x01, 0x2C]);
        let (tag, decoded, rest) = decode_apdu(&encoded).unwrap();
        assert_eq!(tag, apdu_tag::CA_PMT);
        assert_eq!(decoded, &body[..]);
        assert!(rest.is_empty());
    }
}
