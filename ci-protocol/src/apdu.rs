//! Application protocol data units of the host resources.
//!
//! Each resource gets its own enum with `decode(tag, body)` and `encode()`.
//! Bodies handed to `decode` are the bytes after the APDU length field.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{decode_apdu, encode_apdu, put_apdu};
use crate::error::ProtocolError;
use crate::types::*;

fn invalid(tag: u32, body: &[u8]) -> ProtocolError {
    ProtocolError::InvalidBodyLength {
        tag,
        len: body.len(),
    }
}

fn require(tag: u32, body: &[u8], min: usize) -> Result<(), ProtocolError> {
    if body.len() < min {
        Err(invalid(tag, body))
    } else {
        Ok(())
    }
}

/// Decode DVB text bytes, skipping a leading character table selector.
pub fn decode_text(raw: &[u8]) -> String {
    let text = match raw.first() {
        Some(0x10) => raw.get(3..).unwrap_or_default(),
        Some(0x1F) => raw.get(2..).unwrap_or_default(),
        Some(b) if *b < 0x20 => &raw[1..],
        _ => raw,
    };
    match std::str::from_utf8(text) {
        Ok(s) => s.to_string(),
        // Latin-1 fallback, every byte maps to one code point.
        Err(_) => text.iter().map(|b| *b as char).collect(),
    }
}

// ---------------------------------------------------------------------------
// Resource Manager
// ---------------------------------------------------------------------------

/// Resource Manager APDUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RmApdu {
    ProfileEnq,
    Profile(Vec<ResourceId>),
    ProfileChange,
}

impl RmApdu {
    pub fn decode(tag: u32, body: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            apdu_tag::PROFILE_ENQ => Ok(RmApdu::ProfileEnq),
            apdu_tag::PROFILE_CHANGE => Ok(RmApdu::ProfileChange),
            apdu_tag::PROFILE => {
                if body.len() % 4 != 0 {
                    return Err(invalid(tag, body));
                }
                Ok(RmApdu::Profile(
                    body.chunks_exact(4)
                        .map(|c| ResourceId(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
                        .collect(),
                ))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            RmApdu::ProfileEnq => encode_apdu(apdu_tag::PROFILE_ENQ, &[]),
            RmApdu::ProfileChange => encode_apdu(apdu_tag::PROFILE_CHANGE, &[]),
            RmApdu::Profile(ids) => {
                let mut body = BytesMut::with_capacity(ids.len() * 4);
                for id in ids {
                    body.put_u32(id.0);
                }
                encode_apdu(apdu_tag::PROFILE, &body)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Application Information
// ---------------------------------------------------------------------------

/// Contents of an `application_info` APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub application_type: ApplicationType,
    pub manufacturer: u16,
    pub manufacturer_code: u16,
    pub menu_string: String,
}

/// Application Information APDUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiApdu {
    ApplicationInfoEnq,
    ApplicationInfo(ApplicationInfo),
    EnterMenu,
}

impl AiApdu {
    pub fn decode(tag: u32, body: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            apdu_tag::APPLICATION_INFO_ENQ => Ok(AiApdu::ApplicationInfoEnq),
            apdu_tag::ENTER_MENU => Ok(AiApdu::EnterMenu),
            apdu_tag::APPLICATION_INFO => {
                require(tag, body, 6)?;
                let mut b = body;
                let application_type = ApplicationType::from(b.get_u8());
                let manufacturer = b.get_u16();
                let manufacturer_code = b.get_u16();
                let menu_len = b.get_u8() as usize;
                if b.len() < menu_len {
                    return Err(invalid(tag, body));
                }
                Ok(AiApdu::ApplicationInfo(ApplicationInfo {
                    application_type,
                    manufacturer,
                    manufacturer_code,
                    menu_string: decode_text(&b[..menu_len]),
                }))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            AiApdu::ApplicationInfoEnq => encode_apdu(apdu_tag::APPLICATION_INFO_ENQ, &[]),
            AiApdu::EnterMenu => encode_apdu(apdu_tag::ENTER_MENU, &[]),
            AiApdu::ApplicationInfo(info) => {
                let menu = info.menu_string.as_bytes();
                if menu.len() > 0xFF {
                    return Err(ProtocolError::LengthTooLarge(menu.len(), 0xFF));
                }
                let mut body = BytesMut::with_capacity(6 + menu.len());
                body.put_u8(info.application_type.into());
                body.put_u16(info.manufacturer);
                body.put_u16(info.manufacturer_code);
                body.put_u8(menu.len() as u8);
                body.put_slice(menu);
                encode_apdu(apdu_tag::APPLICATION_INFO, &body)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conditional Access
// ---------------------------------------------------------------------------

/// Per-stream entry of a `ca_pmt_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaPmtReplyStream {
    pub pid: u16,
    /// Raw `CA_enable_flag | CA_enable` byte.
    pub ca_enable: u8,
}

/// Contents of a `ca_pmt_reply` APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPmtReply {
    pub program_number: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    /// Raw program-level `CA_enable_flag | CA_enable` byte.
    pub ca_enable: u8,
    pub streams: Vec<CaPmtReplyStream>,
}

impl CaPmtReply {
    /// Program-level grant: flag set and status "descrambling possible".
    pub fn program_ok(&self) -> bool {
        CaEnable::from_byte(self.ca_enable) == Some(CaEnable::Possible)
    }
}

/// Conditional Access APDUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaApdu {
    CaInfoEnq,
    CaInfo(Vec<u16>),
    /// Already-built CA_PMT payload.
    CaPmt(Bytes),
    CaPmtReply(CaPmtReply),
}

impl CaApdu {
    pub fn decode(tag: u32, body: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            apdu_tag::CA_INFO_ENQ => Ok(CaApdu::CaInfoEnq),
            apdu_tag::CA_INFO => {
                if body.len() % 2 != 0 {
                    return Err(invalid(tag, body));
                }
                Ok(CaApdu::CaInfo(
                    body.chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                ))
            }
            apdu_tag::CA_PMT => Ok(CaApdu::CaPmt(Bytes::copy_from_slice(body))),
            apdu_tag::CA_PMT_REPLY => {
                require(tag, body, 4)?;
                let mut b = body;
                let program_number = b.get_u16();
                let vc = b.get_u8();
                let ca_enable = b.get_u8();
                if b.len() % 3 != 0 {
                    return Err(invalid(tag, body));
                }
                let streams = b
                    .chunks_exact(3)
                    .map(|c| CaPmtReplyStream {
                        pid: u16::from_be_bytes([c[0], c[1]]) & 0x1FFF,
                        ca_enable: c[2],
                    })
                    .collect();
                Ok(CaApdu::CaPmtReply(CaPmtReply {
                    program_number,
                    version_number: (vc >> 1) & 0x1F,
                    current_next_indicator: vc & 0x01 != 0,
                    ca_enable,
                    streams,
                }))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            CaApdu::CaInfoEnq => encode_apdu(apdu_tag::CA_INFO_ENQ, &[]),
            CaApdu::CaInfo(ids) => {
                let mut body = BytesMut::with_capacity(ids.len() * 2);
                for id in ids {
                    body.put_u16(*id);
                }
                encode_apdu(apdu_tag::CA_INFO, &body)
            }
            CaApdu::CaPmt(payload) => encode_apdu(apdu_tag::CA_PMT, payload),
            CaApdu::CaPmtReply(reply) => {
                let mut body = BytesMut::with_capacity(4 + reply.streams.len() * 3);
                body.put_u16(reply.program_number);
                body.put_u8(
                    0xC0 | ((reply.version_number & 0x1F) << 1)
                        | reply.current_next_indicator as u8,
                );
                body.put_u8(reply.ca_enable);
                for stream in &reply.streams {
                    body.put_u16(stream.pid & 0x1FFF);
                    body.put_u8(stream.ca_enable);
                }
                encode_apdu(apdu_tag::CA_PMT_REPLY, &body)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Date-Time
// ---------------------------------------------------------------------------

/// Modified Julian Date of the Unix epoch.
const MJD_UNIX_EPOCH: i64 = 40587;

fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

fn from_bcd(v: u8) -> u8 {
    (v >> 4) * 10 + (v & 0x0F)
}

/// Date-Time APDUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateTimeApdu {
    /// Module asks for the time every `response_interval` seconds (0 = once).
    Enq { response_interval: u8 },
    DateTime {
        /// Seconds since the Unix epoch, UTC.
        unix_seconds: i64,
        local_offset_minutes: Option<i16>,
    },
}

impl DateTimeApdu {
    pub fn decode(tag: u32, body: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            apdu_tag::DATE_TIME_ENQ => Ok(DateTimeApdu::Enq {
                response_interval: body.first().copied().unwrap_or(0),
            }),
            apdu_tag::DATE_TIME => {
                if body.len() != 5 && body.len() != 7 {
                    return Err(invalid(tag, body));
                }
                let mjd = u16::from_be_bytes([body[0], body[1]]) as i64;
                let secs = from_bcd(body[2]) as i64 * 3600
                    + from_bcd(body[3]) as i64 * 60
                    + from_bcd(body[4]) as i64;
                let local_offset_minutes = if body.len() == 7 {
                    Some(i16::from_be_bytes([body[5], body[6]]))
                } else {
                    None
                };
                Ok(DateTimeApdu::DateTime {
                    unix_seconds: (mjd - MJD_UNIX_EPOCH) * 86400 + secs,
                    local_offset_minutes,
                })
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            DateTimeApdu::Enq { response_interval } => {
                encode_apdu(apdu_tag::DATE_TIME_ENQ, &[*response_interval])
            }
            DateTimeApdu::DateTime {
                unix_seconds,
                local_offset_minutes,
            } => {
                let days = unix_seconds.div_euclid(86400);
                let secs = unix_seconds.rem_euclid(86400);
                let mjd = days + MJD_UNIX_EPOCH;
                if !(0..=0xFFFF).contains(&mjd) {
                    return Err(ProtocolError::LengthTooLarge(mjd as usize, 0xFFFF));
                }
                let mut body = BytesMut::with_capacity(7);
                body.put_u16(mjd as u16);
                body.put_u8(to_bcd((secs / 3600) as u8));
                body.put_u8(to_bcd(((secs % 3600) / 60) as u8));
                body.put_u8(to_bcd((secs % 60) as u8));
                if let Some(offset) = local_offset_minutes {
                    body.put_i16(*offset);
                }
                encode_apdu(apdu_tag::DATE_TIME, &body)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MMI
// ---------------------------------------------------------------------------

/// `close_mmi` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMmi {
    Immediate,
    Delay(u8),
}

/// MMI mode requested through `display_control`.
pub const MMI_MODE_HIGH_LEVEL: u8 = 0x01;
/// `display_control` command: set MMI mode.
pub const DISPLAY_CMD_SET_MMI_MODE: u8 = 0x01;
/// `display_reply` id: MMI mode acknowledge.
pub const DISPLAY_REPLY_MMI_MODE_ACK: u8 = 0x01;
/// `display_reply` id: unknown display control command.
pub const DISPLAY_REPLY_UNKNOWN_CMD: u8 = 0xF0;

/// A decoded menu or list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MmiMenu {
    pub title: String,
    pub subtitle: String,
    pub bottom: String,
    pub items: Vec<String>,
}

/// Answer to an enquiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmiAnswer {
    Cancel,
    Answer(String),
}

/// MMI APDUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmiApdu {
    Close(CloseMmi),
    DisplayControl { cmd: u8, mode: Option<u8> },
    DisplayReply { id: u8, mode: Option<u8> },
    /// One text object; `more` marks a `text_more` chunk.
    Text { raw: Bytes, more: bool },
    KeypadControl { cmd: u8, key_codes: Bytes },
    Keypress(u8),
    Enq {
        blind: bool,
        answer_length: u8,
        text: String,
    },
    Answ(MmiAnswer),
    /// Raw menu body chunk; `more` marks a `menu_more` chunk.
    Menu { raw: Bytes, more: bool },
    MenuAnsw(u8),
    /// Raw list body chunk; `more` marks a `list_more` chunk.
    List { raw: Bytes, more: bool },
}

impl MmiApdu {
    pub fn decode(tag: u32, body: &[u8]) -> Result<Self, ProtocolError> {
        let raw = || Bytes::copy_from_slice(body);
        match tag {
            apdu_tag::CLOSE_MMI => {
                require(tag, body, 1)?;
                Ok(MmiApdu::Close(match body[0] {
                    0x01 => CloseMmi::Delay(body.get(1).copied().unwrap_or(0)),
                    _ => CloseMmi::Immediate,
                }))
            }
            apdu_tag::DISPLAY_CONTROL => {
                require(tag, body, 1)?;
                Ok(MmiApdu::DisplayControl {
                    cmd: body[0],
                    mode: body.get(1).copied(),
                })
            }
            apdu_tag::DISPLAY_REPLY => {
                require(tag, body, 1)?;
                Ok(MmiApdu::DisplayReply {
                    id: body[0],
                    mode: body.get(1).copied(),
                })
            }
            apdu_tag::TEXT_LAST | apdu_tag::TEXT_MORE => Ok(MmiApdu::Text {
                raw: raw(),
                more: tag == apdu_tag::TEXT_MORE,
            }),
            apdu_tag::KEYPAD_CONTROL => {
                require(tag, body, 1)?;
                Ok(MmiApdu::KeypadControl {
                    cmd: body[0],
                    key_codes: Bytes::copy_from_slice(&body[1..]),
                })
            }
            apdu_tag::KEYPRESS => {
                require(tag, body, 1)?;
                Ok(MmiApdu::Keypress(body[0]))
            }
            apdu_tag::ENQ => {
                require(tag, body, 2)?;
                Ok(MmiApdu::Enq {
                    blind: body[0] & 0x01 != 0,
                    answer_length: body[1],
                    text: decode_text(&body[2..]),
                })
            }
            apdu_tag::ANSW => {
                require(tag, body, 1)?;
                Ok(MmiApdu::Answ(match body[0] {
                    0x01 => MmiAnswer::Answer(decode_text(&body[1..])),
                    _ => MmiAnswer::Cancel,
                }))
            }
            apdu_tag::MENU_LAST | apdu_tag::MENU_MORE => Ok(MmiApdu::Menu {
                raw: raw(),
                more: tag == apdu_tag::MENU_MORE,
            }),
            apdu_tag::MENU_ANSW => {
                require(tag, body, 1)?;
                Ok(MmiApdu::MenuAnsw(body[0]))
            }
            apdu_tag::LIST_LAST | apdu_tag::LIST_MORE => Ok(MmiApdu::List {
                raw: raw(),
                more: tag == apdu_tag::LIST_MORE,
            }),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            MmiApdu::Close(CloseMmi::Immediate) => encode_apdu(apdu_tag::CLOSE_MMI, &[0x00]),
            MmiApdu::Close(CloseMmi::Delay(d)) => encode_apdu(apdu_tag::CLOSE_MMI, &[0x01, *d]),
            MmiApdu::DisplayControl { cmd, mode } => {
                let mut body = vec![*cmd];
                body.extend(mode);
                encode_apdu(apdu_tag::DISPLAY_CONTROL, &body)
            }
            MmiApdu::DisplayReply { id, mode } => {
                let mut body = vec![*id];
                body.extend(mode);
                encode_apdu(apdu_tag::DISPLAY_REPLY, &body)
            }
            MmiApdu::Text { raw, more } => encode_apdu(
                if *more {
                    apdu_tag::TEXT_MORE
                } else {
                    apdu_tag::TEXT_LAST
                },
                raw,
            ),
            MmiApdu::KeypadControl { cmd, key_codes } => {
                let mut body = vec![*cmd];
                body.extend_from_slice(key_codes);
                encode_apdu(apdu_tag::KEYPAD_CONTROL, &body)
            }
            MmiApdu::Keypress(code) => encode_apdu(apdu_tag::KEYPRESS, &[*code]),
            MmiApdu::Enq {
                blind,
                answer_length,
                text,
            } => {
                let mut body = vec![*blind as u8, *answer_length];
                body.extend_from_slice(text.as_bytes());
                encode_apdu(apdu_tag::ENQ, &body)
            }
            MmiApdu::Answ(MmiAnswer::Cancel) => encode_apdu(apdu_tag::ANSW, &[0x00]),
            MmiApdu::Answ(MmiAnswer::Answer(text)) => {
                let mut body = vec![0x01];
                body.extend_from_slice(text.as_bytes());
                encode_apdu(apdu_tag::ANSW, &body)
            }
            MmiApdu::Menu { raw, more } => encode_apdu(
                if *more {
                    apdu_tag::MENU_MORE
                } else {
                    apdu_tag::MENU_LAST
                },
                raw,
            ),
            MmiApdu::MenuAnsw(choice) => encode_apdu(apdu_tag::MENU_ANSW, &[*choice]),
            MmiApdu::List { raw, more } => encode_apdu(
                if *more {
                    apdu_tag::LIST_MORE
                } else {
                    apdu_tag::LIST_LAST
                },
                raw,
            ),
        }
    }
}

/// Read consecutive text objects, joining `text_more` chains.
fn read_text_objects(mut data: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let mut texts = Vec::new();
    let mut pending = BytesMut::new();
    while !data.is_empty() {
        let (tag, body, rest) = decode_apdu(data)?;
        match tag {
            apdu_tag::TEXT_MORE => pending.put_slice(body),
            apdu_tag::TEXT_LAST => {
                pending.put_slice(body);
                texts.push(decode_text(&pending));
                pending.clear();
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        }
        data = rest;
    }
    Ok(texts)
}

/// Decode a complete menu or list body (`choice_nb` followed by text objects).
pub fn decode_menu_body(body: &[u8]) -> Result<MmiMenu, ProtocolError> {
    let (choice_nb, objects) = body.split_first().ok_or(ProtocolError::Incomplete {
        expected: 1,
        actual: 0,
    })?;
    let mut texts = read_text_objects(objects)?.into_iter();
    if texts.len() < 3 {
        return Err(ProtocolError::DecodeError(format!(
            "menu has {} text objects, need at least 3",
            texts.len()
        )));
    }
    let title = texts.next().unwrap_or_default();
    let subtitle = texts.next().unwrap_or_default();
    let bottom = texts.next().unwrap_or_default();
    let mut items: Vec<String> = texts.collect();
    if *choice_nb != 0xFF {
        items.truncate(*choice_nb as usize);
    }
    Ok(MmiMenu {
        title,
        subtitle,
        bottom,
        items,
    })
}

/// Encode a menu or list body, the inverse of [`decode_menu_body`].
pub fn encode_menu_body(menu: &MmiMenu) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    body.put_u8(menu.items.len().min(0xFE) as u8);
    for text in [&menu.title, &menu.subtitle, &menu.bottom]
        .into_iter()
        .chain(menu.items.iter())
    {
        put_apdu(&mut body, apdu_tag::TEXT_LAST, text.as_bytes())?;
    }
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(encoded: &[u8]) -> (u32, Vec<u8>) {
        let (tag, body, rest) = decode_apdu(encoded).unwrap();
        assert!(rest.is_empty());
        (tag, body.to_vec())
    }

    #[test]
    fn test_profile_reply() {
        let msg = RmApdu::Profile(vec![
            ResourceId::RESOURCE_MANAGER,
            ResourceId::CONDITIONAL_ACCESS,
        ]);
        let encoded = msg.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[0x9F, 0x80, 0x11, 0x08, 0, 1, 0, 0x41, 0, 3, 0, 0x41]
        );
        let (tag, body) = split(&encoded);
        assert_eq!(RmApdu::decode(tag, &body).unwrap(), msg);
        assert!(RmApdu::decode(apdu_tag::PROFILE, &[0, 1, 0]).is_err());
    }

    #[test]
    fn test_application_info() {
        let body = [0x01, 0x12, 0x34, 0x56, 0x78, 0x05, b'C', b'A', b'M', b' ', b'1'];
        match AiApdu::decode(apdu_tag::APPLICATION_INFO, &body).unwrap() {
            AiApdu::ApplicationInfo(info) => {
                assert_eq!(info.application_type, ApplicationType::ConditionalAccess);
                assert_eq!(info.manufacturer, 0x1234);
                assert_eq!(info.manufacturer_code, 0x5678);
                assert_eq!(info.menu_string, "CAM 1");
            }
            other => panic!("unexpected {:?}", other),
        }
        // Menu length runs past the body.
        assert!(AiApdu::decode(apdu_tag::APPLICATION_INFO, &body[..8]).is_err());
    }

    #[test]
    fn test_ca_info() {
        let msg = CaApdu::decode(apdu_tag::CA_INFO, &[0x01, 0x00, 0x05, 0x00]).unwrap();
        assert_eq!(msg, CaApdu::CaInfo(vec![0x0100, 0x0500]));
        assert!(CaApdu::decode(apdu_tag::CA_INFO, &[0x01]).is_err());
    }

    #[test]
    fn test_ca_pmt_reply() {
        let body = [0x12, 0x34, 0xC3, 0x81, 0xE1, 0x00, 0x81, 0x01, 0x10, 0x71];
        let reply = match CaApdu::decode(apdu_tag::CA_PMT_REPLY, &body).unwrap() {
            CaApdu::CaPmtReply(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reply.program_number, 0x1234);
        assert_eq!(reply.version_number, 1);
        assert!(reply.current_next_indicator);
        assert!(reply.program_ok());
        assert_eq!(reply.streams.len(), 2);
        assert_eq!(reply.streams[0].pid, 0x0100);
        assert_eq!(reply.streams[1].pid, 0x0110);
        assert_eq!(reply.streams[1].ca_enable, 0x71);

        // Trailing partial stream entry is rejected.
        assert!(CaApdu::decode(apdu_tag::CA_PMT_REPLY, &body[..9]).is_err());
        assert!(CaApdu::decode(apdu_tag::CA_PMT_REPLY, &body[..3]).is_err());
    }

    #[test]
    fn test_date_time_encoding() {
        // 2023-01-01T12:34:56Z
        let msg = DateTimeApdu::DateTime {
            unix_seconds: 1_672_576_496,
            local_offset_minutes: None,
        };
        let encoded = msg.encode().unwrap();
        // MJD 59945 = 0xEA29
        assert_eq!(&encoded[..], &[0x9F, 0x84, 0x41, 0x05, 0xEA, 0x29, 0x12, 0x34, 0x56]);
        let (tag, body) = split(&encoded);
        assert_eq!(DateTimeApdu::decode(tag, &body).unwrap(), msg);
    }

    #[test]
    fn test_date_time_enq() {
        assert_eq!(
            DateTimeApdu::decode(apdu_tag::DATE_TIME_ENQ, &[10]).unwrap(),
            DateTimeApdu::Enq {
                response_interval: 10
            }
        );
        assert_eq!(
            DateTimeApdu::decode(apdu_tag::DATE_TIME_ENQ, &[]).unwrap(),
            DateTimeApdu::Enq {
                response_interval: 0
            }
        );
    }

    #[test]
    fn test_mmi_enq() {
        let body = [0x01, 0x04, b'P', b'I', b'N'];
        assert_eq!(
            MmiApdu::decode(apdu_tag::ENQ, &body).unwrap(),
            MmiApdu::Enq {
                blind: true,
                answer_length: 4,
                text: "PIN".to_string()
            }
        );
    }

    #[test]
    fn test_menu_body() {
        let menu = MmiMenu {
            title: "Main".into(),
            subtitle: "Sub".into(),
            bottom: "Bottom".into(),
            items: vec!["One".into(), "Two".into()],
        };
        let body = encode_menu_body(&menu).unwrap();
        assert_eq!(body[0], 2);
        assert_eq!(decode_menu_body(&body).unwrap(), menu);
    }

    #[test]
    fn test_menu_body_with_text_more() {
        let mut body = BytesMut::new();
        body.put_u8(0xFF);
        put_apdu(&mut body, apdu_tag::TEXT_MORE, b"Ti").unwrap();
        put_apdu(&mut body, apdu_tag::TEXT_LAST, b"tle").unwrap();
        put_apdu(&mut body, apdu_tag::TEXT_LAST, b"").unwrap();
        put_apdu(&mut body, apdu_tag::TEXT_LAST, b"").unwrap();
        put_apdu(&mut body, apdu_tag::TEXT_LAST, b"Item").unwrap();
        let menu = decode_menu_body(&body).unwrap();
        assert_eq!(menu.title, "Title");
        assert_eq!(menu.items, vec!["Item".to_string()]);
    }

    #[test]
    fn test_decode_text_charset_prefix() {
        assert_eq!(decode_text(&[0x05, b'a', b'b']), "ab");
        assert_eq!(decode_text(&[0x10, 0x00, 0x01, b'x']), "x");
        assert_eq!(decode_text(&[0xE9]), "é");
    }
}
