//! Tag constants and small typed values of the EN 50221 protocol.

use serde::{Deserialize, Serialize};

/// Default negotiated link-layer buffer size.
pub const DEFAULT_LINK_BUFFER_SIZE: usize = 255;

/// Smallest link-layer buffer size the host accepts.
pub const MIN_LINK_BUFFER_SIZE: usize = 16;

/// Largest length the encoder writes (three-byte `0x82 hi lo` form).
pub const MAX_ENCODED_LENGTH: usize = 0xFFFF;

/// Transport layer tags.
pub mod tpdu_tag {
    /// Status byte block appended to every module reply.
    pub const SB: u8 = 0x80;
    /// Request for buffered module data.
    pub const RCV: u8 = 0x81;
    /// Create transport connection.
    pub const CREATE_TC: u8 = 0x82;
    /// Create transport connection reply.
    pub const CREATE_TC_REPLY: u8 = 0x83;
    /// Delete transport connection.
    pub const DELETE_TC: u8 = 0x84;
    /// Delete transport connection reply.
    pub const DELETE_TC_REPLY: u8 = 0x85;
    /// Module asks the host for a new transport connection.
    pub const REQUEST_TC: u8 = 0x86;
    /// Host hands a new connection id to the module.
    pub const NEW_TC: u8 = 0x87;
    /// Host cannot satisfy a connection request.
    pub const TC_ERROR: u8 = 0x88;
    /// Last (or only) data chunk.
    pub const DATA_LAST: u8 = 0xA0;
    /// Data chunk with more to follow.
    pub const DATA_MORE: u8 = 0xA1;
}

/// Session layer tags.
pub mod spdu_tag {
    pub const SESSION_NUMBER: u8 = 0x90;
    pub const OPEN_SESSION_REQUEST: u8 = 0x91;
    pub const OPEN_SESSION_RESPONSE: u8 = 0x92;
    pub const CREATE_SESSION: u8 = 0x93;
    pub const CREATE_SESSION_RESPONSE: u8 = 0x94;
    pub const CLOSE_SESSION_REQUEST: u8 = 0x95;
    pub const CLOSE_SESSION_RESPONSE: u8 = 0x96;
}

/// Application layer tags (24-bit).
pub mod apdu_tag {
    pub const PROFILE_ENQ: u32 = 0x9F8010;
    pub const PROFILE: u32 = 0x9F8011;
    pub const PROFILE_CHANGE: u32 = 0x9F8012;

    pub const APPLICATION_INFO_ENQ: u32 = 0x9F8020;
    pub const APPLICATION_INFO: u32 = 0x9F8021;
    pub const ENTER_MENU: u32 = 0x9F8022;

    pub const CA_INFO_ENQ: u32 = 0x9F8030;
    pub const CA_INFO: u32 = 0x9F8031;
    pub const CA_PMT: u32 = 0x9F8032;
    pub const CA_PMT_REPLY: u32 = 0x9F8033;

    pub const DATE_TIME_ENQ: u32 = 0x9F8440;
    pub const DATE_TIME: u32 = 0x9F8441;

    pub const CLOSE_MMI: u32 = 0x9F8800;
    pub const DISPLAY_CONTROL: u32 = 0x9F8801;
    pub const DISPLAY_REPLY: u32 = 0x9F8802;
    pub const TEXT_LAST: u32 = 0x9F8803;
    pub const TEXT_MORE: u32 = 0x9F8804;
    pub const KEYPAD_CONTROL: u32 = 0x9F8805;
    pub const KEYPRESS: u32 = 0x9F8806;
    pub const ENQ: u32 = 0x9F8807;
    pub const ANSW: u32 = 0x9F8808;
    pub const MENU_LAST: u32 = 0x9F8809;
    pub const MENU_MORE: u32 = 0x9F880A;
    pub const MENU_ANSW: u32 = 0x9F880B;
    pub const LIST_LAST: u32 = 0x9F880C;
    pub const LIST_MORE: u32 = 0x9F880D;
}

/// Descriptor tag of the MPEG CA descriptor.
pub const CA_DESCRIPTOR_TAG: u8 = 0x09;

/// Session open/create status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionStatus {
    Ok = 0x00,
    /// Resource does not exist.
    NotFound = 0xF0,
    /// Resource exists but is unavailable.
    Unavailable = 0xF1,
    /// Resource exists with a lower version than requested.
    VersionTooLow = 0xF2,
    /// Resource is busy.
    Busy = 0xF3,
}

impl From<u8> for SessionStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => SessionStatus::Ok,
            0xF0 => SessionStatus::NotFound,
            0xF2 => SessionStatus::VersionTooLow,
            0xF3 => SessionStatus::Busy,
            _ => SessionStatus::Unavailable,
        }
    }
}

impl From<SessionStatus> for u8 {
    fn from(value: SessionStatus) -> Self {
        value as u8
    }
}

/// A 32-bit CI resource identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u32);

/// Decoded form of a public resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicResourceId {
    pub resource_class: u16,
    pub resource_type: u16,
    pub resource_version: u8,
}

impl ResourceId {
    pub const RESOURCE_MANAGER: ResourceId = ResourceId(0x0001_0041);
    pub const APPLICATION_INFO: ResourceId = ResourceId(0x0002_0041);
    pub const CONDITIONAL_ACCESS: ResourceId = ResourceId(0x0003_0041);
    pub const DATE_TIME: ResourceId = ResourceId(0x0024_0041);
    pub const MMI: ResourceId = ResourceId(0x0040_0041);

    /// Pack a public resource id.
    pub fn public(resource_class: u16, resource_type: u16, resource_version: u8) -> Self {
        ResourceId(
            ((resource_class as u32 & 0x3FFF) << 16)
                | ((resource_type as u32 & 0x3FF) << 6)
                | (resource_version as u32 & 0x3F),
        )
    }

    /// Private ids carry `11` in the two top bits and have no class/type split.
    pub fn is_private(self) -> bool {
        self.0 >> 30 == 0b11
    }

    /// Decode the class/type/version fields, `None` for private ids.
    pub fn decode_public(self) -> Option<PublicResourceId> {
        if self.is_private() {
            return None;
        }
        Some(PublicResourceId {
            resource_class: ((self.0 >> 16) & 0x3FFF) as u16,
            resource_type: ((self.0 >> 6) & 0x3FF) as u16,
            resource_version: (self.0 & 0x3F) as u8,
        })
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// `ca_pmt_list_management` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ListManagement {
    More = 0x00,
    First = 0x01,
    Last = 0x02,
    Only = 0x03,
    Add = 0x04,
    Update = 0x05,
}

impl TryFrom<u8> for ListManagement {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ListManagement::More),
            0x01 => Ok(ListManagement::First),
            0x02 => Ok(ListManagement::Last),
            0x03 => Ok(ListManagement::Only),
            0x04 => Ok(ListManagement::Add),
            0x05 => Ok(ListManagement::Update),
            other => Err(other),
        }
    }
}

/// `ca_pmt_cmd_id` values, also used as the per-program/per-stream command state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaPmtCmd {
    OkDescrambling = 0x01,
    OkMmi = 0x02,
    Query = 0x03,
    NotSelected = 0x04,
}

impl TryFrom<u8> for CaPmtCmd {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(CaPmtCmd::OkDescrambling),
            0x02 => Ok(CaPmtCmd::OkMmi),
            0x03 => Ok(CaPmtCmd::Query),
            0x04 => Ok(CaPmtCmd::NotSelected),
            other => Err(other),
        }
    }
}

/// Status carried in the low seven bits of a `CA_enable` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaEnable {
    /// Descrambling possible.
    Possible,
    /// Possible under purchase dialogue.
    PossiblePurchase,
    /// Possible under technical dialogue.
    PossibleTechnical,
    /// Not possible, no entitlement.
    NotPossibleEntitlement,
    /// Not possible for technical reasons.
    NotPossibleTechnical,
    Other(u8),
}

impl CaEnable {
    /// Decode a `CA_enable_flag | CA_enable` byte, `None` when the flag is clear.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0x80 == 0 {
            return None;
        }
        Some(match byte & 0x7F {
            0x01 => CaEnable::Possible,
            0x02 => CaEnable::PossiblePurchase,
            0x03 => CaEnable::PossibleTechnical,
            0x71 => CaEnable::NotPossibleEntitlement,
            0x73 => CaEnable::NotPossibleTechnical,
            other => CaEnable::Other(other),
        })
    }

    pub fn to_byte(self) -> u8 {
        0x80 | match self {
            CaEnable::Possible => 0x01,
            CaEnable::PossiblePurchase => 0x02,
            CaEnable::PossibleTechnical => 0x03,
            CaEnable::NotPossibleEntitlement => 0x71,
            CaEnable::NotPossibleTechnical => 0x73,
            CaEnable::Other(v) => v & 0x7F,
        }
    }
}

/// Application type reported in `application_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationType {
    ConditionalAccess,
    ElectronicProgrammeGuide,
    Other(u8),
}

impl From<u8> for ApplicationType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ApplicationType::ConditionalAccess,
            0x02 => ApplicationType::ElectronicProgrammeGuide,
            other => ApplicationType::Other(other),
        }
    }
}

impl From<ApplicationType> for u8 {
    fn from(value: ApplicationType) -> Self {
        match value {
            ApplicationType::ConditionalAccess => 0x01,
            ApplicationType::ElectronicProgrammeGuide => 0x02,
            ApplicationType::Other(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_resource_id_fields() {
        let id = ResourceId::CONDITIONAL_ACCESS.decode_public().unwrap();
        assert_eq!(id.resource_class, 3);
        assert_eq!(id.resource_type, 1);
        assert_eq!(id.resource_version, 1);

        let mmi = ResourceId::MMI.decode_public().unwrap();
        assert_eq!(mmi.resource_class, 0x40);
        assert_eq!(ResourceId::public(0x40, 1, 1), ResourceId::MMI);
    }

    #[test]
    fn test_private_resource_id() {
        let id = ResourceId(0xC000_1234);
        assert!(id.is_private());
        assert!(id.decode_public().is_none());
    }

    #[test]
    fn test_ca_enable_byte() {
        assert_eq!(CaEnable::from_byte(0x81), Some(CaEnable::Possible));
        assert_eq!(CaEnable::from_byte(0x01), None);
        assert_eq!(CaEnable::from_byte(0xF1), Some(CaEnable::NotPossibleEntitlement));
        assert_eq!(CaEnable::Possible.to_byte(), 0x81);
    }
}
