//! Wire codecs for the DVB Common Interface (EN 50221).
//!
//! This crate is I/O free. It defines the frames exchanged between a host and
//! a Conditional Access Module, from the link layer up to the resource APDUs,
//! and the CA_PMT builder that turns a PMT section into a descrambling request.
//!
//! # Layering
//!
//! ```text
//! +---------------------------------------------+
//! | APDU   tag(3) | len | body                  |  apdu.rs
//! +---------------------------------------------+
//! | SPDU   tag(1) | len | session_nb | APDU     |  codec.rs
//! +---------------------------------------------+
//! | TPDU   tag(1) | len | t_c_id | SPDU bytes   |  codec.rs
//! +---------------------------------------------+
//! | LPDU   t_c_id | more/last | TPDU fragment   |  codec.rs
//! +---------------------------------------------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use ci_protocol::{CaPmtBuilder, CaPmtCmd, ListManagement, PmtSection, DEFAULT_CA_PMT_CAPACITY};
//!
//! let pmt = PmtSection {
//!     program_number: 0x1234,
//!     program_info: vec![0x09, 0x04, 0x01, 0x00, 0x00, 0x10],
//!     ..Default::default()
//! };
//! let payload = CaPmtBuilder::new(ListManagement::Only, CaPmtCmd::OkDescrambling)
//!     .build(&pmt, DEFAULT_CA_PMT_CAPACITY)
//!     .unwrap();
//! assert_eq!(&payload[..6], &[0x03, 0x12, 0x34, 0xFF, 0x00, 0x07]);
//! ```

pub mod apdu;
pub mod ca_pmt;
pub mod codec;
pub mod error;
pub mod pmt;
pub mod types;

pub use apdu::{
    AiApdu, ApplicationInfo, CaApdu, CaPmtReply, CaPmtReplyStream, CloseMmi, DateTimeApdu,
    MmiAnswer, MmiApdu, MmiMenu, RmApdu,
};
pub use ca_pmt::{CaPmt, CaPmtBuilder, CaPmtStream, CA_PMT_HEADER_SIZE, DEFAULT_CA_PMT_CAPACITY};
pub use codec::{
    decode_apdu, decode_module_reply, decode_spdu, decode_tpdu, encode_apdu,
    encode_module_reply, encode_spdu, encode_tpdu, fragment_lpdu, LinkReassembler, ModuleReply,
    Spdu, Tpdu,
};
pub use error::{CaPmtError, ProtocolError};
pub use pmt::{CaDescriptor, Descriptor, Descriptors, PmtSection, PmtStream};
pub use types::{
    ApplicationType, CaEnable, CaPmtCmd, ListManagement, PublicResourceId, ResourceId,
    SessionStatus, DEFAULT_LINK_BUFFER_SIZE, MIN_LINK_BUFFER_SIZE,
};
