//! EN 50221 host stack for DVB Common Interface slots.
//!
//! The stack is layered the same way the frames are:
//!
//! ```text
//! SlotWorker
//!   Application      resources (RM, AI, CA, Date-Time, MMI) + CaManager
//!   SessionLayer     session numbers, ResourceRegistry lookup
//!   TransportLayer   connections, polling, link fragmentation
//!   SlotLink         /dev/dvb/adapterN/caM or an in-memory loopback
//! ```
//!
//! Each layer is driven synchronously with an explicit `now`, so the whole
//! stack can be exercised in tests without sleeping. [`worker::SlotHandle`]
//! runs one worker per slot on a blocking thread for the daemon.

pub mod ca_manager;
pub mod config;
pub mod error;
pub mod logging;
pub mod resources;
pub mod session;
pub mod transport;
pub mod worker;

pub use ca_manager::{CaManager, CaManagerConfig, CaProgram, SectionUpdate};
pub use config::Config;
pub use error::{ResourceError, SessionError, TransportError};
pub use resources::{Application, ApplicationConfig, HostCallbacks, LogCallbacks};
pub use session::{ResourceKind, ResourceRegistry, SessionEvent, SessionLayer};
pub use transport::{CamState, SlotLink, TransportConfig, TransportEvent, TransportLayer};
pub use worker::{SlotCommand, SlotHandle, SlotWorker};
