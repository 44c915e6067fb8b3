//! Conditional Access resource.
//!
//! The protocol side is thin; program state lives in [`CaManager`].

use ci_protocol::CaApdu;
use log::warn;

use super::{HostCallbacks, Outbox};
use crate::ca_manager::CaManager;
use crate::error::ResourceError;

pub fn on_open(
    session: u16,
    manager: &mut CaManager,
    out: &mut Outbox,
) -> Result<(), ResourceError> {
    manager.add_session(session);
    out.push((session, CaApdu::CaInfoEnq.encode()?));
    Ok(())
}

pub fn handle(
    session: u16,
    apdu: CaApdu,
    manager: &mut CaManager,
    callbacks: &mut dyn HostCallbacks,
) -> Result<(), ResourceError> {
    match apdu {
        CaApdu::CaInfo(ids) => {
            callbacks.ca_info(session, &ids);
            manager.set_ca_info(session, ids);
        }
        CaApdu::CaPmtReply(reply) => {
            callbacks.ca_pmt_reply(session, &reply);
            manager.handle_reply(session, &reply);
        }
        other => warn!("[CA] session {} unexpected {:?}", session, other),
    }
    Ok(())
}
