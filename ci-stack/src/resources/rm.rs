//! Resource Manager.
//!
//! Both sides exchange profiles: the host answers `profile_enq` with its
//! resource list and asks for the module's on open. Once the module's
//! profile arrives the host sends `profile_change`, so the module re-reads
//! the host profile and starts opening sessions.

use ci_protocol::{ResourceId, RmApdu};
use log::{debug, info};

use super::{HostCallbacks, Outbox};
use crate::error::ResourceError;
use crate::session::ResourceRegistry;

#[derive(Debug, Default)]
pub struct RmState {
    /// Resources the module reported in its own profile.
    module_profile: Vec<ResourceId>,
}

impl RmState {
    pub fn module_profile(&self) -> &[ResourceId] {
        &self.module_profile
    }

    pub fn on_open(&mut self, session: u16, out: &mut Outbox) -> Result<(), ResourceError> {
        out.push((session, RmApdu::ProfileEnq.encode()?));
        Ok(())
    }

    pub fn handle(
        &mut self,
        session: u16,
        apdu: RmApdu,
        registry: &ResourceRegistry,
        callbacks: &mut dyn HostCallbacks,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        match apdu {
            RmApdu::ProfileEnq => {
                callbacks.profile_enquiry(session);
                let ids = registry.resource_ids();
                debug!("[RM] session {} reporting {} resources", session, ids.len());
                out.push((session, RmApdu::Profile(ids).encode()?));
            }
            RmApdu::ProfileChange => {
                out.push((session, RmApdu::ProfileEnq.encode()?));
            }
            RmApdu::Profile(ids) => {
                info!("[RM] module profile: {:?}", ids);
                callbacks.module_profile(session, &ids);
                self.module_profile = ids;
                out.push((session, RmApdu::ProfileChange.encode()?));
            }
        }
        Ok(())
    }
}

/// Ask the module to re-read the host profile.
pub fn profile_changed(session: u16, out: &mut Outbox) -> Result<(), ResourceError> {
    out.push((session, RmApdu::ProfileChange.encode()?));
    Ok(())
}
