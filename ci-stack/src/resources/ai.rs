//! Application Information.

use ci_protocol::{AiApdu, ApplicationInfo};
use log::{info, warn};

use super::{HostCallbacks, Outbox};
use crate::error::ResourceError;

#[derive(Debug, Default)]
pub struct AiState {
    info: Option<ApplicationInfo>,
}

impl AiState {
    /// Last `application_info` the module sent.
    pub fn info(&self) -> Option<&ApplicationInfo> {
        self.info.as_ref()
    }

    pub fn on_open(&mut self, session: u16, out: &mut Outbox) -> Result<(), ResourceError> {
        out.push((session, AiApdu::ApplicationInfoEnq.encode()?));
        Ok(())
    }

    pub fn handle(
        &mut self,
        session: u16,
        apdu: AiApdu,
        callbacks: &mut dyn HostCallbacks,
    ) -> Result<(), ResourceError> {
        match apdu {
            AiApdu::ApplicationInfo(info) => {
                info!(
                    "[AI] {:?} application \"{}\" (manufacturer 0x{:04X}, code 0x{:04X})",
                    info.application_type,
                    info.menu_string,
                    info.manufacturer,
                    info.manufacturer_code
                );
                callbacks.application_info(session, &info);
                self.info = Some(info);
            }
            other => warn!("[AI] session {} unexpected {:?}", session, other),
        }
        Ok(())
    }
}

/// Ask the module to open its top-level menu.
pub fn enter_menu(session: u16, out: &mut Outbox) -> Result<(), ResourceError> {
    out.push((session, AiApdu::EnterMenu.encode()?));
    Ok(())
}
