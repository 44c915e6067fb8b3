//! Date-Time resource.

use std::time::{Duration, Instant};

use ci_protocol::DateTimeApdu;
use log::debug;

use super::{HostCallbacks, Outbox};
use crate::error::ResourceError;

#[derive(Debug, Default)]
pub struct DateTimeState {
    interval: Duration,
    next_due: Option<Instant>,
}

impl DateTimeState {
    /// When the next unsolicited `date_time` is due.
    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn handle(
        &mut self,
        session: u16,
        apdu: DateTimeApdu,
        local_offset_minutes: Option<i16>,
        now: Instant,
        callbacks: &mut dyn HostCallbacks,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        match apdu {
            DateTimeApdu::Enq { response_interval } => {
                callbacks.date_time_enquiry(session, response_interval);
                self.interval = Duration::from_secs(response_interval as u64);
                send(session, local_offset_minutes, out)?;
                self.next_due = (response_interval > 0).then(|| now + self.interval);
            }
            DateTimeApdu::DateTime { .. } => {
                debug!("[DateTime] session {} ignoring date_time from module", session)
            }
        }
        Ok(())
    }

    /// Send the time again if the interval elapsed.
    pub fn poll(
        &mut self,
        session: u16,
        local_offset_minutes: Option<i16>,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        match self.next_due {
            Some(due) if now >= due => {
                send(session, local_offset_minutes, out)?;
                self.next_due = Some(now + self.interval);
            }
            _ => {}
        }
        Ok(())
    }
}

fn send(
    session: u16,
    local_offset_minutes: Option<i16>,
    out: &mut Outbox,
) -> Result<(), ResourceError> {
    let apdu = DateTimeApdu::DateTime {
        unix_seconds: chrono::Utc::now().timestamp(),
        local_offset_minutes,
    };
    out.push((session, apdu.encode()?));
    Ok(())
}
