//! EN 50221 session layer.
//!
//! Sessions bind a resource on the host to a transport connection. The
//! module opens most of them with `open_session_request`; the host can open
//! its own with `create_session`. Session numbers are unique per layer and
//! freed when the session closes.

pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use ci_protocol::{decode_spdu, encode_spdu, ResourceId, SessionStatus, Spdu};
use log::{debug, info, warn};

use crate::error::{SessionError, TransportError};
use crate::transport::TransportLayer;

pub use registry::{Registration, ResourceKind, ResourceRegistry};

/// Where outgoing SPDUs go.
pub trait SpduSink {
    fn send_spdu(&mut self, slot: u8, tcid: u8, spdu: &[u8]) -> Result<(), TransportError>;
}

impl SpduSink for TransportLayer {
    fn send_spdu(&mut self, slot: u8, tcid: u8, spdu: &[u8]) -> Result<(), TransportError> {
        self.send(slot, tcid, spdu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Host sent `create_session`, waiting for the response.
    Creating,
    Active,
    /// Host sent `close_session_request`.
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub number: u16,
    pub resource: ResourceId,
    pub kind: ResourceKind,
    pub slot: u8,
    pub tcid: u8,
    pub state: SessionState,
}

/// Session changes for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        session: u16,
        slot: u8,
        kind: ResourceKind,
        resource: ResourceId,
    },
    /// APDU bytes received on an active session. May hold several APDUs.
    Apdu {
        session: u16,
        kind: ResourceKind,
        data: Bytes,
    },
    Closed { session: u16, kind: ResourceKind },
}

pub struct SessionLayer {
    registry: Arc<ResourceRegistry>,
    sessions: BTreeMap<u16, Session>,
    next_number: u16,
}

impl SessionLayer {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            registry,
            sessions: BTreeMap::new(),
            next_number: 1,
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn session(&self, number: u16) -> Option<&Session> {
        self.sessions.get(&number)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Active sessions bound to `kind`.
    pub fn active_of(&self, kind: ResourceKind) -> impl Iterator<Item = u16> + '_ {
        self.sessions
            .values()
            .filter(move |s| s.kind == kind && s.state == SessionState::Active)
            .map(|s| s.number)
    }

    fn allocate(&mut self) -> Option<u16> {
        let start = self.next_number;
        let mut candidate = start;
        loop {
            if candidate != 0 && !self.sessions.contains_key(&candidate) {
                self.next_number = candidate.wrapping_add(1);
                return Some(candidate);
            }
            candidate = candidate.wrapping_add(1);
            if candidate == start {
                return None;
            }
        }
    }

    fn send(
        sink: &mut dyn SpduSink,
        slot: u8,
        tcid: u8,
        spdu: &Spdu,
    ) -> Result<(), SessionError> {
        let frame = encode_spdu(spdu)?;
        sink.send_spdu(slot, tcid, &frame)?;
        Ok(())
    }

    /// Open a host-initiated session to a resource on the module.
    pub fn open_session(
        &mut self,
        sink: &mut dyn SpduSink,
        slot: u8,
        tcid: u8,
        resource: ResourceId,
    ) -> Result<u16, SessionError> {
        let registration = self
            .registry
            .lookup(resource)
            .map_err(|status| SessionError::NoResource(resource, status))?;
        let number = self.allocate().ok_or(SessionError::NoFreeSession)?;

        Self::send(sink, slot, tcid, &Spdu::CreateSession { resource, session: number })?;
        self.sessions.insert(
            number,
            Session {
                number,
                resource,
                kind: registration.kind,
                slot,
                tcid,
                state: SessionState::Creating,
            },
        );
        debug!("[Session] creating session {} for {}", number, resource);
        Ok(number)
    }

    /// Start closing a session. It is reported closed once the module answers.
    pub fn close_session(
        &mut self,
        sink: &mut dyn SpduSink,
        number: u16,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&number)
            .ok_or(SessionError::UnknownSession(number))?;
        let (slot, tcid) = (session.slot, session.tcid);
        session.state = SessionState::Closing;
        Self::send(sink, slot, tcid, &Spdu::CloseSessionRequest { session: number })
    }

    /// Send one or more encoded APDUs on an active session.
    pub fn send_apdu(
        &mut self,
        sink: &mut dyn SpduSink,
        number: u16,
        apdu: &[u8],
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(&number)
            .filter(|s| s.state == SessionState::Active)
            .ok_or(SessionError::UnknownSession(number))?;
        Self::send(
            sink,
            session.slot,
            session.tcid,
            &Spdu::SessionNumber {
                session: number,
                apdu: Bytes::copy_from_slice(apdu),
            },
        )
    }

    /// Process one SPDU from the module.
    pub fn handle_spdu(
        &mut self,
        sink: &mut dyn SpduSink,
        slot: u8,
        tcid: u8,
        spdu: &[u8],
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let mut events = Vec::new();
        match decode_spdu(spdu)? {
            Spdu::SessionNumber { session, apdu } => {
                let s = self
                    .sessions
                    .get(&session)
                    .filter(|s| s.state != SessionState::Creating)
                    .ok_or(SessionError::UnknownSession(session))?;
                events.push(SessionEvent::Apdu {
                    session,
                    kind: s.kind,
                    data: apdu,
                });
            }
            Spdu::OpenSessionRequest { resource } => {
                let found = self.registry.lookup(resource);
                let number = match found {
                    Ok(_) => self.allocate(),
                    Err(_) => None,
                };
                let status = match (found, number) {
                    (Err(status), _) => status,
                    (Ok(_), None) => SessionStatus::Busy,
                    (Ok(_), Some(_)) => SessionStatus::Ok,
                };
                let session = number.unwrap_or(0);
                Self::send(
                    sink,
                    slot,
                    tcid,
                    &Spdu::OpenSessionResponse {
                        status,
                        resource,
                        session,
                    },
                )?;
                match (found, number) {
                    (Ok(registration), Some(number)) => {
                        self.sessions.insert(
                            number,
                            Session {
                                number,
                                resource,
                                kind: registration.kind,
                                slot,
                                tcid,
                                state: SessionState::Active,
                            },
                        );
                        info!(
                            "[Session] slot {} opened session {} for {}",
                            slot, number, resource
                        );
                        events.push(SessionEvent::Opened {
                            session: number,
                            slot,
                            kind: registration.kind,
                            resource,
                        });
                    }
                    _ => warn!("[Session] refused {} with {:?}", resource, status),
                }
            }
            Spdu::CreateSessionResponse {
                status,
                resource,
                session,
            } => {
                let creating = self
                    .sessions
                    .get_mut(&session)
                    .filter(|s| s.state == SessionState::Creating)
                    .ok_or(SessionError::UnknownSession(session))?;
                if status == SessionStatus::Ok {
                    creating.state = SessionState::Active;
                    info!(
                        "[Session] slot {} created session {} for {}",
                        slot, session, resource
                    );
                    events.push(SessionEvent::Opened {
                        session,
                        slot,
                        kind: creating.kind,
                        resource: creating.resource,
                    });
                } else {
                    warn!("[Session] module refused {} with {:?}", resource, status);
                    self.sessions.remove(&session);
                }
            }
            Spdu::CloseSessionRequest { session } => {
                let removed = self.sessions.remove(&session);
                let status = if removed.is_some() {
                    SessionStatus::Ok
                } else {
                    SessionStatus::NotFound
                };
                Self::send(sink, slot, tcid, &Spdu::CloseSessionResponse { status, session })?;
                if let Some(s) = removed {
                    info!("[Session] module closed session {}", session);
                    events.push(SessionEvent::Closed {
                        session,
                        kind: s.kind,
                    });
                }
            }
            Spdu::CloseSessionResponse { status, session } => {
                if status != SessionStatus::Ok {
                    warn!("[Session] close of session {} answered {:?}", session, status);
                }
                if let Some(s) = self.sessions.remove(&session) {
                    events.push(SessionEvent::Closed {
                        session,
                        kind: s.kind,
                    });
                }
            }
            Spdu::OpenSessionResponse { .. } => {
                return Err(SessionError::Unexpected("open_session_response from module"));
            }
            Spdu::CreateSession { .. } => {
                return Err(SessionError::Unexpected("create_session from module"));
            }
        }
        Ok(events)
    }

    /// Drop every session riding on a closed transport connection.
    pub fn connection_closed(&mut self, slot: u8, tcid: u8) -> Vec<SessionEvent> {
        self.remove_where(|s| s.slot == slot && s.tcid == tcid)
    }

    /// Drop every session of a removed module.
    pub fn slot_removed(&mut self, slot: u8) -> Vec<SessionEvent> {
        self.remove_where(|s| s.slot == slot)
    }

    fn remove_where<F>(&mut self, pred: F) -> Vec<SessionEvent>
    where
        F: Fn(&Session) -> bool,
    {
        let gone: Vec<u16> = self
            .sessions
            .values()
            .filter(|s| pred(s))
            .map(|s| s.number)
            .collect();
        gone.into_iter()
            .filter_map(|number| self.sessions.remove(&number))
            .map(|s| {
                debug!("[Session] session {} dropped with its connection", s.number);
                SessionEvent::Closed {
                    session: s.number,
                    kind: s.kind,
                }
            })
            .collect()
    }
}
