//! EN 50221 transport layer.
//!
//! The host is master on the link: every command TPDU it writes is answered
//! by exactly one module reply. A connection therefore has at most one
//! request in flight. When the host has nothing to say it polls with an
//! empty `T_data_last`, and when the module flags data available the host
//! fetches it with `T_RCV`.

mod link;

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use ci_protocol::{
    decode_module_reply, encode_tpdu, fragment_lpdu, LinkReassembler, ModuleReply, Tpdu,
    DEFAULT_LINK_BUFFER_SIZE, MIN_LINK_BUFFER_SIZE,
};
use log::{debug, info, warn};

use crate::error::TransportError;

pub use link::{CamState, SlotLink};

#[cfg(unix)]
pub use link::DeviceLink;

#[cfg(test)]
pub use link::{LoopbackControl, LoopbackLink};

/// `T_t_c_error` code: no transport connection available.
pub const TC_ERROR_NO_CONNECTION: u8 = 0x01;

/// Upper bound for one reassembled TPDU.
const MAX_TPDU_SIZE: usize = 0x10000;

/// Transport layer tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub link_buffer_size: usize,
    /// Idle time after which an empty `T_data_last` is sent.
    pub poll_interval: Duration,
    /// How long to wait for a module reply.
    pub response_timeout: Duration,
    /// Consecutive unanswered requests before a connection is dropped.
    pub max_poll_failures: u32,
    /// Largest SPDU chunk carried by one data TPDU.
    pub max_tpdu_data: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            link_buffer_size: DEFAULT_LINK_BUFFER_SIZE,
            poll_interval: Duration::from_millis(100),
            response_timeout: Duration::from_millis(300),
            max_poll_failures: 10,
            max_tpdu_data: 4096,
        }
    }
}

/// Lifecycle of a transport connection. Closed connections are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `T_create_t_c` sent, waiting for the reply.
    Establishing,
    Open,
    /// `T_delete_t_c` sent.
    Deleting,
}

/// Something the layers above need to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    SlotReady { slot: u8 },
    /// The module left; all its connections are gone.
    SlotRemoved { slot: u8 },
    Connected { slot: u8, tcid: u8 },
    /// A complete SPDU arrived.
    Data { slot: u8, tcid: u8, spdu: Bytes },
    Disconnected { slot: u8, tcid: u8 },
}

#[derive(Debug)]
struct Connection {
    state: ConnectionState,
    queue: VecDeque<Tpdu>,
    /// Request awaiting its reply and when it was written.
    in_flight: Option<(Tpdu, Instant)>,
    last_activity: Instant,
    data_available: bool,
    failures: u32,
    rx: BytesMut,
}

impl Connection {
    fn new(state: ConnectionState, now: Instant) -> Self {
        Self {
            state,
            queue: VecDeque::new(),
            in_flight: None,
            last_activity: now,
            data_available: false,
            failures: 0,
            rx: BytesMut::new(),
        }
    }
}

struct Slot {
    index: u8,
    link: Box<dyn SlotLink>,
    cam: CamState,
    reassembler: LinkReassembler,
    connections: BTreeMap<u8, Connection>,
    errors: u64,
}

impl Slot {
    fn buffer_size(&self, config: &TransportConfig) -> usize {
        config
            .link_buffer_size
            .min(self.link.buffer_size())
            .max(MIN_LINK_BUFFER_SIZE)
    }

    fn free_tcid(&self) -> Option<u8> {
        (1..=u8::MAX).find(|tcid| !self.connections.contains_key(tcid))
    }

    fn write_tpdu(
        &mut self,
        config: &TransportConfig,
        tcid: u8,
        tpdu: &Tpdu,
    ) -> Result<(), TransportError> {
        let frame = encode_tpdu(tcid, tpdu)?;
        let buffer_size = self.buffer_size(config);
        for lpdu in fragment_lpdu(tcid, &frame, buffer_size) {
            self.link
                .write_lpdu(&lpdu)
                .map_err(|source| TransportError::Io {
                    slot: self.index,
                    source,
                })?;
        }
        Ok(())
    }

    /// Drop every connection, reporting the ones the upper layers knew about.
    fn teardown(&mut self, events: &mut Vec<TransportEvent>) {
        for (tcid, conn) in std::mem::take(&mut self.connections) {
            if conn.state != ConnectionState::Establishing {
                events.push(TransportEvent::Disconnected {
                    slot: self.index,
                    tcid,
                });
            }
        }
        self.reassembler.clear();
    }
}

/// Transport connections over one or more CI slots.
pub struct TransportLayer {
    config: TransportConfig,
    slots: Vec<Slot>,
    last_error: Option<TransportError>,
}

impl TransportLayer {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            last_error: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Attach a slot and return its index.
    pub fn add_slot(&mut self, link: Box<dyn SlotLink>) -> u8 {
        let index = self.slots.len() as u8;
        self.slots.push(Slot {
            index,
            link,
            cam: CamState::Absent,
            reassembler: LinkReassembler::new(MAX_TPDU_SIZE),
            connections: BTreeMap::new(),
            errors: 0,
        });
        index
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn cam_state(&self, slot: u8) -> Option<CamState> {
        self.slots.get(slot as usize).map(|s| s.cam)
    }

    pub fn connection_state(&self, slot: u8, tcid: u8) -> Option<ConnectionState> {
        self.slots
            .get(slot as usize)?
            .connections
            .get(&tcid)
            .map(|c| c.state)
    }

    /// The most recent error. It stays set until taken.
    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub fn take_last_error(&mut self) -> Option<TransportError> {
        self.last_error.take()
    }

    /// Errors recorded against `slot` since it was added.
    pub fn error_count(&self, slot: u8) -> Option<u64> {
        self.slots.get(slot as usize).map(|s| s.errors)
    }

    fn record(&mut self, err: TransportError) {
        warn!("[Transport] {}", err);
        self.last_error = Some(err);
    }

    fn record_slot(&mut self, slot: usize, err: TransportError) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.errors += 1;
        }
        self.record(err);
    }

    fn slot_mut(&mut self, slot: u8) -> Result<&mut Slot, TransportError> {
        self.slots
            .get_mut(slot as usize)
            .ok_or(TransportError::UnknownSlot(slot))
    }

    /// Open a new host-initiated connection on `slot`.
    pub fn create_connection(&mut self, slot: u8, now: Instant) -> Result<u8, TransportError> {
        let s = self.slot_mut(slot)?;
        let tcid = s.free_tcid().ok_or(TransportError::NoFreeConnection(slot))?;
        let mut conn = Connection::new(ConnectionState::Establishing, now);
        conn.queue.push_back(Tpdu::CreateTc);
        s.connections.insert(tcid, conn);
        debug!("[Transport] slot {} creating connection {}", slot, tcid);
        Ok(tcid)
    }

    /// Ask the module to close a connection.
    pub fn delete_connection(&mut self, slot: u8, tcid: u8) -> Result<(), TransportError> {
        let conn = self
            .slot_mut(slot)?
            .connections
            .get_mut(&tcid)
            .ok_or(TransportError::UnknownConnection { slot, tcid })?;
        conn.state = ConnectionState::Deleting;
        conn.queue.clear();
        conn.queue.push_back(Tpdu::DeleteTc);
        Ok(())
    }

    /// Queue an SPDU for the module, split over data TPDUs as needed.
    pub fn send(&mut self, slot: u8, tcid: u8, spdu: &[u8]) -> Result<(), TransportError> {
        let max = self.config.max_tpdu_data.max(1);
        let conn = self
            .slot_mut(slot)?
            .connections
            .get_mut(&tcid)
            .ok_or(TransportError::UnknownConnection { slot, tcid })?;
        if conn.state != ConnectionState::Open {
            return Err(TransportError::NotOpen { slot, tcid });
        }

        let mut chunks = spdu.chunks(max).peekable();
        while let Some(chunk) = chunks.next() {
            let data = Bytes::copy_from_slice(chunk);
            conn.queue.push_back(if chunks.peek().is_some() {
                Tpdu::DataMore(data)
            } else {
                Tpdu::DataLast(data)
            });
        }
        Ok(())
    }

    /// Block until a slot has data or `timeout` elapses.
    ///
    /// With no module ready the whole timeout is slept, so callers polling
    /// for insertion do not spin.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let n = self.slots.len().max(1) as u32;
        let share = timeout / n;
        let mut ready = false;
        let mut waited = false;
        let mut failed = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.cam != CamState::Ready {
                continue;
            }
            waited = true;
            match slot.link.wait_readable(share) {
                Ok(r) => ready |= r,
                Err(source) => failed.push((
                    i,
                    TransportError::Io {
                        slot: slot.index,
                        source,
                    },
                )),
            }
        }
        for (i, err) in failed {
            self.record_slot(i, err);
        }
        if !waited {
            std::thread::sleep(timeout);
        }
        ready
    }

    /// Run one round over every slot: detect insertion and removal, read
    /// pending replies, expire timeouts and write the next request.
    pub fn poll(&mut self, now: Instant) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let mut errors = Vec::new();
        for i in 0..self.slots.len() {
            let mut slot_errors = Vec::new();
            self.poll_slot(i, now, &mut events, &mut slot_errors);
            errors.extend(slot_errors.into_iter().map(|err| (i, err)));
        }
        for (i, err) in errors {
            self.record_slot(i, err);
        }
        events
    }

    /// Write pending requests without reading, so freshly queued data goes
    /// out before the next wait.
    pub fn flush(&mut self, now: Instant) {
        let config = self.config.clone();
        let mut errors = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.cam != CamState::Ready {
                continue;
            }
            if let Err(err) = service(slot, &config, now) {
                errors.push((i, err));
            }
        }
        for (i, err) in errors {
            self.record_slot(i, err);
        }
    }

    fn poll_slot(
        &mut self,
        i: usize,
        now: Instant,
        events: &mut Vec<TransportEvent>,
        errors: &mut Vec<TransportError>,
    ) {
        let config = self.config.clone();
        let slot = &mut self.slots[i];
        let index = slot.index;

        let cam = match slot.link.cam_state() {
            Ok(cam) => cam,
            Err(source) => {
                errors.push(TransportError::Io { slot: index, source });
                return;
            }
        };
        if cam != slot.cam {
            let was = std::mem::replace(&mut slot.cam, cam);
            if was == CamState::Ready {
                info!("[Transport] module removed from slot {}", index);
                slot.teardown(events);
                events.push(TransportEvent::SlotRemoved { slot: index });
            }
            if cam == CamState::Ready {
                info!("[Transport] module ready in slot {}", index);
                slot.reassembler.clear();
                events.push(TransportEvent::SlotReady { slot: index });
                let mut conn = Connection::new(ConnectionState::Establishing, now);
                conn.queue.push_back(Tpdu::CreateTc);
                slot.connections.insert(1, conn);
            }
        }
        if slot.cam != CamState::Ready {
            return;
        }

        loop {
            let lpdu = match slot.link.read_lpdu() {
                Ok(Some(lpdu)) => lpdu,
                Ok(None) => break,
                Err(source) => {
                    errors.push(TransportError::Io { slot: index, source });
                    break;
                }
            };
            let reply = match slot.reassembler.push(&lpdu) {
                Ok(Some((_, tpdu))) => decode_module_reply(&tpdu),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            let handled = reply
                .map_err(TransportError::from)
                .and_then(|reply| handle_reply(slot, &config, reply, now, events));
            if let Err(err) = handled {
                errors.push(err);
            }
        }

        expire(slot, &config, now, events);
        if let Err(err) = service(slot, &config, now) {
            errors.push(err);
        }
    }
}

fn handle_reply(
    slot: &mut Slot,
    config: &TransportConfig,
    reply: ModuleReply,
    now: Instant,
    events: &mut Vec<TransportEvent>,
) -> Result<(), TransportError> {
    let index = slot.index;
    let tcid = reply.tcid;
    let Some(conn) = slot.connections.get_mut(&tcid) else {
        warn!("[Transport] slot {} reply for unknown connection {}", index, tcid);
        return Ok(());
    };
    conn.in_flight = None;
    conn.failures = 0;
    conn.last_activity = now;
    conn.data_available = reply.data_available;

    match reply.tpdu {
        None => {}
        Some(Tpdu::CreateTcReply) => {
            if conn.state == ConnectionState::Establishing {
                conn.state = ConnectionState::Open;
                info!("[Transport] slot {} connection {} open", index, tcid);
                events.push(TransportEvent::Connected { slot: index, tcid });
            }
        }
        Some(Tpdu::DataMore(data)) => conn.rx.extend_from_slice(&data),
        Some(Tpdu::DataLast(data)) => {
            conn.rx.extend_from_slice(&data);
            if !conn.rx.is_empty() {
                events.push(TransportEvent::Data {
                    slot: index,
                    tcid,
                    spdu: conn.rx.split().freeze(),
                });
            }
        }
        Some(Tpdu::RequestTc) => {
            let new_tcid = slot.free_tcid();
            let Some(conn) = slot.connections.get_mut(&tcid) else {
                return Ok(());
            };
            match new_tcid {
                Some(new_tcid) => {
                    conn.queue.push_back(Tpdu::NewTc { new_tcid });
                    let mut created = Connection::new(ConnectionState::Establishing, now);
                    created.queue.push_back(Tpdu::CreateTc);
                    slot.connections.insert(new_tcid, created);
                    debug!("[Transport] slot {} module requested connection {}", index, new_tcid);
                }
                None => conn.queue.push_back(Tpdu::TcError {
                    code: TC_ERROR_NO_CONNECTION,
                }),
            }
        }
        Some(Tpdu::DeleteTc) => {
            slot.connections.remove(&tcid);
            slot.reassembler.reset(tcid);
            info!("[Transport] slot {} module closed connection {}", index, tcid);
            events.push(TransportEvent::Disconnected { slot: index, tcid });
            slot.write_tpdu(config, tcid, &Tpdu::DeleteTcReply)?;
        }
        Some(Tpdu::DeleteTcReply) => {
            slot.connections.remove(&tcid);
            slot.reassembler.reset(tcid);
            info!("[Transport] slot {} connection {} closed", index, tcid);
            events.push(TransportEvent::Disconnected { slot: index, tcid });
        }
        Some(Tpdu::TcError { code }) => {
            warn!("[Transport] slot {} connection {} error 0x{:02X}", index, tcid, code);
        }
        Some(other) => {
            warn!(
                "[Transport] slot {} unexpected TPDU 0x{:02X} on connection {}",
                index,
                other.tag(),
                tcid
            );
        }
    }
    Ok(())
}

/// Count unanswered requests and drop connections that stay silent.
fn expire(
    slot: &mut Slot,
    config: &TransportConfig,
    now: Instant,
    events: &mut Vec<TransportEvent>,
) {
    let index = slot.index;
    let mut dead = Vec::new();
    for (&tcid, conn) in slot.connections.iter_mut() {
        let Some((tpdu, sent)) = conn.in_flight.take() else {
            continue;
        };
        if now.duration_since(sent) < config.response_timeout {
            conn.in_flight = Some((tpdu, sent));
            continue;
        }
        conn.failures += 1;
        debug!(
            "[Transport] slot {} connection {} timeout ({}/{})",
            index, tcid, conn.failures, config.max_poll_failures
        );
        if conn.failures >= config.max_poll_failures {
            dead.push((tcid, conn.failures));
        } else if !matches!(tpdu, Tpdu::Rcv) && !is_poll(&tpdu) {
            conn.queue.push_front(tpdu);
        }
    }

    for (tcid, failures) in dead {
        if let Some(conn) = slot.connections.remove(&tcid) {
            warn!(
                "[Transport] {}",
                TransportError::Timeout { slot: index, tcid, failures }
            );
            slot.reassembler.reset(tcid);
            if conn.state != ConnectionState::Establishing {
                events.push(TransportEvent::Disconnected { slot: index, tcid });
            }
        }
    }
    if slot.connections.is_empty() && slot.cam == CamState::Ready {
        // Nothing left to talk to: reset and let the next round re-detect it.
        if let Err(e) = slot.link.reset() {
            warn!("[Transport] slot {} reset failed: {}", index, e);
        }
        slot.cam = CamState::Absent;
        events.push(TransportEvent::SlotRemoved { slot: index });
    }
}

fn is_poll(tpdu: &Tpdu) -> bool {
    matches!(tpdu, Tpdu::DataLast(data) if data.is_empty())
}

/// Write the next request on every idle connection.
fn service(slot: &mut Slot, config: &TransportConfig, now: Instant) -> Result<(), TransportError> {
    let tcids: Vec<u8> = slot.connections.keys().copied().collect();
    for tcid in tcids {
        let Some(conn) = slot.connections.get_mut(&tcid) else {
            continue;
        };
        if conn.in_flight.is_some() {
            continue;
        }
        let next = if let Some(tpdu) = conn.queue.pop_front() {
            tpdu
        } else if conn.state != ConnectionState::Open {
            continue;
        } else if conn.data_available {
            Tpdu::Rcv
        } else if now.duration_since(conn.last_activity) >= config.poll_interval {
            Tpdu::DataLast(Bytes::new())
        } else {
            continue;
        };

        // T_new_t_c is not answered.
        let answered = !matches!(next, Tpdu::NewTc { .. });
        conn.last_activity = now;
        if answered {
            conn.in_flight = Some((next.clone(), now));
        }
        slot.write_tpdu(config, tcid, &next)?;
    }
    Ok(())
}
