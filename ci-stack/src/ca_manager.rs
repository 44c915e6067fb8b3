//! CA program tracking and CA_PMT scheduling.
//!
//! The host tracks the programs it wants descrambled together with the PMT
//! sections describing them and the elementary streams the user selected.
//! Whenever something the module should know about changes, the affected
//! CA_PMTs are queued; [`CaManager::drain`] turns the queue into `ca_pmt`
//! APDUs for every CA session whose module can handle the program.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use ci_protocol::{
    CaApdu, CaEnable, CaPmtBuilder, CaPmtCmd, CaPmtReply, ListManagement, PmtSection,
    DEFAULT_CA_PMT_CAPACITY,
};
use log::{debug, info, warn};

use crate::error::ResourceError;

#[derive(Debug, Clone)]
pub struct CaManagerConfig {
    /// Hoist single per-stream CA descriptors to program level.
    pub move_ca_descriptors: bool,
    /// Queue an update after every `ca_pmt_reply`.
    pub resend_on_reply: bool,
    /// Scratch capacity for one CA_PMT.
    pub capacity: usize,
}

impl Default for CaManagerConfig {
    fn default() -> Self {
        Self {
            move_ca_descriptors: false,
            resend_on_reply: true,
            capacity: DEFAULT_CA_PMT_CAPACITY,
        }
    }
}

/// How a PMT section relates to what was stored before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionUpdate {
    New,
    Changed,
    Unchanged,
}

/// A program the host wants descrambled.
#[derive(Debug, Clone)]
pub struct CaProgram {
    program_number: u16,
    /// Indexed by section number, sized `last_section_number + 1`.
    sections: Vec<Option<PmtSection>>,
    cmd: CaPmtCmd,
    /// The module answered a query for this program.
    answered: bool,
    streams: BTreeMap<u16, CaPmtCmd>,
    /// CA sessions that currently list this program.
    sent_to: BTreeSet<u16>,
}

impl CaProgram {
    fn new(program_number: u16) -> Self {
        Self {
            program_number,
            sections: Vec::new(),
            cmd: CaPmtCmd::Query,
            answered: false,
            streams: BTreeMap::new(),
            sent_to: BTreeSet::new(),
        }
    }

    pub fn program_number(&self) -> u16 {
        self.program_number
    }

    /// Program-level command state.
    pub fn cmd(&self) -> CaPmtCmd {
        self.cmd
    }

    /// Command state of a selected stream.
    pub fn stream_cmd(&self, pid: u16) -> Option<CaPmtCmd> {
        self.streams.get(&pid).copied()
    }

    pub fn selected_pids(&self) -> BTreeSet<u16> {
        self.streams.keys().copied().collect()
    }

    pub fn sections(&self) -> impl Iterator<Item = &PmtSection> {
        self.sections.iter().flatten()
    }

    /// True if a stored section lists `pid` as an elementary stream.
    pub fn has_stream(&self, pid: u16) -> bool {
        self.sections()
            .flat_map(|section| section.streams.iter())
            .any(|stream| stream.elementary_pid == pid)
    }

    /// Once the module has answered a query, later CA_PMTs ask it to
    /// descramble.
    fn send_cmd(&self) -> CaPmtCmd {
        if self.cmd == CaPmtCmd::OkDescrambling || self.answered {
            CaPmtCmd::OkDescrambling
        } else {
            CaPmtCmd::Query
        }
    }

    fn reset_grants(&mut self) {
        self.cmd = CaPmtCmd::Query;
        self.answered = false;
        for cmd in self.streams.values_mut() {
            *cmd = CaPmtCmd::Query;
        }
        self.sent_to.clear();
    }
}

/// True if any CA descriptor of the program names a system in `ids`.
pub fn program_has_ca_system_id(program: &CaProgram, ids: &[u16]) -> bool {
    program
        .sections()
        .flat_map(|section| section.ca_system_ids())
        .any(|id| ids.contains(&id))
}

#[derive(Debug, Default)]
struct CaSession {
    /// Empty until the module sends `ca_info`.
    ca_system_ids: Vec<u16>,
}

/// Per-slot CA bookkeeping.
#[derive(Debug, Default)]
pub struct CaManager {
    config: CaManagerConfig,
    sessions: BTreeMap<u16, CaSession>,
    programs: BTreeMap<u16, CaProgram>,
    resend_all: bool,
    pending: BTreeSet<u16>,
}

impl CaManager {
    pub fn new(config: CaManagerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn program(&self, program_number: u16) -> Option<&CaProgram> {
        self.programs.get(&program_number)
    }

    pub fn programs(&self) -> impl Iterator<Item = &CaProgram> {
        self.programs.values()
    }

    /// CA system ids the module announced on `session`.
    pub fn ca_system_ids(&self, session: u16) -> Option<&[u16]> {
        self.sessions
            .get(&session)
            .map(|s| s.ca_system_ids.as_slice())
    }

    pub fn has_pending(&self) -> bool {
        self.resend_all || !self.pending.is_empty()
    }

    pub fn add_session(&mut self, session: u16) {
        self.sessions.entry(session).or_default();
    }

    /// Forget a CA session. With no CA session left every grant is void.
    pub fn remove_session(&mut self, session: u16) {
        if self.sessions.remove(&session).is_none() {
            return;
        }
        for program in self.programs.values_mut() {
            program.sent_to.remove(&session);
        }
        if self.sessions.is_empty() {
            debug!("[CaManager] last CA session closed, dropping grants");
            for program in self.programs.values_mut() {
                program.reset_grants();
            }
            self.pending.clear();
            self.resend_all = false;
        }
    }

    /// Store the module's CA system ids and re-send everything.
    pub fn set_ca_info(&mut self, session: u16, ca_system_ids: Vec<u16>) {
        info!(
            "[CaManager] session {} supports CA systems {:04X?}",
            session, ca_system_ids
        );
        self.sessions.entry(session).or_default().ca_system_ids = ca_system_ids;
        self.resend_all = true;
    }

    /// Start tracking a program. Returns false if it was already tracked.
    pub fn track_program(&mut self, program_number: u16) -> bool {
        if self.programs.contains_key(&program_number) {
            return false;
        }
        self.programs
            .insert(program_number, CaProgram::new(program_number));
        true
    }

    /// Stop tracking a program and re-send the remaining list.
    pub fn untrack_program(&mut self, program_number: u16) -> bool {
        let Some(program) = self.programs.remove(&program_number) else {
            return false;
        };
        self.pending.remove(&program_number);
        if !program.sent_to.is_empty() {
            self.resend_all = true;
        }
        true
    }

    /// Store a PMT section, tracking its program if needed.
    ///
    /// A section differs from the stored one if its size or version does.
    /// Any difference, or a change in the section count, re-sends every
    /// CA_PMT.
    pub fn update_section(&mut self, section: PmtSection) -> SectionUpdate {
        let program = self
            .programs
            .entry(section.program_number)
            .or_insert_with(|| CaProgram::new(section.program_number));

        let slots = section.last_section_number.max(section.section_number) as usize + 1;
        let mut update = None;
        if program.sections.len() != slots {
            program.sections = vec![None; slots];
            update = Some(SectionUpdate::New);
        }

        let slot = &mut program.sections[section.section_number as usize];
        let update = update.unwrap_or(match slot {
            None => SectionUpdate::New,
            Some(old)
                if old.section_size != section.section_size
                    || old.version_number != section.version_number =>
            {
                SectionUpdate::Changed
            }
            Some(_) => SectionUpdate::Unchanged,
        });

        if update != SectionUpdate::Unchanged {
            debug!(
                "[CaManager] program {} section {} {:?} (version {})",
                section.program_number, section.section_number, update, section.version_number
            );
            *slot = Some(section);
            self.resend_all = true;
        }
        update
    }

    /// Select an elementary stream. Selecting twice is a no-op.
    pub fn select_stream(&mut self, program_number: u16, pid: u16) -> bool {
        let program = self
            .programs
            .entry(program_number)
            .or_insert_with(|| CaProgram::new(program_number));
        if program.streams.contains_key(&pid) {
            return false;
        }
        program.streams.insert(pid, CaPmtCmd::Query);
        self.pending.insert(program_number);
        true
    }

    /// Deselect an elementary stream. Deselecting an unselected stream is a
    /// no-op.
    pub fn deselect_stream(&mut self, program_number: u16, pid: u16) -> bool {
        let Some(program) = self.programs.get_mut(&program_number) else {
            return false;
        };
        if program.streams.remove(&pid).is_none() {
            return false;
        }
        self.pending.insert(program_number);
        true
    }

    /// Apply a `ca_pmt_reply`.
    ///
    /// A program-level grant promotes the program and all its selected
    /// streams; a per-stream grant promotes that stream only. Entries for
    /// streams the host has not selected, or that no stored section lists,
    /// are ignored.
    pub fn handle_reply(&mut self, session: u16, reply: &CaPmtReply) -> bool {
        let Some(program) = self.programs.get_mut(&reply.program_number) else {
            warn!(
                "[CaManager] session {} reply for untracked program {}",
                session, reply.program_number
            );
            return false;
        };
        program.answered = true;

        if reply.program_ok() {
            program.cmd = CaPmtCmd::OkDescrambling;
            for cmd in program.streams.values_mut() {
                *cmd = CaPmtCmd::OkDescrambling;
            }
        }
        for entry in &reply.streams {
            let granted = CaEnable::from_byte(entry.ca_enable) == Some(CaEnable::Possible);
            if !program.has_stream(entry.pid) {
                debug!(
                    "[CaManager] reply names PID 0x{:04X} missing from the PMT",
                    entry.pid
                );
                continue;
            }
            match program.streams.get_mut(&entry.pid) {
                Some(cmd) if granted => *cmd = CaPmtCmd::OkDescrambling,
                Some(_) => {}
                None => debug!(
                    "[CaManager] reply names unselected PID 0x{:04X}",
                    entry.pid
                ),
            }
        }
        info!(
            "[CaManager] program {} reply: ca_enable 0x{:02X}, state {:?}",
            reply.program_number, reply.ca_enable, program.cmd
        );

        if self.config.resend_on_reply {
            self.pending.insert(reply.program_number);
        }
        true
    }

    /// Build every queued CA_PMT as `(session, ca_pmt APDU)` pairs.
    ///
    /// A program is only sent to sessions whose module announced one of its
    /// CA systems. A failed build is logged and that CA_PMT skipped.
    pub fn drain(&mut self) -> Vec<(u16, Bytes)> {
        if !self.has_pending() {
            return Vec::new();
        }
        let full = std::mem::take(&mut self.resend_all);
        let pending = std::mem::take(&mut self.pending);
        let Self {
            config,
            sessions,
            programs,
            ..
        } = self;

        let mut out = Vec::new();
        for (&session, state) in sessions.iter() {
            if state.ca_system_ids.is_empty() {
                continue;
            }
            let ids = state.ca_system_ids.as_slice();
            let listed_before = programs.values().any(|p| p.sent_to.contains(&session));

            let mut batch: Vec<(&mut CaProgram, Option<ListManagement>)> = Vec::new();
            for program in programs.values_mut() {
                let wanted = full || pending.contains(&program.program_number);
                if !wanted {
                    continue;
                }
                if !program_has_ca_system_id(program, ids) {
                    program.sent_to.remove(&session);
                    continue;
                }
                let mode = if full {
                    None
                } else if program.sent_to.contains(&session) {
                    Some(ListManagement::Update)
                } else if listed_before {
                    Some(ListManagement::Add)
                } else {
                    Some(ListManagement::Only)
                };
                batch.push((program, mode));
            }

            let count: usize = batch.iter().map(|(p, _)| p.sections().count()).sum();
            let mut index = 0;
            for (program, mode) in batch {
                let cmd = program.send_cmd();
                let pids = program.selected_pids();
                let mut sent = false;
                for section in program.sections.iter().flatten() {
                    let list_management = mode.unwrap_or_else(|| position(index, count));
                    index += 1;
                    let built = CaPmtBuilder::new(list_management, cmd)
                        .move_ca_descriptors(config.move_ca_descriptors)
                        .ca_system_ids(ids)
                        .selected_pids(&pids)
                        .build(section, config.capacity);
                    let apdu = built.map_err(ResourceError::from).and_then(|payload| {
                        CaApdu::CaPmt(payload).encode().map_err(ResourceError::from)
                    });
                    match apdu {
                        Ok(apdu) => {
                            debug!(
                                "[CaManager] session {} ca_pmt program {} {:?} {:?}",
                                session, program.program_number, list_management, cmd
                            );
                            out.push((session, apdu));
                            sent = true;
                        }
                        Err(e) => warn!(
                            "[CaManager] program {} CA_PMT not sent: {}",
                            program.program_number, e
                        ),
                    }
                }
                if sent {
                    program.sent_to.insert(session);
                }
            }
        }
        out
    }

    /// Drop sessions and grants after the module was removed. Tracked
    /// programs stay for the next module.
    pub fn clear(&mut self) {
        self.sessions.clear();
        for program in self.programs.values_mut() {
            program.reset_grants();
        }
        self.pending.clear();
        self.resend_all = false;
    }
}

fn position(index: usize, count: usize) -> ListManagement {
    match (index, count) {
        (_, 1) => ListManagement::Only,
        (0, _) => ListManagement::First,
        (i, n) if i + 1 == n => ListManagement::Last,
        _ => ListManagement::More,
    }
}
