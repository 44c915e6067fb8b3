//! Host-side application resources.
//!
//! Each open session gets a state object chosen by the resource it is bound
//! to. APDUs arriving on a session are decoded and handed to that state;
//! anything the host wants to send goes into an [`Outbox`] of
//! `(session, APDU)` pairs that the caller pushes through the session layer.

pub mod ai;
pub mod ca;
pub mod datetime;
pub mod mmi;
pub mod rm;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use ci_protocol::{
    decode_apdu, AiApdu, ApplicationInfo, CaApdu, CaPmtReply, CloseMmi, DateTimeApdu,
    MmiAnswer, MmiApdu, MmiMenu, PmtSection, ResourceId, RmApdu,
};
use log::{debug, info, warn};

use crate::ca_manager::{CaManager, CaManagerConfig, SectionUpdate};
use crate::error::ResourceError;
use crate::session::{ResourceKind, ResourceRegistry, SessionEvent};

use self::ai::AiState;
use self::datetime::DateTimeState;
use self::mmi::MmiState;
use self::rm::RmState;

/// APDUs waiting to be sent, tagged with their session.
pub type Outbox = Vec<(u16, Bytes)>;

/// Notifications for the embedding application. All methods default to
/// doing nothing.
#[allow(unused_variables)]
pub trait HostCallbacks: Send {
    /// The module asked for the host's resource list.
    fn profile_enquiry(&mut self, session: u16) {}
    fn module_profile(&mut self, session: u16, resources: &[ResourceId]) {}
    fn application_info(&mut self, session: u16, info: &ApplicationInfo) {}
    fn ca_info(&mut self, session: u16, ca_system_ids: &[u16]) {}
    fn ca_pmt_reply(&mut self, session: u16, reply: &CaPmtReply) {}
    fn mmi_close(&mut self, session: u16, close: CloseMmi) {}
    fn mmi_display_control(&mut self, session: u16, cmd: u8, mode: Option<u8>) {}
    fn mmi_text(&mut self, session: u16, text: &str) {}
    fn mmi_enquiry(&mut self, session: u16, blind: bool, answer_length: u8, text: &str) {}
    fn mmi_menu(&mut self, session: u16, menu: &MmiMenu) {}
    fn mmi_list(&mut self, session: u16, list: &MmiMenu) {}
    fn date_time_enquiry(&mut self, session: u16, response_interval: u8) {}
}

/// Callbacks that only log.
#[derive(Debug, Default)]
pub struct LogCallbacks;

impl HostCallbacks for LogCallbacks {
    fn mmi_enquiry(&mut self, session: u16, blind: bool, answer_length: u8, text: &str) {
        info!(
            "[MMI] session {} enquiry \"{}\" ({} chars{})",
            session,
            text,
            answer_length,
            if blind { ", blind" } else { "" }
        );
    }

    fn mmi_menu(&mut self, session: u16, menu: &MmiMenu) {
        info!(
            "[MMI] session {} menu \"{}\" / \"{}\"",
            session, menu.title, menu.subtitle
        );
        for (i, item) in menu.items.iter().enumerate() {
            info!("[MMI]   {}: {}", i + 1, item);
        }
        info!("[MMI]   {}", menu.bottom);
    }

    fn mmi_list(&mut self, session: u16, list: &MmiMenu) {
        self.mmi_menu(session, list);
    }

    fn mmi_text(&mut self, session: u16, text: &str) {
        info!("[MMI] session {} text \"{}\"", session, text);
    }
}

#[derive(Debug)]
enum ResourceState {
    ResourceManager(RmState),
    ApplicationInfo(AiState),
    ConditionalAccess,
    DateTime(DateTimeState),
    Mmi(MmiState),
}

#[derive(Debug, Clone, Default)]
pub struct ApplicationConfig {
    /// Local time offset sent with `date_time`, none to send UTC only.
    pub local_offset_minutes: Option<i16>,
    pub ca: CaManagerConfig,
}

/// Resource states of one slot.
pub struct Application {
    registry: Arc<ResourceRegistry>,
    config: ApplicationConfig,
    states: BTreeMap<u16, ResourceState>,
    ca: CaManager,
    callbacks: Box<dyn HostCallbacks>,
}

impl Application {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        config: ApplicationConfig,
        callbacks: Box<dyn HostCallbacks>,
    ) -> Self {
        let ca = CaManager::new(config.ca.clone());
        Self {
            registry,
            config,
            states: BTreeMap::new(),
            ca,
            callbacks,
        }
    }

    pub fn ca(&self) -> &CaManager {
        &self.ca
    }

    pub fn ca_mut(&mut self) -> &mut CaManager {
        &mut self.ca
    }

    /// `application_info` of the first AI session that received one.
    pub fn application_info(&self) -> Option<&ApplicationInfo> {
        self.states.values().find_map(|state| match state {
            ResourceState::ApplicationInfo(ai) => ai.info(),
            _ => None,
        })
    }

    /// Apply one session event.
    pub fn on_event(
        &mut self,
        event: SessionEvent,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        match event {
            SessionEvent::Opened { session, kind, .. } => self.open(session, kind, out),
            SessionEvent::Apdu { session, data, .. } => self.dispatch(session, &data, now, out),
            SessionEvent::Closed { session, kind } => {
                self.states.remove(&session);
                if kind == ResourceKind::ConditionalAccess {
                    self.ca.remove_session(session);
                }
                debug!("[App] session {} ({:?}) closed", session, kind);
                Ok(())
            }
        }
    }

    fn open(
        &mut self,
        session: u16,
        kind: ResourceKind,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        let state = match kind {
            ResourceKind::ResourceManager => {
                let mut rm = RmState::default();
                rm.on_open(session, out)?;
                ResourceState::ResourceManager(rm)
            }
            ResourceKind::ApplicationInfo => {
                let mut ai = AiState::default();
                ai.on_open(session, out)?;
                ResourceState::ApplicationInfo(ai)
            }
            ResourceKind::ConditionalAccess => {
                ca::on_open(session, &mut self.ca, out)?;
                ResourceState::ConditionalAccess
            }
            ResourceKind::DateTime => ResourceState::DateTime(DateTimeState::default()),
            ResourceKind::Mmi => ResourceState::Mmi(MmiState::default()),
        };
        self.states.insert(session, state);
        Ok(())
    }

    fn dispatch(
        &mut self,
        session: u16,
        mut data: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        let state = self
            .states
            .get_mut(&session)
            .ok_or(ResourceError::UnknownSession(session))?;
        let callbacks = self.callbacks.as_mut();

        while !data.is_empty() {
            let (tag, body, rest) = decode_apdu(data)?;
            data = rest;
            match state {
                ResourceState::ResourceManager(rm) => rm.handle(
                    session,
                    RmApdu::decode(tag, body)?,
                    &self.registry,
                    callbacks,
                    out,
                )?,
                ResourceState::ApplicationInfo(ai) => {
                    ai.handle(session, AiApdu::decode(tag, body)?, callbacks)?
                }
                ResourceState::ConditionalAccess => {
                    ca::handle(session, CaApdu::decode(tag, body)?, &mut self.ca, callbacks)?
                }
                ResourceState::DateTime(dt) => dt.handle(
                    session,
                    DateTimeApdu::decode(tag, body)?,
                    self.config.local_offset_minutes,
                    now,
                    callbacks,
                    out,
                )?,
                ResourceState::Mmi(mmi) => {
                    mmi.handle(session, MmiApdu::decode(tag, body)?, callbacks, out)?
                }
            }
        }
        Ok(())
    }

    /// Periodic work: scheduled `date_time` sends and queued CA_PMTs.
    pub fn poll(&mut self, now: Instant, out: &mut Outbox) {
        for (&session, state) in self.states.iter_mut() {
            if let ResourceState::DateTime(dt) = state {
                if let Err(e) = dt.poll(session, self.config.local_offset_minutes, now, out) {
                    warn!("[App] session {} date_time not sent: {}", session, e);
                }
            }
        }
        out.extend(self.ca.drain());
    }

    /// Earliest time [`Application::poll`] has scheduled work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.states
            .values()
            .filter_map(|state| match state {
                ResourceState::DateTime(dt) => dt.next_due(),
                _ => None,
            })
            .min()
    }

    /// Store a PMT section for CA.
    pub fn update_pmt(&mut self, section: PmtSection) -> SectionUpdate {
        self.ca.update_section(section)
    }

    fn first_session(&self, wanted: fn(&ResourceState) -> bool) -> Option<u16> {
        self.states
            .iter()
            .find(|(_, state)| wanted(state))
            .map(|(&session, _)| session)
    }

    /// Ask the module to open its menu.
    pub fn enter_menu(&mut self, out: &mut Outbox) -> Result<(), ResourceError> {
        let session = self
            .first_session(|s| matches!(s, ResourceState::ApplicationInfo(_)))
            .ok_or(ResourceError::WrongState {
                session: 0,
                expected: "an application info session",
            })?;
        ai::enter_menu(session, out)
    }

    /// Tell the module the host's resource list changed.
    pub fn profile_changed(&mut self, out: &mut Outbox) -> Result<(), ResourceError> {
        let session = self
            .first_session(|s| matches!(s, ResourceState::ResourceManager(_)))
            .ok_or(ResourceError::WrongState {
                session: 0,
                expected: "a resource manager session",
            })?;
        rm::profile_changed(session, out)
    }

    fn mmi(&mut self, session: Option<u16>) -> Result<(u16, &mut MmiState), ResourceError> {
        let session = match session {
            Some(session) => session,
            None => self
                .first_session(|s| matches!(s, ResourceState::Mmi(_)))
                .ok_or(ResourceError::WrongState {
                    session: 0,
                    expected: "an MMI session",
                })?,
        };
        match self.states.get_mut(&session) {
            Some(ResourceState::Mmi(mmi)) => Ok((session, mmi)),
            _ => Err(ResourceError::UnknownSession(session)),
        }
    }

    /// Answer an enquiry on `session`, or on the first MMI session.
    pub fn mmi_answer(
        &mut self,
        session: Option<u16>,
        answer: MmiAnswer,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        let (session, mmi) = self.mmi(session)?;
        mmi.answer(session, answer, out)
    }

    pub fn mmi_menu_answer(
        &mut self,
        session: Option<u16>,
        choice: u8,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        let (session, mmi) = self.mmi(session)?;
        mmi.menu_answer(session, choice, out)
    }

    pub fn mmi_close(
        &mut self,
        session: Option<u16>,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        let (session, mmi) = self.mmi(session)?;
        mmi.close(session, out)
    }

    /// Drop every session state, e.g. after the module left.
    pub fn reset(&mut self) {
        self.states.clear();
        self.ca.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use ci_protocol::{ApplicationType, CaPmt};
    use std::time::Duration;

    fn app() -> Application {
        Application::new(
            Arc::new(ResourceRegistry::standard()),
            ApplicationConfig {
                local_offset_minutes: Some(60),
                ..Default::default()
            },
            Box::new(testing::Recorder::default()),
        )
    }

    fn opened(session: u16, kind: ResourceKind, resource: ResourceId) -> SessionEvent {
        SessionEvent::Opened {
            session,
            slot: 0,
            kind,
            resource,
        }
    }

    fn apdu(session: u16, kind: ResourceKind, data: Bytes) -> SessionEvent {
        SessionEvent::Apdu {
            session,
            kind,
            data,
        }
    }

    fn tags(out: &Outbox) -> Vec<(u16, u32)> {
        out.iter()
            .map(|(session, apdu)| (*session, decode_apdu(apdu).unwrap().0))
            .collect()
    }

    #[test]
    fn test_rm_answers_profile_enquiry() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(
            opened(1, ResourceKind::ResourceManager, ResourceId::RESOURCE_MANAGER),
            now,
            &mut out,
        )
        .unwrap();
        assert_eq!(tags(&out), vec![(1, 0x9F8010)]);
        out.clear();

        let enq = RmApdu::ProfileEnq.encode().unwrap();
        app.on_event(apdu(1, ResourceKind::ResourceManager, enq), now, &mut out)
            .unwrap();
        let (tag, body, _) = decode_apdu(&out[0].1).unwrap();
        assert_eq!(tag, 0x9F8011);
        assert_eq!(body.len(), 5 * 4);
        assert_eq!(&body[..4], &[0x00, 0x01, 0x00, 0x41]);
    }

    #[test]
    fn test_rm_profile_change_triggers_enquiry() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(
            opened(1, ResourceKind::ResourceManager, ResourceId::RESOURCE_MANAGER),
            now,
            &mut out,
        )
        .unwrap();
        out.clear();
        let change = RmApdu::ProfileChange.encode().unwrap();
        app.on_event(apdu(1, ResourceKind::ResourceManager, change), now, &mut out)
            .unwrap();
        assert_eq!(tags(&out), vec![(1, 0x9F8010)]);
    }

    #[test]
    fn test_rm_module_profile_answered_with_change() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(
            opened(1, ResourceKind::ResourceManager, ResourceId::RESOURCE_MANAGER),
            now,
            &mut out,
        )
        .unwrap();
        out.clear();

        let profile = RmApdu::Profile(vec![ResourceId::CONDITIONAL_ACCESS, ResourceId::MMI])
            .encode()
            .unwrap();
        app.on_event(apdu(1, ResourceKind::ResourceManager, profile), now, &mut out)
            .unwrap();
        assert_eq!(tags(&out), vec![(1, 0x9F8012)]);
        match app.states.get(&1) {
            Some(ResourceState::ResourceManager(rm)) => assert_eq!(
                rm.module_profile(),
                &[ResourceId::CONDITIONAL_ACCESS, ResourceId::MMI]
            ),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_ai_enquires_on_open() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(
            opened(2, ResourceKind::ApplicationInfo, ResourceId::APPLICATION_INFO),
            now,
            &mut out,
        )
        .unwrap();
        assert_eq!(tags(&out), vec![(2, 0x9F8020)]);

        let info = AiApdu::ApplicationInfo(ApplicationInfo {
            application_type: ApplicationType::ConditionalAccess,
            manufacturer: 0x0B00,
            manufacturer_code: 0x0001,
            menu_string: "Test CAM".into(),
        })
        .encode()
        .unwrap();
        app.on_event(apdu(2, ResourceKind::ApplicationInfo, info), now, &mut out)
            .unwrap();
        assert_eq!(app.application_info().unwrap().menu_string, "Test CAM");

        out.clear();
        app.enter_menu(&mut out).unwrap();
        assert_eq!(tags(&out), vec![(2, 0x9F8022)]);
    }

    #[test]
    fn test_enter_menu_without_session() {
        let mut app = app();
        let mut out = Vec::new();
        assert!(matches!(
            app.enter_menu(&mut out),
            Err(ResourceError::WrongState { .. })
        ));
    }

    #[test]
    fn test_ca_flow() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(
            opened(3, ResourceKind::ConditionalAccess, ResourceId::CONDITIONAL_ACCESS),
            now,
            &mut out,
        )
        .unwrap();
        assert_eq!(tags(&out), vec![(3, 0x9F8030)]);
        out.clear();

        let section = PmtSection {
            program_number: 0x1234,
            program_info: vec![0x09, 0x04, 0x01, 0x00, 0x00, 0x10],
            section_size: 30,
            ..Default::default()
        };
        assert_eq!(app.update_pmt(section), SectionUpdate::New);
        app.poll(now, &mut out);
        assert!(out.is_empty());

        let info = CaApdu::CaInfo(vec![0x0100]).encode().unwrap();
        app.on_event(apdu(3, ResourceKind::ConditionalAccess, info), now, &mut out)
            .unwrap();
        app.poll(now, &mut out);
        assert_eq!(out.len(), 1);
        let (_, body, _) = decode_apdu(&out[0].1).unwrap();
        let ca_pmt = CaPmt::parse(body).unwrap();
        assert_eq!(ca_pmt.program_number, 0x1234);
        assert_eq!(ca_pmt.descriptors.len(), 1);

        app.on_event(
            SessionEvent::Closed {
                session: 3,
                kind: ResourceKind::ConditionalAccess,
            },
            now,
            &mut out,
        )
        .unwrap();
        assert!(app.ca().ca_system_ids(3).is_none());
    }

    #[test]
    fn test_date_time_interval() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(
            opened(4, ResourceKind::DateTime, ResourceId::DATE_TIME),
            now,
            &mut out,
        )
        .unwrap();
        let enq = DateTimeApdu::Enq {
            response_interval: 10,
        }
        .encode()
        .unwrap();
        app.on_event(apdu(4, ResourceKind::DateTime, enq), now, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        let (tag, body, _) = decode_apdu(&out[0].1).unwrap();
        assert_eq!(tag, 0x9F8441);
        // UTC plus the configured local offset.
        assert_eq!(body.len(), 7);
        assert_eq!(&body[5..], &[0x00, 0x3C]);
        assert_eq!(app.next_deadline(), Some(now + Duration::from_secs(10)));

        app.poll(now + Duration::from_secs(5), &mut out);
        assert_eq!(out.len(), 1);
        app.poll(now + Duration::from_secs(10), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(app.next_deadline(), Some(now + Duration::from_secs(20)));
    }

    #[test]
    fn test_date_time_once() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(
            opened(4, ResourceKind::DateTime, ResourceId::DATE_TIME),
            now,
            &mut out,
        )
        .unwrap();
        let enq = DateTimeApdu::Enq {
            response_interval: 0,
        }
        .encode()
        .unwrap();
        app.on_event(apdu(4, ResourceKind::DateTime, enq), now, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(app.next_deadline(), None);
    }

    #[test]
    fn test_apdu_for_unknown_session() {
        let mut app = app();
        let mut out = Vec::new();
        let enq = RmApdu::ProfileEnq.encode().unwrap();
        assert!(matches!(
            app.on_event(
                apdu(9, ResourceKind::ResourceManager, enq),
                Instant::now(),
                &mut out
            ),
            Err(ResourceError::UnknownSession(9))
        ));
    }

    #[test]
    fn test_mmi_answer_routes_to_first_session() {
        let mut app = app();
        let mut out = Vec::new();
        let now = Instant::now();
        app.on_event(opened(5, ResourceKind::Mmi, ResourceId::MMI), now, &mut out)
            .unwrap();
        let enq = MmiApdu::Enq {
            blind: false,
            answer_length: 2,
            text: "Age?".into(),
        }
        .encode()
        .unwrap();
        app.on_event(apdu(5, ResourceKind::Mmi, enq), now, &mut out)
            .unwrap();
        app.mmi_answer(None, MmiAnswer::Answer("18".into()), &mut out)
            .unwrap();
        assert_eq!(tags(&out), vec![(5, 0x9F8808)]);
    }
}
