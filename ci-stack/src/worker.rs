//! Per-slot worker thread.
//!
//! Each slot runs the whole stack on a blocking thread: wait for the link,
//! process replies through transport, session and resource layers, then
//! write whatever the resources queued. Commands from the async side arrive
//! over a channel and are applied between rounds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ci_protocol::{MmiAnswer, PmtSection};
use log::{debug, error, info, warn};

use crate::error::ResourceError;
use crate::resources::{Application, ApplicationConfig, HostCallbacks, Outbox};
use crate::session::{ResourceRegistry, SessionEvent, SessionLayer};
use crate::transport::{TransportEvent, TransportLayer};

/// Requests for a slot worker.
#[derive(Debug)]
pub enum SlotCommand {
    /// A new or repeated PMT section of a program to descramble.
    UpdatePmt(PmtSection),
    SelectStream { program_number: u16, pid: u16 },
    DeselectStream { program_number: u16, pid: u16 },
    /// Stop descrambling a program.
    UntrackProgram(u16),
    EnterMenu,
    MmiAnswer(MmiAnswer),
    MmiMenuAnswer(u8),
    MmiClose,
    Shutdown,
}

/// The stack for one slot.
pub struct SlotWorker {
    name: String,
    transport: TransportLayer,
    sessions: SessionLayer,
    app: Application,
    outbox: Outbox,
}

impl SlotWorker {
    pub fn new(
        name: impl Into<String>,
        transport: TransportLayer,
        registry: Arc<ResourceRegistry>,
        config: ApplicationConfig,
        callbacks: Box<dyn HostCallbacks>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            sessions: SessionLayer::new(registry.clone()),
            app: Application::new(registry, config, callbacks),
            outbox: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &TransportLayer {
        &self.transport
    }

    pub fn sessions(&self) -> &SessionLayer {
        &self.sessions
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    /// Apply a command. Returns false on shutdown.
    pub fn apply(&mut self, cmd: SlotCommand, now: Instant) -> bool {
        let result: Result<(), ResourceError> = match cmd {
            SlotCommand::UpdatePmt(section) => {
                let program = section.program_number;
                let update = self.app.update_pmt(section);
                debug!("[SlotWorker:{}] PMT {} {:?}", self.name, program, update);
                Ok(())
            }
            SlotCommand::SelectStream {
                program_number,
                pid,
            } => {
                self.app.ca_mut().select_stream(program_number, pid);
                Ok(())
            }
            SlotCommand::DeselectStream {
                program_number,
                pid,
            } => {
                self.app.ca_mut().deselect_stream(program_number, pid);
                Ok(())
            }
            SlotCommand::UntrackProgram(program_number) => {
                self.app.ca_mut().untrack_program(program_number);
                Ok(())
            }
            SlotCommand::EnterMenu => self.app.enter_menu(&mut self.outbox),
            SlotCommand::MmiAnswer(answer) => self.app.mmi_answer(None, answer, &mut self.outbox),
            SlotCommand::MmiMenuAnswer(choice) => {
                self.app.mmi_menu_answer(None, choice, &mut self.outbox)
            }
            SlotCommand::MmiClose => self.app.mmi_close(None, &mut self.outbox),
            SlotCommand::Shutdown => return false,
        };
        if let Err(e) = result {
            warn!("[SlotWorker:{}] command failed: {}", self.name, e);
        }
        self.app.poll(now, &mut self.outbox);
        self.flush(now);
        true
    }

    fn app_event(&mut self, event: SessionEvent, now: Instant) {
        if let Err(e) = self.app.on_event(event, now, &mut self.outbox) {
            warn!("[SlotWorker:{}] {}", self.name, e);
        }
    }

    /// One round of link processing.
    pub fn turn(&mut self, now: Instant) {
        for event in self.transport.poll(now) {
            match event {
                TransportEvent::Data { slot, tcid, spdu } => {
                    match self
                        .sessions
                        .handle_spdu(&mut self.transport, slot, tcid, &spdu)
                    {
                        Ok(events) => {
                            for event in events {
                                self.app_event(event, now);
                            }
                        }
                        Err(e) => warn!("[SlotWorker:{}] SPDU dropped: {}", self.name, e),
                    }
                }
                TransportEvent::Disconnected { slot, tcid } => {
                    for event in self.sessions.connection_closed(slot, tcid) {
                        self.app_event(event, now);
                    }
                }
                TransportEvent::SlotRemoved { slot } => {
                    for event in self.sessions.slot_removed(slot) {
                        self.app_event(event, now);
                    }
                    self.app.reset();
                    info!("[SlotWorker:{}] module gone", self.name);
                }
                TransportEvent::SlotReady { .. } => {
                    info!("[SlotWorker:{}] module inserted", self.name);
                }
                TransportEvent::Connected { tcid, .. } => {
                    debug!("[SlotWorker:{}] transport connection {} up", self.name, tcid);
                }
            }
        }
        self.app.poll(now, &mut self.outbox);
        self.flush(now);
    }

    /// Push queued APDUs into the session layer and write them out.
    fn flush(&mut self, now: Instant) {
        for (session, apdu) in std::mem::take(&mut self.outbox) {
            if let Err(e) = self
                .sessions
                .send_apdu(&mut self.transport, session, &apdu)
            {
                warn!(
                    "[SlotWorker:{}] APDU for session {} dropped: {}",
                    self.name, session, e
                );
            }
        }
        self.transport.flush(now);
    }

    /// How long the next wait may block.
    fn wait_timeout(&self, now: Instant) -> Duration {
        let poll = self.transport.config().poll_interval;
        match self.app.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(poll),
            None => poll,
        }
    }

    /// Run until cancelled, the channel closes or [`SlotCommand::Shutdown`].
    pub fn run(mut self, commands: mpsc::Receiver<SlotCommand>, cancel: Arc<AtomicBool>) {
        info!("[SlotWorker:{}] started", self.name);
        'outer: while !cancel.load(Ordering::Relaxed) {
            loop {
                match commands.try_recv() {
                    Ok(cmd) => {
                        if !self.apply(cmd, Instant::now()) {
                            break 'outer;
                        }
                    }
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => break 'outer,
                }
            }
            let timeout = self.wait_timeout(Instant::now());
            self.transport.wait(timeout);
            self.turn(Instant::now());
        }
        if let Some(e) = self.transport.take_last_error() {
            warn!("[SlotWorker:{}] last transport error: {}", self.name, e);
        }
        info!("[SlotWorker:{}] stopped", self.name);
    }
}

/// Async-side handle to a worker running on a blocking thread.
pub struct SlotHandle {
    name: String,
    cmd_tx: mpsc::Sender<SlotCommand>,
    cancel: Arc<AtomicBool>,
    join_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SlotHandle {
    pub fn spawn(worker: SlotWorker) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<SlotCommand>();
        let cancel = Arc::new(AtomicBool::new(false));
        let name = worker.name().to_string();

        let thread_cancel = cancel.clone();
        let thread_name = name.clone();
        let join_handle = tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                worker.run(cmd_rx, thread_cancel);
            }));
            if let Err(panic_err) = result {
                error!("[SlotWorker:{}] Panic in worker thread: {:?}", thread_name, panic_err);
            }
        });

        Self {
            name,
            cmd_tx,
            cancel,
            join_handle: Some(join_handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, cmd: SlotCommand) -> Result<(), std::io::Error> {
        self.cmd_tx.send(cmd).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "Slot worker command channel closed",
            )
        })
    }

    pub async fn shutdown(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.cmd_tx.send(SlotCommand::Shutdown);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::Recorder;
    use crate::transport::{CamState, LoopbackControl, LoopbackLink, TransportConfig};
    use bytes::{Bytes, BytesMut};
    use ci_protocol::types::apdu_tag;
    use ci_protocol::{
        decode_apdu, decode_spdu, decode_tpdu, encode_module_reply, encode_spdu, CaApdu, CaPmt,
        CaPmtCmd, CaPmtReply, ListManagement, PmtStream, ResourceId, SessionStatus, Spdu, Tpdu,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const SYSTEM: u16 = 0x0100;

    /// Module side of the loopback: answers the transport layer, queues
    /// SPDUs for the host and answers `ca_info_enq` on its own.
    #[derive(Default)]
    struct FakeCam {
        pending: VecDeque<Bytes>,
        received: Vec<Spdu>,
        rx: BytesMut,
    }

    impl FakeCam {
        fn respond(&mut self, tcid: u8, tpdu: &[u8]) -> Vec<Bytes> {
            let (_, tpdu) = decode_tpdu(tpdu).unwrap();
            let reply = match tpdu {
                Tpdu::CreateTc => Some(Tpdu::CreateTcReply),
                Tpdu::Rcv => self.pending.pop_front().map(Tpdu::DataLast),
                Tpdu::DataMore(data) => {
                    self.rx.extend_from_slice(&data);
                    None
                }
                Tpdu::DataLast(data) => {
                    self.rx.extend_from_slice(&data);
                    if !self.rx.is_empty() {
                        let spdu = self.rx.split().freeze();
                        self.receive(&spdu);
                    }
                    None
                }
                _ => None,
            };
            vec![encode_module_reply(tcid, reply.as_ref(), !self.pending.is_empty()).unwrap()]
        }

        fn receive(&mut self, spdu: &[u8]) {
            let spdu = decode_spdu(spdu).unwrap();
            if let Spdu::SessionNumber { session, apdu } = &spdu {
                let (tag, _, _) = decode_apdu(apdu).unwrap();
                if tag == apdu_tag::CA_INFO_ENQ {
                    let info = CaApdu::CaInfo(vec![SYSTEM]).encode().unwrap();
                    self.queue_apdu(*session, info);
                }
            }
            self.received.push(spdu);
        }

        fn queue(&mut self, spdu: Spdu) {
            self.pending.push_back(encode_spdu(&spdu).unwrap());
        }

        fn queue_apdu(&mut self, session: u16, apdu: Bytes) {
            self.queue(Spdu::SessionNumber { session, apdu });
        }

        fn ca_pmts(&self) -> Vec<CaPmt> {
            self.received
                .iter()
                .filter_map(|spdu| match spdu {
                    Spdu::SessionNumber { apdu, .. } => {
                        let (tag, body, _) = decode_apdu(apdu).unwrap();
                        (tag == apdu_tag::CA_PMT).then(|| CaPmt::parse(body).unwrap())
                    }
                    _ => None,
                })
                .collect()
        }
    }

    fn worker(cam: Arc<Mutex<FakeCam>>) -> (SlotWorker, LoopbackControl) {
        let (link, control) =
            LoopbackLink::new(64, move |tcid, tpdu| cam.lock().unwrap().respond(tcid, tpdu));
        let mut transport = TransportLayer::new(TransportConfig::default());
        transport.add_slot(Box::new(link));
        let worker = SlotWorker::new(
            "test",
            transport,
            Arc::new(ResourceRegistry::standard()),
            ApplicationConfig::default(),
            Box::new(Recorder::default()),
        );
        (worker, control)
    }

    fn run(worker: &mut SlotWorker, clock: &mut Instant, rounds: usize) {
        for _ in 0..rounds {
            *clock += Duration::from_millis(150);
            worker.turn(*clock);
        }
    }

    fn pmt() -> PmtSection {
        PmtSection {
            program_number: 0x1234,
            version_number: 1,
            current_next_indicator: true,
            pcr_pid: 0x0100,
            program_info: vec![0x09, 0x04, 0x01, 0x00, 0x00, 0x10],
            streams: vec![PmtStream {
                stream_type: 0x02,
                elementary_pid: 0x0100,
                descriptors: vec![],
            }],
            section_size: 32,
            ..Default::default()
        }
    }

    /// Open a CA session from the module side and let `ca_info` settle.
    fn with_ca_session() -> (SlotWorker, Arc<Mutex<FakeCam>>, LoopbackControl, Instant) {
        let cam = Arc::new(Mutex::new(FakeCam::default()));
        cam.lock().unwrap().queue(Spdu::OpenSessionRequest {
            resource: ResourceId::CONDITIONAL_ACCESS,
        });
        let (mut worker, control) = worker(cam.clone());
        let mut clock = Instant::now();
        worker.apply(SlotCommand::UpdatePmt(pmt()), clock);
        worker.apply(
            SlotCommand::SelectStream {
                program_number: 0x1234,
                pid: 0x0100,
            },
            clock,
        );
        run(&mut worker, &mut clock, 20);
        (worker, cam, control, clock)
    }

    #[test]
    fn test_module_opens_ca_session() {
        let (worker, cam, _control, _) = with_ca_session();
        let cam = cam.lock().unwrap();
        assert_eq!(
            cam.received[0],
            Spdu::OpenSessionResponse {
                status: SessionStatus::Ok,
                resource: ResourceId::CONDITIONAL_ACCESS,
                session: 1,
            }
        );
        assert_eq!(worker.app().ca().ca_system_ids(1), Some(&[SYSTEM][..]));
    }

    #[test]
    fn test_ca_pmt_sent_after_ca_info() {
        let (_worker, cam, _control, _) = with_ca_session();
        let ca_pmts = cam.lock().unwrap().ca_pmts();
        assert_eq!(ca_pmts.len(), 1);
        assert_eq!(ca_pmts[0].program_number, 0x1234);
        assert_eq!(ca_pmts[0].list_management, ListManagement::Only);
        assert_eq!(ca_pmts[0].cmd_id, Some(CaPmtCmd::Query));
        assert_eq!(ca_pmts[0].streams.len(), 1);
    }

    #[test]
    fn test_reply_grant_triggers_update() {
        let (mut worker, cam, _control, mut clock) = with_ca_session();
        let reply = CaApdu::CaPmtReply(CaPmtReply {
            program_number: 0x1234,
            version_number: 1,
            current_next_indicator: true,
            ca_enable: 0x81,
            streams: vec![],
        })
        .encode()
        .unwrap();
        cam.lock().unwrap().queue_apdu(1, reply);
        run(&mut worker, &mut clock, 10);

        let program = worker.app().ca().program(0x1234).unwrap();
        assert_eq!(program.cmd(), CaPmtCmd::OkDescrambling);
        let ca_pmts = cam.lock().unwrap().ca_pmts();
        assert_eq!(ca_pmts.len(), 2);
        assert_eq!(ca_pmts[1].list_management, ListManagement::Update);
        assert_eq!(ca_pmts[1].cmd_id, Some(CaPmtCmd::OkDescrambling));
    }

    #[test]
    fn test_repeated_pmt_sends_nothing() {
        let (mut worker, cam, _control, mut clock) = with_ca_session();
        worker.apply(SlotCommand::UpdatePmt(pmt()), clock);
        run(&mut worker, &mut clock, 5);
        assert_eq!(cam.lock().unwrap().ca_pmts().len(), 1);
    }

    #[test]
    fn test_module_removal_clears_sessions() {
        let (mut worker, _cam, control, mut clock) = with_ca_session();
        control.set_state(CamState::Absent);
        run(&mut worker, &mut clock, 1);

        assert_eq!(worker.sessions().sessions().count(), 0);
        assert!(worker.app().ca().ca_system_ids(1).is_none());
        // Program tracking survives, grants do not.
        let program = worker.app().ca().program(0x1234).unwrap();
        assert_eq!(program.cmd(), CaPmtCmd::Query);
    }

    #[test]
    fn test_shutdown_command() {
        let cam = Arc::new(Mutex::new(FakeCam::default()));
        let (mut worker, _control) = worker(cam);
        assert!(!worker.apply(SlotCommand::Shutdown, Instant::now()));
    }

    #[test]
    fn test_run_stops_when_cancelled() {
        let cam = Arc::new(Mutex::new(FakeCam::default()));
        let (worker, _control) = worker(cam);
        let (_tx, rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(true));
        worker.run(rx, cancel);
    }
}
