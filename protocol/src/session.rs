//! Session orchestration.
//!
//! An [`Orchestrator`] runs one [`LinkMachine`] to completion on the current
//! task. It executes the machine's commands against a [`Transport`], keeps
//! the pending timers, and feeds transport notifications, timer expiries and
//! cancellation back into the machine.

use crate::{
    Error,
    address::DeviceAddress,
    config::{ConfigurationSnapshot, Timings, UploadSettings},
    journal::Journal,
    link::{Command, Completion, Event, Generation, Input, LinkMachine, Purpose, Timer},
    transport::{Link, Notifier, Transport, TransportError},
    upload::{ImageSource, UploadController, UploadTransport},
};
use log::{Level, debug, trace};
use std::{future, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};

/// Outcome of a session together with its diagnostics.
#[derive(Debug)]
pub struct Report {
    /// Final result.
    pub result: Result<Completion, Error>,
    /// Last upload progress as `(sent, total)`, if an upload reported any.
    pub progress: Option<(u64, u64)>,
    /// Chronological record of the session.
    pub journal: Journal,
}

/// Requests cancellation of a running session.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Cancels the session. Cancelling twice is harmless.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Cancellation signal observed by a running session.
#[derive(Clone, Debug)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    /// Returns whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until cancellation is requested.
    ///
    /// Never completes if the [`CancelHandle`] is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|&cancelled| cancelled).await.is_err() {
            future::pending::<()>().await;
        }
    }
}

/// Constructs a connected cancellation pair.
#[must_use]
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);

    (CancelHandle(tx), Cancellation(rx))
}

/// Runs configuration and firmware sessions against a device.
#[derive(Debug)]
pub struct Orchestrator<T> {
    transport: T,
    timings: Timings,
}

impl<T: Transport> Orchestrator<T> {
    /// Constructs an orchestrator using the given transport.
    pub fn new(transport: T, timings: Timings) -> Self {
        Self { transport, timings }
    }

    /// Delivers a configuration snapshot to the device.
    pub async fn configure(
        &mut self,
        address: DeviceAddress,
        snapshot: ConfigurationSnapshot,
        cancel: Cancellation,
    ) -> Report {
        let machine = LinkMachine::new(Purpose::Configure(snapshot), self.timings);
        let driver = Driver::new(&mut self.transport, self.timings, address, None);

        driver.run(machine, cancel).await
    }

    /// Unlocks the device and uploads a firmware image.
    pub async fn update_firmware(
        &mut self,
        address: DeviceAddress,
        password: &str,
        upload: &mut dyn UploadTransport,
        image: &mut dyn ImageSource,
        settings: UploadSettings,
        cancel: Cancellation,
    ) -> Report {
        let machine = LinkMachine::new(
            Purpose::Firmware {
                password: password.to_string(),
            },
            self.timings,
        );
        let upload = UploadContext {
            transport: upload,
            image,
            settings,
            controller: None,
        };
        let driver = Driver::new(&mut self.transport, self.timings, address, Some(upload));

        driver.run(machine, cancel).await
    }
}

struct UploadContext<'a> {
    transport: &'a mut dyn UploadTransport,
    image: &'a mut dyn ImageSource,
    settings: UploadSettings,
    controller: Option<Box<dyn UploadController>>,
}

#[derive(Copy, Clone, Debug)]
struct Pending {
    at: Instant,
    timer: Timer,
    generation: Generation,
}

enum Flow {
    Continue,
    Interrupted,
    Finished(Result<Completion, Error>),
}

struct Driver<'a, T: Transport> {
    transport: &'a mut T,
    timings: Timings,
    address: DeviceAddress,
    link: Option<T::Link>,
    upload: Option<UploadContext<'a>>,
    timers: Vec<Pending>,
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
}

impl<'a, T: Transport> Driver<'a, T> {
    fn new(
        transport: &'a mut T,
        timings: Timings,
        address: DeviceAddress,
        upload: Option<UploadContext<'a>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            transport,
            timings,
            address,
            link: None,
            upload,
            timers: Vec::new(),
            tx,
            rx,
        }
    }

    async fn run(mut self, mut machine: LinkMachine, mut cancel: Cancellation) -> Report {
        let mut input = Input::Start;

        loop {
            trace!("Handling {input:?}");

            for cmd in machine.handle(Instant::now(), input) {
                match self.execute(&mut machine, cmd, &mut cancel).await {
                    Flow::Continue => {}
                    Flow::Interrupted => break,
                    Flow::Finished(result) => {
                        return Report {
                            result,
                            progress: machine.progress(),
                            journal: machine.into_journal(),
                        };
                    }
                }
            }

            input = self.next_input(&mut cancel).await;
        }
    }

    async fn next_input(&mut self, cancel: &mut Cancellation) -> Input {
        let next = self.timers.iter().min_by_key(|p| p.at).copied();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Input::Cancel,
            Some(input) = self.rx.recv() => input,
            () = sleep_until(next.map(|p| p.at)) => {
                // `next` is always set when the sleep completes
                let Some(pending) = next else {
                    return Input::Cancel;
                };

                self.timers.retain(|p| p.at != pending.at || p.timer != pending.timer);

                Input::Event {
                    generation: pending.generation,
                    event: Event::TimerFired(pending.timer),
                }
            }
        }
    }

    fn notifier(&self, generation: Generation) -> Notifier {
        Notifier::new(generation, self.tx.clone())
    }

    fn post(&self, generation: Generation, event: Event) {
        self.notifier(generation).send(event);
    }

    async fn execute(
        &mut self,
        machine: &mut LinkMachine,
        cmd: Command,
        cancel: &mut Cancellation,
    ) -> Flow {
        match cmd {
            Command::StartScan(generation) => {
                let notifier = self.notifier(generation);
                let op = self.transport.start_scan(self.address, notifier);

                match bounded(self.timings.operation_timeout, op, cancel).await {
                    Some(Ok(())) => debug!("Scan started for {}", self.address),
                    Some(Err(err)) => self.post(generation, Event::ScanFailed(err.to_string())),
                    None => return Flow::Interrupted,
                }
            }
            Command::StopScan => {
                if let Err(err) = self.transport.stop_scan().await {
                    machine.note(Instant::now(), Level::Debug, format!("Stop scan: {err}"));
                }
            }
            Command::Connect(generation) => {
                let notifier = self.notifier(generation);
                let op = self.transport.connect(self.address, notifier);

                match bounded(self.timings.connect_timeout, op, cancel).await {
                    Some(Ok(link)) => {
                        self.link = Some(link);
                        self.post(generation, Event::Connected);
                    }
                    Some(Err(err)) => self.post(generation, Event::ConnectFailed(err.to_string())),
                    None => return Flow::Interrupted,
                }
            }
            Command::Discover(generation) => {
                let Some(link) = self.link.as_mut() else {
                    self.post(generation, Event::DiscoveryFailed("no link".to_string()));

                    return Flow::Continue;
                };

                match bounded(self.timings.operation_timeout, link.discover(), cancel).await {
                    Some(Ok(table)) => self.post(generation, Event::Discovered(table)),
                    Some(Err(err)) => {
                        self.post(generation, Event::DiscoveryFailed(err.to_string()));
                    }
                    None => return Flow::Interrupted,
                }
            }
            Command::Write {
                generation,
                attribute,
                payload,
            } => {
                let event = match self.link.as_mut() {
                    Some(link) => {
                        let op = link.write(attribute.uuid(), &payload);

                        match bounded(self.timings.operation_timeout, op, cancel).await {
                            Some(Ok(())) => Event::WriteAcked(attribute),
                            Some(Err(err)) => Event::WriteFailed {
                                attribute,
                                reason: err.to_string(),
                            },
                            None => return Flow::Interrupted,
                        }
                    }
                    None => Event::WriteFailed {
                        attribute,
                        reason: "no link".to_string(),
                    },
                };

                self.post(generation, event);
            }
            Command::Teardown => self.teardown(machine).await,
            Command::Schedule {
                timer,
                delay,
                generation,
            } => self.timers.push(Pending {
                at: Instant::now() + delay,
                timer,
                generation,
            }),
            Command::CancelTimer(timer) => self.timers.retain(|p| p.timer != timer),
            Command::CancelTimers => self.timers.clear(),
            Command::StartUpload(generation) => {
                let notifier = self.notifier(generation);

                if let Some(event) = self.start_upload(notifier, cancel).await {
                    self.post(generation, event);
                }
            }
            Command::CancelUpload => {
                let controller = self.upload.as_mut().and_then(|u| u.controller.as_mut());

                if let Some(controller) = controller
                    && let Err(err) = controller.cancel().await
                {
                    machine.note(Instant::now(), Level::Warn, format!("Upload cancel: {err}"));
                }
            }
            Command::ReleaseUpload => {
                if let Some(upload) = self.upload.as_mut() {
                    upload.controller = None;

                    if let Err(err) = upload.transport.release().await {
                        machine.note(Instant::now(), Level::Warn, format!("Upload release: {err}"));
                    }
                }
            }
            Command::Finish(result) => return Flow::Finished(result),
        }

        Flow::Continue
    }

    /// Reads the image and starts the upload, returning a failure event.
    async fn start_upload(
        &mut self,
        notifier: Notifier,
        cancel: &mut Cancellation,
    ) -> Option<Event> {
        let Some(upload) = self.upload.as_mut() else {
            return Some(Event::UploadRejected("no upload transport".to_string()));
        };

        let image = match upload.image.read().await {
            Ok(image) => image,
            Err(err) => return Some(Event::ImageUnreadable(err.to_string())),
        };

        debug!("Uploading {} byte image", image.len());

        upload.transport.configure(&upload.settings);

        let op = upload.transport.start(self.address, image, notifier);

        match bounded(upload.settings.connection_timeout, op, cancel).await {
            Some(Ok(Some(controller))) => {
                upload.controller = Some(controller);

                None
            }
            Some(Ok(None)) => Some(Event::UploadRejected("no controller".to_string())),
            Some(Err(err)) => Some(Event::UploadRejected(err.to_string())),
            // The pending cancellation is picked up by the main loop
            None => None,
        }
    }

    async fn teardown(&mut self, machine: &mut LinkMachine) {
        let Some(mut link) = self.link.take() else {
            return;
        };

        let timeout = self.timings.operation_timeout;

        match time::timeout(timeout, link.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => machine.note(Instant::now(), Level::Debug, format!("Disconnect: {err}")),
            Err(_) => machine.note(Instant::now(), Level::Debug, "Disconnect timed out"),
        }

        match time::timeout(timeout, link.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => machine.note(Instant::now(), Level::Debug, format!("Close: {err}")),
            Err(_) => machine.note(Instant::now(), Level::Debug, "Close timed out"),
        }
    }
}

/// Runs `op` with a timeout, abandoning it if the session is cancelled.
async fn bounded<F, R>(
    timeout: Duration,
    op: F,
    cancel: &mut Cancellation,
) -> Option<Result<R, TransportError>>
where
    F: Future<Output = Result<R, TransportError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        res = time::timeout(timeout, op) => Some(
            res.unwrap_or_else(|_| Err(TransportError::new(format!("timed out after {timeout:?}"))))
        ),
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attribute::{AttributeId, AttributeTable},
        config::Setting,
        upload::UploadEvent,
    };
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};
    use uuid::Uuid;

    #[derive(Default, Debug)]
    struct Log {
        scans: usize,
        connects: usize,
        writes: Vec<(Uuid, Vec<u8>)>,
        disconnects: usize,
        uploads: usize,
        cancels: usize,
        releases: usize,
    }

    /// Scripted transport: scans find the peer unless `failing_scans` is
    /// non-zero, writes fail according to `write_failures`.
    struct FakeTransport {
        log: Rc<RefCell<Log>>,
        failing_scans: usize,
        silent_scans: bool,
        table: AttributeTable,
        write_failures: Rc<RefCell<VecDeque<bool>>>,
    }

    impl FakeTransport {
        fn new(table: AttributeTable) -> (Self, Rc<RefCell<Log>>) {
            let log = Rc::new(RefCell::new(Log::default()));

            (
                Self {
                    log: log.clone(),
                    failing_scans: 0,
                    silent_scans: false,
                    table,
                    write_failures: Rc::default(),
                },
                log,
            )
        }
    }

    struct FakeLink {
        log: Rc<RefCell<Log>>,
        table: AttributeTable,
        write_failures: Rc<RefCell<VecDeque<bool>>>,
    }

    #[async_trait::async_trait(?Send)]
    impl Transport for FakeTransport {
        type Link = FakeLink;

        async fn start_scan(
            &mut self,
            _address: DeviceAddress,
            notifier: Notifier,
        ) -> Result<(), TransportError> {
            self.log.borrow_mut().scans += 1;

            if self.failing_scans > 0 {
                self.failing_scans -= 1;

                return Err(TransportError::new("scan throttled"));
            }

            if !self.silent_scans {
                notifier.peer_found(Some(-55));
            }

            Ok(())
        }

        async fn stop_scan(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn connect(
            &mut self,
            _address: DeviceAddress,
            _notifier: Notifier,
        ) -> Result<FakeLink, TransportError> {
            self.log.borrow_mut().connects += 1;

            Ok(FakeLink {
                log: self.log.clone(),
                table: self.table.clone(),
                write_failures: self.write_failures.clone(),
            })
        }
    }

    #[async_trait::async_trait(?Send)]
    impl Link for FakeLink {
        async fn discover(&mut self) -> Result<AttributeTable, TransportError> {
            Ok(self.table.clone())
        }

        async fn write(&mut self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError> {
            if self.write_failures.borrow_mut().pop_front() == Some(true) {
                return Err(TransportError::new("GATT error 133"));
            }

            self.log
                .borrow_mut()
                .writes
                .push((attribute, payload.to_vec()));

            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.log.borrow_mut().disconnects += 1;

            Err(TransportError::new("already disconnected"))
        }
    }

    struct FakeController(Rc<RefCell<Log>>);

    #[async_trait::async_trait(?Send)]
    impl UploadController for FakeController {
        async fn cancel(&mut self) -> Result<(), TransportError> {
            self.0.borrow_mut().cancels += 1;

            Ok(())
        }
    }

    /// Upload transport that stays silent on its first upload and
    /// completes every later one.
    struct FakeUpload {
        log: Rc<RefCell<Log>>,
        silent_first: bool,
        events: Vec<UploadEvent>,
    }

    #[async_trait::async_trait(?Send)]
    impl UploadTransport for FakeUpload {
        async fn start(
            &mut self,
            _address: DeviceAddress,
            image: Vec<u8>,
            notifier: Notifier,
        ) -> Result<Option<Box<dyn UploadController>>, TransportError> {
            let uploads = {
                let mut log = self.log.borrow_mut();

                log.uploads += 1;
                log.uploads
            };

            assert_eq!(image, [0xde, 0xad], "image should be passed through");

            if !(self.silent_first && uploads == 1) {
                for event in &self.events {
                    notifier.upload(event.clone());
                }
            }

            Ok(Some(Box::new(FakeController(self.log.clone()))))
        }

        async fn release(&mut self) -> Result<(), TransportError> {
            self.log.borrow_mut().releases += 1;

            Ok(())
        }
    }

    fn address() -> DeviceAddress {
        DeviceAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
    }

    fn full_table() -> AttributeTable {
        [
            AttributeId::Password,
            AttributeId::TxPower,
            AttributeId::ConfigMac,
        ]
        .into_iter()
        .collect()
    }

    fn snapshot() -> ConfigurationSnapshot {
        ConfigurationSnapshot {
            tx_power: Setting::applied(2),
            config_mac: Setting::applied("AA:BB:CC:DD:EE:FF".to_string()),
            ..ConfigurationSnapshot::with_password("ABCDEFGH")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn configure_session() {
        crate::tests::init_logger();

        let (transport, log) = FakeTransport::new(full_table());
        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (_handle, cancel) = cancellation();
        let report = orchestrator.configure(address(), snapshot(), cancel).await;

        assert_eq!(
            report.result,
            Ok(Completion::Configured {
                written: 3,
                skipped: 0
            }),
            "session should complete"
        );

        let log = log.borrow();

        assert_eq!(
            log.writes,
            [
                (AttributeId::Password.uuid(), b"ABCDEFGH".to_vec()),
                (AttributeId::TxPower.uuid(), vec![0x02, 0x00, 0x00, 0x00]),
                (
                    AttributeId::ConfigMac.uuid(),
                    vec![0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa]
                ),
            ],
            "writes should be delivered in order"
        );
        assert_eq!(log.disconnects, 1, "link should be torn down once");
        assert!(
            report.journal.mentions("Disconnect: already disconnected"),
            "teardown error should be journaled, not propagated"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_reconnects() {
        let (transport, log) = FakeTransport::new(full_table());

        transport
            .write_failures
            .borrow_mut()
            .extend([false, true]);

        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (_handle, cancel) = cancellation();
        let report = orchestrator.configure(address(), snapshot(), cancel).await;

        assert!(report.result.is_ok(), "second attempt should succeed");

        let log = log.borrow();

        assert_eq!(log.connects, 2, "link should be re-established");
        assert_eq!(
            log.writes.iter().map(|(uuid, _)| *uuid).collect::<Vec<_>>(),
            [
                AttributeId::Password.uuid(),
                AttributeId::Password.uuid(),
                AttributeId::TxPower.uuid(),
                AttributeId::ConfigMac.uuid(),
            ],
            "writes should restart from the beginning"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded() {
        let (mut transport, log) = FakeTransport::new(full_table());

        transport.silent_scans = true;

        let timings = Timings {
            deadline: Duration::from_secs(20),
            ..Timings::default()
        };
        let mut orchestrator = Orchestrator::new(transport, timings);
        let (_handle, cancel) = cancellation();
        let start = Instant::now();
        let report = orchestrator.configure(address(), snapshot(), cancel).await;

        // Scans time out after 6s, followed by 1.2s of backoff
        assert_eq!(
            report.result,
            Err(Error::DeadlineExceeded { attempts: 3 }),
            "session should give up"
        );
        assert_eq!(log.borrow().scans, 3, "three scans expected");
        assert!(
            start.elapsed() >= Duration::from_secs(20),
            "deadline should have passed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scan_failures_are_retried() {
        let (mut transport, log) = FakeTransport::new(full_table());

        transport.failing_scans = 2;

        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (_handle, cancel) = cancellation();
        let report = orchestrator.configure(address(), snapshot(), cancel).await;

        assert!(report.result.is_ok(), "third scan should succeed");
        assert_eq!(log.borrow().scans, 3, "three scans expected");
        assert!(report.journal.mentions("scan throttled"), "failure journaled");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_scanning() {
        let (mut transport, _log) = FakeTransport::new(full_table());

        transport.silent_scans = true;

        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (handle, cancel) = cancellation();
        let session = orchestrator.configure(address(), snapshot(), cancel);
        let canceller = async {
            time::sleep(Duration::from_secs(2)).await;
            handle.cancel();
        };
        let (report, ()) = tokio::join!(session, canceller);

        assert_eq!(report.result, Err(Error::Cancelled), "session should be cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_password() {
        let (transport, log) = FakeTransport::new(full_table());
        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (_handle, cancel) = cancellation();
        let report = orchestrator
            .configure(
                address(),
                ConfigurationSnapshot::with_password("pass"),
                cancel,
            )
            .await;

        assert!(
            matches!(report.result, Err(Error::InvalidPassword(_))),
            "session should fail"
        );
        assert_eq!(log.borrow().scans, 0, "nothing should be scanned");
    }

    fn fake_upload(log: &Rc<RefCell<Log>>, silent_first: bool) -> FakeUpload {
        FakeUpload {
            log: log.clone(),
            silent_first,
            events: vec![
                UploadEvent::Started,
                UploadEvent::Progress { sent: 1, total: 2 },
                UploadEvent::Completed,
            ],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_update() {
        crate::tests::init_logger();

        let (transport, log) = FakeTransport::new(full_table());
        let mut upload = fake_upload(&log, false);
        let mut image = vec![0xde, 0xad];
        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (_handle, cancel) = cancellation();
        let report = orchestrator
            .update_firmware(
                address(),
                "ABCDEFGH",
                &mut upload,
                &mut image,
                UploadSettings::default(),
                cancel,
            )
            .await;

        assert_eq!(
            report.result,
            Ok(Completion::FirmwareUpdated),
            "upload should complete"
        );

        let log = log.borrow();

        assert_eq!(
            log.writes,
            [(AttributeId::Password.uuid(), b"ABCDEFGH".to_vec())],
            "only the password should be written"
        );
        assert_eq!(log.scans, 2, "unlock and handoff scans expected");
        assert_eq!(log.uploads, 1, "one upload expected");
        assert_eq!(log.releases, 1, "upload should be released");
        assert_eq!(log.cancels, 0, "nothing should be cancelled");
        assert_eq!(report.progress, Some((1, 2)), "progress should be reported");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_upload_restarts_flow() {
        let (transport, log) = FakeTransport::new(full_table());
        let mut upload = fake_upload(&log, true);
        let mut image = vec![0xde, 0xad];
        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (_handle, cancel) = cancellation();
        let report = orchestrator
            .update_firmware(
                address(),
                "ABCDEFGH",
                &mut upload,
                &mut image,
                UploadSettings::default(),
                cancel,
            )
            .await;

        assert_eq!(
            report.result,
            Ok(Completion::FirmwareUpdated),
            "second upload should complete"
        );

        let log = log.borrow();

        assert_eq!(log.uploads, 2, "upload should be restarted once");
        assert_eq!(log.cancels, 1, "hung upload should be cancelled");
        assert_eq!(log.releases, 2, "both uploads should be released");
        assert_eq!(log.writes.len(), 2, "device should be unlocked twice");
        assert!(report.journal.mentions("no activity"), "restart journaled");
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn silent_upload_command_restarts_flow() {
        crate::tests::init_logger();

        let (transport, log) = FakeTransport::new(full_table());
        let mut upload =
            crate::external::CommandUploadTransport::new("sleep", ["30".to_string()]);
        let mut image = vec![0xde, 0xad];
        let timings = Timings {
            deadline: Duration::from_secs(40),
            ..Timings::default()
        };
        let mut orchestrator = Orchestrator::new(transport, timings);
        let (_handle, cancel) = cancellation();
        let report = orchestrator
            .update_firmware(
                address(),
                "ABCDEFGH",
                &mut upload,
                &mut image,
                UploadSettings::default(),
                cancel,
            )
            .await;

        assert!(
            matches!(report.result, Err(Error::DeadlineExceeded { .. })),
            "a silent command should never complete"
        );
        assert!(report.journal.mentions("no activity"), "hang should be detected");
        assert_eq!(
            log.borrow().writes.len(),
            2,
            "flow should restart once with a fresh unlock"
        );
        assert_eq!(report.progress, None, "nothing was reported");
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_image() {
        struct Missing;

        #[async_trait::async_trait(?Send)]
        impl ImageSource for Missing {
            async fn read(&mut self) -> std::io::Result<Vec<u8>> {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            }
        }

        let (transport, log) = FakeTransport::new(full_table());
        let mut upload = fake_upload(&log, false);
        let mut orchestrator = Orchestrator::new(transport, Timings::default());
        let (_handle, cancel) = cancellation();
        let report = orchestrator
            .update_firmware(
                address(),
                "ABCDEFGH",
                &mut upload,
                &mut Missing,
                UploadSettings::default(),
                cancel,
            )
            .await;

        assert_eq!(
            report.result,
            Err(Error::ImageUnreadable("gone".to_string())),
            "unreadable image should be terminal"
        );
        assert_eq!(log.borrow().uploads, 0, "upload should not start");
    }

    #[test]
    fn cancellation_pair() {
        let (handle, cancel) = cancellation();

        assert!(!cancel.is_cancelled(), "should start uncancelled");

        handle.cancel();
        handle.cancel();

        assert!(cancel.is_cancelled(), "should be cancelled");
    }
}
