//! Link state machine.
//!
//! [`LinkMachine`] owns the scan, connect, discover, write/upload and
//! teardown lifecycle of one session. It is a pure transition function: it
//! consumes [`Input`]s and returns the [`Command`]s the driver has to
//! execute, without performing any I/O itself.
//!
//! Every attempt runs under its own [`Generation`]. Notifications and timers
//! are tagged with the generation that produced them and are ignored once
//! the machine has moved on.

use crate::{
    Error,
    attribute::{AttributeId, AttributeTable},
    codec::encode_password,
    config::{ConfigurationSnapshot, Timings},
    journal::Journal,
    plan::CommandPlan,
    sequencer::{Step, WriteSequencer},
    upload::{UploadEvent, UploadSupervisor, Verdict},
};
use core::fmt::{Display, Formatter};
use log::Level;
use std::{mem, time::Duration};
use tokio::time::Instant;

/// Tag identifying one connection attempt.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Default, Debug)]
pub struct Generation(u64);

impl Generation {
    /// Returns the following generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Timers scheduled by the machine.
#[derive(strum::Display, PartialEq, Eq, Hash, Copy, Clone, Debug)]
#[strum(serialize_all = "kebab-case")]
pub enum Timer {
    /// Scan ran too long without finding the peer.
    ScanTimeout,
    /// Fixed delay before the next attempt.
    Backoff,
    /// Delay between stopping the scan and connecting.
    ConnectSettle,
    /// Delay between unlocking and scanning for the upload.
    UnlockSettle,
    /// Delay between seeing the peer and starting the upload.
    UploadSettle,
    /// Upload liveness window.
    UploadWatchdog,
}

/// Asynchronous notification consumed by the machine.
#[derive(strum::IntoStaticStr, PartialEq, Eq, Clone, Debug)]
#[strum(serialize_all = "kebab-case")]
pub enum Event {
    /// The scan found the peer.
    PeerFound {
        /// Signal strength in dBm, if reported.
        rssi: Option<i16>,
    },
    /// The scan could not be started or broke down.
    ScanFailed(String),
    /// The link was established.
    Connected,
    /// The connect request failed.
    ConnectFailed(String),
    /// The link was lost.
    Disconnected,
    /// Attribute discovery succeeded.
    Discovered(AttributeTable),
    /// Attribute discovery failed.
    DiscoveryFailed(String),
    /// A write was acknowledged.
    WriteAcked(AttributeId),
    /// A write was not acknowledged.
    WriteFailed {
        /// Attribute that was written.
        attribute: AttributeId,
        /// Failure description.
        reason: String,
    },
    /// Upload lifecycle notification.
    Upload(UploadEvent),
    /// The upload transport declined to start.
    UploadRejected(String),
    /// The firmware image could not be read.
    ImageUnreadable(String),
    /// A scheduled timer fired.
    TimerFired(Timer),
}

/// Input of [`LinkMachine::handle`].
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Input {
    /// Begins the session.
    Start,
    /// Aborts the session.
    Cancel,
    /// A generation-tagged notification.
    Event {
        /// Generation that produced the event.
        generation: Generation,
        /// The event itself.
        event: Event,
    },
}

/// Side effect requested by the machine.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Command {
    /// Start scanning for the peer.
    StartScan(Generation),
    /// Stop a running scan.
    StopScan,
    /// Connect to the peer.
    Connect(Generation),
    /// Discover attributes on the live link.
    Discover(Generation),
    /// Write an attribute on the live link.
    Write {
        /// Generation of the link.
        generation: Generation,
        /// Attribute to write.
        attribute: AttributeId,
        /// Raw payload.
        payload: Vec<u8>,
    },
    /// Disconnect and release the live link, if any. Failures are ignored.
    Teardown,
    /// Fire `timer` after `delay`.
    Schedule {
        /// Timer to fire.
        timer: Timer,
        /// Delay from now.
        delay: Duration,
        /// Generation the timer belongs to.
        generation: Generation,
    },
    /// Cancel a pending timer.
    CancelTimer(Timer),
    /// Cancel every pending timer.
    CancelTimers,
    /// Read the image and start the upload.
    StartUpload(Generation),
    /// Cancel the running upload.
    CancelUpload,
    /// Release the upload transport.
    ReleaseUpload,
    /// The session is over.
    Finish(Result<Completion, Error>),
}

/// Successful session outcome.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Completion {
    /// Configuration writes were delivered.
    Configured {
        /// Number of acknowledged writes.
        written: usize,
        /// Number of requested fields that were not written.
        skipped: usize,
    },
    /// The firmware upload completed.
    FirmwareUpdated,
}

/// Sub-mode of [`State::Active`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Activity {
    /// Delivering a command plan.
    Writing,
    /// Supervising a firmware upload.
    Uploading,
}

/// State of the link lifecycle.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum State {
    /// No session activity.
    Idle,
    /// Scanning for the peer.
    Scanning,
    /// Waiting to connect, or connecting.
    Connecting,
    /// Discovering attributes.
    Discovering,
    /// Link is in use.
    Active(Activity),
    /// Link is being torn down.
    Closing,
    /// Waiting out the backoff before the next attempt.
    Retrying,
    /// The session deadline was exceeded.
    GivenUp,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting => write!(f, "connecting"),
            Self::Discovering => write!(f, "discovering"),
            Self::Active(Activity::Writing) => write!(f, "active (writing)"),
            Self::Active(Activity::Uploading) => write!(f, "active (uploading)"),
            Self::Closing => write!(f, "closing"),
            Self::Retrying => write!(f, "retrying"),
            Self::GivenUp => write!(f, "given up"),
        }
    }
}

/// What the session is for.
#[derive(Clone, Debug)]
pub enum Purpose {
    /// Deliver a configuration snapshot.
    Configure(ConfigurationSnapshot),
    /// Unlock the device, then upload firmware.
    Firmware {
        /// Password unlocking the device.
        password: String,
    },
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
enum Phase {
    Configure,
    Unlock,
    Handoff,
}

/// The link state machine of one session.
#[derive(Debug)]
pub struct LinkMachine {
    purpose: Purpose,
    timings: Timings,
    state: State,
    phase: Phase,
    generation: Generation,
    started: Option<Instant>,
    attempts: u32,
    table: AttributeTable,
    sequencer: Option<WriteSequencer>,
    plan_skipped: usize,
    supervisor: Option<UploadSupervisor>,
    progress: Option<(u64, u64)>,
    journal: Journal,
}

impl LinkMachine {
    /// Constructs an idle machine.
    #[must_use]
    pub fn new(purpose: Purpose, timings: Timings) -> Self {
        let phase = match purpose {
            Purpose::Configure(_) => Phase::Configure,
            Purpose::Firmware { .. } => Phase::Unlock,
        };

        Self {
            purpose,
            timings,
            state: State::Idle,
            phase,
            generation: Generation::default(),
            started: None,
            attempts: 0,
            table: AttributeTable::default(),
            sequencer: None,
            plan_skipped: 0,
            supervisor: None,
            progress: None,
            journal: Journal::new(),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns the current generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns the number of scan attempts so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the last upload progress as `(sent, total)`, across attempts.
    #[must_use]
    pub fn progress(&self) -> Option<(u64, u64)> {
        self.progress
    }

    /// Returns the session journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Consumes the machine, returning its journal.
    #[must_use]
    pub fn into_journal(self) -> Journal {
        self.journal
    }

    /// Appends a driver-side diagnostic to the journal.
    pub fn note(&mut self, now: Instant, level: Level, message: impl Into<String>) {
        let at = self.elapsed(now);

        self.journal.record(at, level, message);
    }

    /// Feeds one input to the machine.
    pub fn handle(&mut self, now: Instant, input: Input) -> Vec<Command> {
        match input {
            Input::Start => self.start(now),
            Input::Cancel => self.cancel(now),
            Input::Event { generation, event } if generation == self.generation => {
                self.event(now, event)
            }
            Input::Event { generation, event } => {
                let name: &str = (&event).into();

                self.note(
                    now,
                    Level::Debug,
                    format!("Ignoring stale {name} from attempt {generation}"),
                );

                Vec::new()
            }
        }
    }

    fn start(&mut self, now: Instant) -> Vec<Command> {
        if self.state != State::Idle || self.started.is_some() {
            self.note(now, Level::Debug, "Session already started");

            return Vec::new();
        }

        self.started = Some(now);

        let password = match &self.purpose {
            Purpose::Configure(snapshot) => &snapshot.password,
            Purpose::Firmware { password } => password,
        };

        if let Err(err) = encode_password(password) {
            self.note(now, Level::Error, format!("Invalid password: {err}"));

            return vec![Command::Finish(Err(Error::InvalidPassword(err)))];
        }

        let kind = match self.purpose {
            Purpose::Configure(_) => "configuration",
            Purpose::Firmware { .. } => "firmware update",
        };

        self.note(now, Level::Info, format!("Starting {kind} session"));

        self.begin_scan(now)
    }

    fn cancel(&mut self, now: Instant) -> Vec<Command> {
        if matches!(self.state, State::Idle | State::GivenUp) {
            self.note(now, Level::Debug, "Nothing to cancel");

            return Vec::new();
        }

        self.note(now, Level::Info, "Session cancelled");

        let mut cmds = self.teardown(now, true);

        cmds.push(self.close(now, Err(Error::Cancelled)));

        cmds
    }

    fn event(&mut self, now: Instant, event: Event) -> Vec<Command> {
        match (self.state, event) {
            (State::Scanning, Event::PeerFound { rssi }) => self.peer_found(now, rssi),
            (State::Scanning, Event::ScanFailed(reason)) => {
                self.retry(now, &format!("Scan failed: {reason}"))
            }
            (State::Connecting, Event::Connected) if self.phase != Phase::Handoff => {
                self.enter(now, State::Discovering);

                vec![Command::Discover(self.generation)]
            }
            (State::Connecting, Event::ConnectFailed(reason)) => {
                self.retry(now, &format!("Connect failed: {reason}"))
            }
            (
                State::Connecting | State::Discovering | State::Active(Activity::Writing),
                Event::Disconnected,
            ) => self.retry(now, "Link lost"),
            (State::Discovering, Event::Discovered(table)) => self.discovered(now, table),
            (State::Discovering, Event::DiscoveryFailed(reason)) => {
                self.retry(now, &format!("Discovery failed: {reason}"))
            }
            (State::Active(Activity::Writing), Event::WriteAcked(attribute)) => {
                self.write_acked(now, attribute)
            }
            (State::Active(Activity::Writing), Event::WriteFailed { attribute, reason }) => {
                self.retry(now, &format!("Write of {attribute} failed: {reason}"))
            }
            (State::Active(Activity::Uploading), Event::Upload(event)) => {
                self.upload_event(now, event)
            }
            (State::Active(Activity::Uploading), Event::UploadRejected(reason)) => {
                self.retry(now, &format!("Upload did not start: {reason}"))
            }
            (State::Active(Activity::Uploading), Event::ImageUnreadable(reason)) => {
                self.note(now, Level::Error, format!("Firmware image unreadable: {reason}"));

                let mut cmds = self.teardown(now, false);

                cmds.push(self.close(now, Err(Error::ImageUnreadable(reason))));

                cmds
            }
            (_, Event::TimerFired(timer)) => self.timer(now, timer),
            (state, event) => {
                let name: &str = (&event).into();

                self.note(now, Level::Debug, format!("Ignoring {name} while {state}"));

                Vec::new()
            }
        }
    }

    fn timer(&mut self, now: Instant, timer: Timer) -> Vec<Command> {
        match (timer, self.state, self.phase) {
            (Timer::ScanTimeout, State::Scanning, _) => self.retry(now, "Scan timed out"),
            (Timer::Backoff, State::Retrying, _) => {
                if self.deadline_passed(now) {
                    return self.give_up(now);
                }

                if self.phase == Phase::Handoff {
                    self.phase = Phase::Unlock;
                }

                self.begin_scan(now)
            }
            (Timer::ConnectSettle, State::Connecting, Phase::Configure | Phase::Unlock) => {
                self.note(now, Level::Debug, "Connecting");

                vec![Command::Teardown, Command::Connect(self.generation)]
            }
            (Timer::UnlockSettle, State::Closing, Phase::Handoff) => self.begin_scan(now),
            (Timer::UploadSettle, State::Connecting, Phase::Handoff) => self.start_upload(now),
            (Timer::UploadWatchdog, State::Active(Activity::Uploading), _) => {
                self.watchdog(now)
            }
            (timer, state, _) => {
                self.note(
                    now,
                    Level::Debug,
                    format!("Ignoring {timer} timer while {state}"),
                );

                Vec::new()
            }
        }
    }

    fn begin_scan(&mut self, now: Instant) -> Vec<Command> {
        self.attempts += 1;
        self.table = AttributeTable::default();
        self.sequencer = None;

        self.enter(now, State::Scanning);
        self.note(
            now,
            Level::Info,
            format!("Scanning, attempt {} ({})", self.attempts, self.generation),
        );

        vec![
            Command::Teardown,
            Command::StartScan(self.generation),
            self.schedule(Timer::ScanTimeout, self.timings.scan_timeout),
        ]
    }

    fn peer_found(&mut self, now: Instant, rssi: Option<i16>) -> Vec<Command> {
        match rssi {
            Some(rssi) => self.note(now, Level::Info, format!("Found peer ({rssi} dBm)")),
            None => self.note(now, Level::Info, "Found peer"),
        }

        self.enter(now, State::Connecting);

        let settle = if self.phase == Phase::Handoff {
            self.schedule(Timer::UploadSettle, self.timings.upload_settle)
        } else {
            self.schedule(Timer::ConnectSettle, self.timings.connect_settle)
        };

        vec![Command::CancelTimer(Timer::ScanTimeout), Command::StopScan, settle]
    }

    fn discovered(&mut self, now: Instant, table: AttributeTable) -> Vec<Command> {
        self.note(
            now,
            Level::Debug,
            format!("Discovered {} attributes", table.len()),
        );

        if self.phase == Phase::Unlock && !table.contains(AttributeId::Password) {
            return self.retry(now, "Peer does not expose the password attribute");
        }

        let plan = match &self.purpose {
            Purpose::Configure(snapshot) => CommandPlan::build(snapshot),
            Purpose::Firmware { password } => CommandPlan::unlock(password),
        };

        match plan {
            Ok(plan) => {
                self.plan_skipped = plan.skipped().len();
                self.note(now, Level::Info, format!("Writing {} attributes", plan.len()));
                self.table = table;
                self.sequencer = Some(WriteSequencer::new(plan));
                self.enter(now, State::Active(Activity::Writing));
                self.next_write(now)
            }
            Err(err) => {
                self.note(now, Level::Error, format!("Invalid password: {err}"));

                let mut cmds = self.teardown(now, false);

                cmds.push(self.close(now, Err(Error::InvalidPassword(err))));

                cmds
            }
        }
    }

    fn write_acked(&mut self, now: Instant, attribute: AttributeId) -> Vec<Command> {
        let (pending, remaining) = self
            .sequencer
            .as_ref()
            .map_or((None, 0), |seq| (seq.pending(), seq.remaining()));

        if pending != Some(attribute) {
            self.note(
                now,
                Level::Debug,
                format!("Ignoring acknowledgment of {attribute}, no such write in flight"),
            );

            return Vec::new();
        }

        self.note(now, Level::Debug, format!("Wrote {attribute}, {remaining} left"));
        self.next_write(now)
    }

    fn next_write(&mut self, now: Instant) -> Vec<Command> {
        let step = self.sequencer.as_mut().map(|seq| match seq.advance(&self.table) {
            Step::Write(entry) => Some(entry.clone()),
            Step::Done => None,
        });

        if let Some(Some(entry)) = step {
            return vec![Command::Write {
                generation: self.generation,
                attribute: entry.attribute,
                payload: entry.payload,
            }];
        }

        let (written, missing) = self
            .sequencer
            .as_ref()
            .map_or((0, 0), |seq| (seq.written(), seq.skipped().len()));

        if self.phase == Phase::Unlock {
            return self.unlocked(now);
        }

        let skipped = self.plan_skipped + missing;

        self.note(
            now,
            Level::Info,
            format!("Configuration complete, {written} written, {skipped} skipped"),
        );

        let mut cmds = self.teardown(now, false);

        cmds.push(self.close(now, Ok(Completion::Configured { written, skipped })));

        cmds
    }

    fn unlocked(&mut self, now: Instant) -> Vec<Command> {
        self.note(now, Level::Info, "Device unlocked");

        let mut cmds = self.teardown(now, false);

        self.enter(now, State::Closing);
        self.phase = Phase::Handoff;
        self.generation = self.generation.next();

        cmds.push(self.schedule(Timer::UnlockSettle, self.timings.unlock_settle));

        cmds
    }

    fn start_upload(&mut self, now: Instant) -> Vec<Command> {
        self.enter(now, State::Active(Activity::Uploading));
        self.note(now, Level::Info, "Starting firmware upload");

        self.supervisor = Some(UploadSupervisor::new());

        vec![
            self.schedule(Timer::UploadWatchdog, self.timings.upload_watchdog),
            Command::StartUpload(self.generation),
        ]
    }

    fn upload_event(&mut self, now: Instant, event: UploadEvent) -> Vec<Command> {
        if let Some(supervisor) = &mut self.supervisor {
            supervisor.observe(&event);
            self.progress = supervisor.progress().or(self.progress);
        }

        let result = match event {
            UploadEvent::Completed => Ok(Completion::FirmwareUpdated),
            UploadEvent::Canceled => Err(Error::UploadCanceled),
            UploadEvent::Failed(reason) => Err(Error::UploadFailed(reason)),
            event => {
                let level = if matches!(event, UploadEvent::Progress { .. }) {
                    Level::Debug
                } else {
                    Level::Info
                };

                self.note(now, level, format!("Firmware {event}"));

                return Vec::new();
            }
        };

        match &result {
            Ok(_) => self.note(now, Level::Info, "Firmware upload completed"),
            Err(err) => self.note(now, Level::Error, err.to_string()),
        }

        let mut cmds = self.teardown(now, false);

        cmds.push(self.close(now, result));

        cmds
    }

    fn watchdog(&mut self, now: Instant) -> Vec<Command> {
        let verdict = self
            .supervisor
            .as_ref()
            .map_or(Verdict::Hung, UploadSupervisor::watchdog_expired);

        match verdict {
            Verdict::Hung => self.retry(now, "Upload showed no activity, restarting"),
            Verdict::Alive => {
                let seen = self
                    .supervisor
                    .as_ref()
                    .map_or(0, UploadSupervisor::notifications);

                self.note(
                    now,
                    Level::Debug,
                    format!("Upload watchdog expired, upload is alive after {seen} notifications"),
                );

                Vec::new()
            }
        }
    }

    /// The single retry decision point.
    fn retry(&mut self, now: Instant, reason: &str) -> Vec<Command> {
        self.note(now, Level::Warn, reason);

        let mut cmds = self.teardown(now, true);

        self.generation = self.generation.next();

        if self.deadline_passed(now) {
            cmds.extend(self.give_up(now));

            return cmds;
        }

        self.enter(now, State::Retrying);

        cmds.push(self.schedule(Timer::Backoff, self.timings.backoff));

        cmds
    }

    fn give_up(&mut self, now: Instant) -> Vec<Command> {
        self.note(
            now,
            Level::Error,
            format!("Deadline exceeded after {} attempts", self.attempts),
        );
        self.enter(now, State::GivenUp);

        vec![Command::Finish(Err(Error::DeadlineExceeded {
            attempts: self.attempts,
        }))]
    }

    /// Releases everything held by the current attempt.
    fn teardown(&mut self, now: Instant, cancel_upload: bool) -> Vec<Command> {
        let mut cmds = vec![Command::CancelTimers];

        if self.state == State::Scanning {
            cmds.push(Command::StopScan);
        }

        if self.supervisor.take().is_some() {
            if cancel_upload {
                cmds.push(Command::CancelUpload);
            }

            cmds.push(Command::ReleaseUpload);
        }

        cmds.push(Command::Teardown);

        self.sequencer = None;
        self.enter(now, State::Closing);

        cmds
    }

    fn close(&mut self, now: Instant, result: Result<Completion, Error>) -> Command {
        self.generation = self.generation.next();
        self.enter(now, State::Idle);

        Command::Finish(result)
    }

    fn schedule(&self, timer: Timer, delay: Duration) -> Command {
        Command::Schedule {
            timer,
            delay,
            generation: self.generation,
        }
    }

    fn enter(&mut self, now: Instant, state: State) {
        let prev = mem::replace(&mut self.state, state);

        if prev != state {
            self.note(now, Level::Trace, format!("State {prev} -> {state}"));
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start))
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.timings.deadline
    }
}
