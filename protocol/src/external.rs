//! Firmware upload through an external command.
//!
//! The command, e.g. the `mcumgr` CLI, owns the upload protocol. Its output
//! lines are forwarded as state changes, `sent/total` tokens and percentages
//! as progress, and its exit status decides the final outcome.

use crate::{
    address::DeviceAddress,
    config::UpgradeMode,
    transport::{Notifier, TransportError},
    upload::{UploadController, UploadEvent, UploadTransport},
};
use log::{debug, warn};
use std::{
    path::PathBuf,
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::oneshot,
    task::JoinHandle,
};

static NEXT_IMAGE: AtomicU64 = AtomicU64::new(0);

/// Extracts upload progress from an output line.
///
/// Recognizes `sent/total` tokens, e.g. `4096/65536`, and percentages,
/// e.g. `42.5%`, which are reported in tenths of a percent.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_progress(line: &str) -> Option<(u64, u64)> {
    line.split_whitespace().find_map(|token| {
        if let Some((sent, total)) = token.split_once('/') {
            let sent = sent.parse().ok()?;
            let total = total.parse().ok().filter(|&t| t > 0)?;

            return (sent <= total).then_some((sent, total));
        }

        let pct: f64 = token.strip_suffix('%')?.parse().ok()?;

        // Bounded to 0..=1000 before the cast
        (0.0..=100.0)
            .contains(&pct)
            .then(|| ((pct * 10.0).round() as u64, 1000))
    })
}

/// Upload transport spawning an external command.
///
/// Arguments may contain the placeholders `{address}`, `{image}`, `{mtu}`,
/// `{mode}` and `{timeout}`, which are substituted when the upload starts.
#[derive(Debug)]
pub struct CommandUploadTransport {
    program: String,
    args: Vec<String>,
    mtu: u16,
    mode: UpgradeMode,
    connection_timeout: Duration,
    image_path: Option<PathBuf>,
    task: Option<JoinHandle<()>>,
}

impl CommandUploadTransport {
    /// Constructs a transport running `program` with `args`.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            mtu: 247,
            mode: UpgradeMode::ConfirmOnly,
            connection_timeout: Duration::from_secs(15),
            image_path: None,
            task: None,
        }
    }

    /// Constructs a transport using the `mcumgr` CLI over BLE.
    #[must_use]
    pub fn mcumgr() -> Self {
        Self::new(
            "mcumgr",
            [
                "--conntype",
                "ble",
                "--connstring",
                "peer_id={address}",
                "--timeout",
                "{timeout}",
                "image",
                "upload",
                "{image}",
            ]
            .map(String::from),
        )
    }

    fn expand(&self, arg: &str, address: DeviceAddress, image: &str) -> String {
        arg.replace("{address}", &address.to_string())
            .replace("{image}", image)
            .replace("{mtu}", &self.mtu.to_string())
            .replace("{mode}", &self.mode.to_string())
            .replace("{timeout}", &self.connection_timeout.as_secs().to_string())
    }
}

#[async_trait::async_trait(?Send)]
impl UploadTransport for CommandUploadTransport {
    fn set_connection_timeout(&mut self, timeout: Duration) {
        self.connection_timeout = timeout;
    }

    fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    fn set_mode(&mut self, mode: UpgradeMode) {
        self.mode = mode;
    }

    async fn start(
        &mut self,
        address: DeviceAddress,
        image: Vec<u8>,
        notifier: Notifier,
    ) -> Result<Option<Box<dyn UploadController>>, TransportError> {
        let path = std::env::temp_dir().join(format!(
            "tagcheck-{}-{}.bin",
            std::process::id(),
            NEXT_IMAGE.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&path, &image).await?;

        let image_arg = path.display().to_string();
        let args: Vec<_> = self
            .args
            .iter()
            .map(|arg| self.expand(arg, address, &image_arg))
            .collect();

        debug!("Running {} {}", self.program, args.join(" "));

        self.image_path = Some(path);

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let task = tokio::spawn(supervise(child, self.program.clone(), notifier, cancel_rx));

        if let Some(stale) = self.task.replace(task) {
            stale.abort();
        }

        Ok(Some(Box::new(CommandController(Some(cancel_tx)))))
    }

    /// Waits for the command to exit, then removes the image.
    ///
    /// The controller has to be cancelled or dropped first.
    async fn release(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|err| TransportError::new(format!("upload task: {err}")))?;
        }

        if let Some(path) = self.image_path.take() {
            tokio::fs::remove_file(&path).await?;
        }

        Ok(())
    }
}

/// Forwards the output of a running upload command.
async fn supervise(
    mut child: Child,
    program: String,
    notifier: Notifier,
    mut cancel: oneshot::Receiver<()>,
) {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        notifier.upload(UploadEvent::Failed("output not captured".to_string()));

        return;
    };

    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let (mut out_open, mut err_open) = (true, true);
    let mut last_error = None;
    let mut started = false;

    while out_open || err_open {
        let line = tokio::select! {
            res = &mut cancel => {
                if let Err(err) = child.kill().await {
                    warn!("Failed to kill {program}: {err}");
                }

                // A dropped controller means the upload was released
                if res.is_ok() {
                    notifier.upload(UploadEvent::Canceled);
                }

                return;
            }
            line = stdout.next_line(), if out_open => match line {
                Ok(Some(line)) => line,
                _ => {
                    out_open = false;
                    continue;
                }
            },
            line = stderr.next_line(), if err_open => match line {
                Ok(Some(line)) => {
                    last_error = Some(line.clone());
                    line
                }
                _ => {
                    err_open = false;
                    continue;
                }
            },
        };

        // The upload counts as started once the command says anything
        if !started {
            started = true;
            notifier.upload(UploadEvent::Started);
        }

        let event = match parse_progress(&line) {
            Some((sent, total)) => UploadEvent::Progress { sent, total },
            None if line.trim().is_empty() => continue,
            None => UploadEvent::StateChanged(line.trim().to_string()),
        };

        notifier.upload(event);
    }

    let event = match child.wait().await {
        Ok(status) if status.success() => UploadEvent::Completed,
        Ok(status) => UploadEvent::Failed(match last_error {
            Some(msg) => format!("{program} exited with {status}: {msg}"),
            None => format!("{program} exited with {status}"),
        }),
        Err(err) => UploadEvent::Failed(err.to_string()),
    };

    notifier.upload(event);
}

#[derive(Debug)]
struct CommandController(Option<oneshot::Sender<()>>);

#[async_trait::async_trait(?Send)]
impl UploadController for CommandController {
    async fn cancel(&mut self) -> Result<(), TransportError> {
        self.0
            .take()
            .ok_or_else(|| TransportError::new("already cancelled"))?
            .send(())
            .map_err(|()| TransportError::new("upload already finished"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::{Event, Generation, Input},
        upload::{UploadSupervisor, Verdict},
    };
    use tokio::{sync::mpsc, time};

    #[test]
    fn progress_tokens() {
        assert_eq!(parse_progress("sent 4096/65536 bytes"), Some((4096, 65536)), "ratio");
        assert_eq!(parse_progress("[=====>    ] 42.5%"), Some((425, 1000)), "percentage");
        assert_eq!(parse_progress("image/bin uploaded"), None, "path is not progress");
        assert_eq!(parse_progress("5/0"), None, "zero total");
        assert_eq!(parse_progress("9/4"), None, "sent beyond total");
        assert_eq!(parse_progress("Connecting"), None, "plain state");
    }

    #[test]
    fn placeholders() {
        let mut transport = CommandUploadTransport::mcumgr();

        transport.set_connection_timeout(Duration::from_secs(20));

        let address = DeviceAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        assert_eq!(
            transport.expand("peer_id={address}", address, "/tmp/x.bin"),
            "peer_id=AA:BB:CC:DD:EE:FF",
            "address should be substituted"
        );
        assert_eq!(
            transport.expand("{timeout}:{mtu}:{mode}", address, ""),
            "20:247:confirm-only",
            "settings should be substituted"
        );
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<Input>) -> Vec<UploadEvent> {
        let mut events = Vec::new();

        while let Some(Input::Event {
            event: Event::Upload(event),
            ..
        }) = rx.recv().await
        {
            let done = event.is_terminal();

            events.push(event);

            if done {
                break;
            }
        }

        events
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command() -> Result<(), TransportError> {
        crate::tests::init_logger();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = CommandUploadTransport::new(
            "sh",
            ["-c", "echo Uploading; echo 10/20; echo 20/20"].map(String::from),
        );
        let address = DeviceAddress::new([0; 6]);

        let _controller = transport
            .start(address, vec![1, 2, 3], Notifier::new(Generation::default(), tx))
            .await?;

        assert_eq!(
            collect(rx).await,
            [
                UploadEvent::Started,
                UploadEvent::StateChanged("Uploading".to_string()),
                UploadEvent::Progress { sent: 10, total: 20 },
                UploadEvent::Progress { sent: 20, total: 20 },
                UploadEvent::Completed,
            ],
            "output should be forwarded in order"
        );

        transport.release().await
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command() -> Result<(), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport =
            CommandUploadTransport::new("sh", ["-c", "echo rejected >&2; exit 3"].map(String::from));
        let _controller = transport
            .start(
                DeviceAddress::new([0; 6]),
                Vec::new(),
                Notifier::new(Generation::default(), tx),
            )
            .await?;

        let events = collect(rx).await;

        assert!(
            matches!(events.last(), Some(UploadEvent::Failed(msg)) if msg.contains("rejected")),
            "failure should carry the last error line"
        );

        transport.release().await
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_command() -> Result<(), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = CommandUploadTransport::new("sleep", ["30".to_string()]);
        let mut controller = transport
            .start(
                DeviceAddress::new([0; 6]),
                Vec::new(),
                Notifier::new(Generation::default(), tx),
            )
            .await?
            .ok_or_else(|| TransportError::new("no controller"))?;

        controller.cancel().await?;

        assert_eq!(
            collect(rx).await,
            [UploadEvent::Canceled],
            "cancel should kill the command"
        );
        assert!(controller.cancel().await.is_err(), "second cancel should fail");

        let image = transport.image_path.clone();

        transport.release().await?;

        assert!(
            image.is_some_and(|path| !path.exists()),
            "image should be removed"
        );

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_command_shows_no_activity() -> Result<(), TransportError> {
        crate::tests::init_logger();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = CommandUploadTransport::new("sleep", ["30".to_string()]);
        let controller = transport
            .start(
                DeviceAddress::new([0; 6]),
                vec![0xde, 0xad],
                Notifier::new(Generation::default(), tx),
            )
            .await?;
        let mut supervisor = UploadSupervisor::new();

        while let Ok(Some(Input::Event {
            event: Event::Upload(event),
            ..
        })) = time::timeout(Duration::from_millis(300), rx.recv()).await
        {
            supervisor.observe(&event);
        }

        assert_eq!(
            supervisor.watchdog_expired(),
            Verdict::Hung,
            "a command without output should look hung"
        );

        drop(controller);
        transport.release().await?;

        assert_eq!(rx.recv().await, None, "command should be gone after release");

        Ok(())
    }

    #[tokio::test]
    async fn missing_program() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport = CommandUploadTransport::new("tagcheck-no-such-program", []);

        assert!(
            transport
                .start(
                    DeviceAddress::new([0; 6]),
                    Vec::new(),
                    Notifier::new(Generation::default(), tx),
                )
                .await
                .is_err(),
            "spawn failure should be reported"
        );

        let _ = transport.release().await;
    }
}
