//! The assay session: starting and aborting assays on the joystick
//! controller and draining finished trials into the ledger.
//!
//! The controller owns the real assay state machine. An [AssaySession] keeps
//! a local [SessionState] that follows it, together with the open ledger and
//! the poll thread. All three change together:
//!
//! - [AssaySession::start] uploads the schedule, opens the ledger and only
//!   arms the poll thread once the controller confirms the assay is running;
//! - every poll period the thread asks for the assay status, appends a row
//!   when the controller has unread trial data, and retires the session when
//!   the controller reports the assay finished;
//! - [AssaySession::abort], also run when the session is dropped, closes the
//!   ledger, stops the poll thread and tells the controller to stop.
//!
//! The poll thread runs one firing at a time and decides whether to wait for
//! another period only after the firing is done, so two firings never overlap.

use crate::device_client::{AssayState, AssayStatus, Block, DeviceClient, DeviceError};
use crate::ledger::{create_assay_directory, AssayMetadata, Ledger, LedgerError, LEDGER_VERSION};
use crate::schedule::{load_schedule, upload_schedule, ScheduleError, UploadError};
use crate::timestamp::{directory_name, now_epoch, TimestampError};
use crate::trial_record::TrialRecord;

use log::{debug, error, info, warn};
use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;

/// How often the controller is asked for finished trials.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(4);

/// Errors from starting an assay or draining its trials.
#[derive(Error, Debug)]
pub enum AssayError {
    /// The schedule file was rejected; nothing was sent to the controller.
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    /// The schedule could not be uploaded.
    #[error("schedule upload failed: {0}")]
    Upload(#[from] UploadError),

    /// Talking to the controller failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// The assay files could not be created or written.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The start time could not be formatted.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

/// Where assays are written and how often they are polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssayConfig {
    /// Directory that assay directories are created in
    pub base_dir: PathBuf,
    /// Time between two polls of the controller
    pub poll_period: Duration,
}

impl AssayConfig {
    /// `~/mouse_joystick`, or `./mouse_joystick` without a home directory.
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mouse_joystick")
    }
}

impl Default for AssayConfig {
    fn default() -> Self {
        Self {
            base_dir: Self::default_base_dir(),
            poll_period: DEFAULT_POLL_PERIOD,
        }
    }
}

/// Local view of the assay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No assay; nothing open, nothing polling.
    Idle,
    /// [AssaySession::start] is in progress.
    Starting,
    /// The controller confirmed the assay and the ledger is open.
    Running,
    /// [AssaySession::abort] is in progress.
    Aborting,
}

/// What [AssaySession::start] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The assay runs and writes into this directory.
    Started(PathBuf),
    /// An assay was already running; nothing changed.
    AlreadyRunning,
    /// The controller did not start the assay. The directory was created and
    /// its ledger closed again.
    Refused(PathBuf),
}

/// A snapshot of the session for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Local state
    pub state: SessionState,
    /// Directory of the current assay
    pub assay_dir: Option<PathBuf>,
    /// Rows appended to the current ledger
    pub rows_written: usize,
    /// The most recent controller status
    pub last_status: Option<AssayStatus>,
    /// Why the poll thread stopped early, if it did
    pub last_poll_error: Option<String>,
    /// Whether the poll thread is alive
    pub polling: bool,
}

struct Assay {
    dir: PathBuf,
    ledger: Ledger,
}

/// Everything the poll thread and the caller both touch, behind one lock.
struct Shared<D> {
    device: D,
    state: SessionState,
    assay: Option<Assay>,
    last_status: Option<AssayStatus>,
    last_poll_error: Option<String>,
}

impl<D> Shared<D> {
    /// Returns to `Idle` and closes the ledger.
    fn release(&mut self) {
        self.state = SessionState::Idle;
        if let Some(mut assay) = self.assay.take() {
            if let Err(e) = assay.ledger.close() {
                warn!("Failed to close ledger in '{}': {}", assay.dir.display(), e);
            }
        }
    }
}

struct PollTask {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

fn lock<D>(shared: &Mutex<Shared<D>>) -> MutexGuard<'_, Shared<D>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs assays on a joystick controller and records their trials.
pub struct AssaySession<D: DeviceClient + 'static> {
    shared: Arc<Mutex<Shared<D>>>,
    poll_task: Option<PollTask>,
    config: AssayConfig,
}

impl<D: DeviceClient + 'static> AssaySession<D> {
    /// Creates an idle session around the controller.
    pub fn new(device: D, config: AssayConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                device,
                state: SessionState::Idle,
                assay: None,
                last_status: None,
                last_poll_error: None,
            })),
            poll_task: None,
            config,
        }
    }

    /// Current local state.
    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    /// Whether an assay is running.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// A snapshot of the session.
    pub fn status(&self) -> SessionStatus {
        let shared = lock(&self.shared);
        SessionStatus {
            state: shared.state,
            assay_dir: shared.assay.as_ref().map(|a| a.dir.clone()),
            rows_written: shared.assay.as_ref().map_or(0, |a| a.ledger.rows()),
            last_status: shared.last_status.clone(),
            last_poll_error: shared.last_poll_error.clone(),
            polling: self
                .poll_task
                .as_ref()
                .is_some_and(|task| !task.handle.is_finished()),
        }
    }

    /// Runs `f` with exclusive access to the controller.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut lock(&self.shared).device)
    }

    /// Starts an assay with the schedule at `schedule_path`.
    ///
    /// Does nothing while an assay is running. Otherwise the schedule is
    /// validated, the controller clock set and the schedule uploaded; a
    /// failure up to here leaves no files and no poll thread behind. Then the
    /// assay directory and ledger are created and the controller is asked to
    /// start. The poll thread is armed only if the controller confirms.
    pub fn start(&mut self, schedule_path: impl AsRef<Path>) -> Result<StartOutcome, AssayError> {
        {
            let shared = lock(&self.shared);
            if matches!(shared.state, SessionState::Running | SessionState::Starting) {
                info!("Assay already running, start ignored");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        // A finished assay leaves its exited poll thread to be joined
        self.cancel_poll_task();

        let mut shared = lock(&self.shared);
        shared.state = SessionState::Starting;
        shared.last_status = None;
        shared.last_poll_error = None;

        let opened = open_assay(&mut shared.device, &self.config, schedule_path.as_ref());
        match opened {
            Ok(Opened::Running(assay)) => {
                let dir = assay.dir.clone();
                shared.assay = Some(assay);
                shared.state = SessionState::Running;
                drop(shared);
                self.arm_poll_task();
                info!("Assay started, writing to '{}'", dir.display());
                Ok(StartOutcome::Started(dir))
            }
            Ok(Opened::Refused(dir)) => {
                shared.state = SessionState::Idle;
                warn!("Controller did not start the assay");
                Ok(StartOutcome::Refused(dir))
            }
            Err(e) => {
                shared.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Stops the assay from any state.
    ///
    /// The ledger is closed and the poll thread stopped before this returns,
    /// so no further row is written. The controller is told to abort on a
    /// best-effort basis: a failure is logged and does not stop the cleanup.
    pub fn abort(&mut self) {
        {
            let mut shared = lock(&self.shared);
            shared.state = SessionState::Aborting;
            if let Err(e) = shared.device.abort_assay() {
                warn!("Controller abort failed, cleaning up anyway: {}", e);
            }
            shared.release();
        }
        self.cancel_poll_task();
        debug!("Session aborted");
    }

    /// Runs one poll immediately, outside the poll thread's schedule.
    /// Returns whether the assay is still running afterwards.
    pub fn check_for_data(&self) -> Result<bool, AssayError> {
        check_for_data(&mut lock(&self.shared))
    }

    fn arm_poll_task(&mut self) {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let period = self.config.poll_period;

        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(period) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            let mut guard = lock(&shared);
            match check_for_data(&mut guard) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("Polling stopped: {}", e);
                    guard.last_poll_error = Some(e.to_string());
                    break;
                }
            }
        });

        self.poll_task = Some(PollTask { stop, handle });
    }

    fn cancel_poll_task(&mut self) {
        if let Some(task) = self.poll_task.take() {
            let _ = task.stop.send(());
            if task.handle.join().is_err() {
                warn!("Poll thread panicked");
            }
        }
    }
}

impl<D: DeviceClient + 'static> Drop for AssaySession<D> {
    fn drop(&mut self) {
        self.abort();
    }
}

enum Opened {
    Running(Assay),
    Refused(PathBuf),
}

fn open_assay<D: DeviceClient>(
    device: &mut D,
    config: &AssayConfig,
    schedule_path: &Path,
) -> Result<Opened, AssayError> {
    let blocks: Vec<Block> = load_schedule(schedule_path)?;

    let started_at = now_epoch();
    device.set_time(started_at)?;
    upload_schedule(device, &blocks)?;

    let dir = create_assay_directory(&config.base_dir, started_at)?;
    let mut ledger = Ledger::create(&dir)?;
    AssayMetadata {
        ledger_version: LEDGER_VERSION,
        started_at: directory_name(started_at)?,
        controller: device.device_id().clone(),
        blocks,
    }
    .write(&dir)?;

    if !device.start_assay()? {
        ledger.close()?;
        return Ok(Opened::Refused(dir));
    }
    Ok(Opened::Running(Assay { dir, ledger }))
}

/// One poll firing. Returns whether the assay is still running.
fn check_for_data<D: DeviceClient>(shared: &mut Shared<D>) -> Result<bool, AssayError> {
    if shared.state != SessionState::Running {
        return Ok(false);
    }

    let status = shared.device.get_assay_status()?;
    if status.unread_trial_timing_data {
        let timing = shared.device.get_trial_timing_data()?;
        let record = TrialRecord::new(&status, timing);
        if let Some(assay) = shared.assay.as_mut() {
            assay.ledger.append(&record)?;
        }
        shared.device.set_time(now_epoch())?;
        debug!(
            "Recorded trial {} ({} successful)",
            status.finished_trial_count, status.successful_trial_count
        );
    }

    let finished = status.state == AssayState::Finished;
    shared.last_status = Some(status);
    if finished {
        info!("Controller reports the assay finished");
        shared.release();
        return Ok(false);
    }
    Ok(true)
}
