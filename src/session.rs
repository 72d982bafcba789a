//! The session lifecycle: scan, connect, discover, ready, disconnect.
//!
//! A [`Session`] is an owned handle to a background actor task that holds
//! every piece of mutable engine state (battery model, parameter table,
//! auth state machine, write queue, reassembler and all timers). Transport
//! callbacks, timers and public commands all funnel into the actor's single
//! select loop, so no state is ever touched from two tasks at once; the
//! only discipline the handlers need is re-entrancy safety across their own
//! `await` points.
//!
//! Observers consume two channels: a `watch` carrying the latest
//! [`Snapshot`] (one consolidated update per decoded line, never one per
//! token) and a `broadcast` of transient [`Notice`]s for toast-style UI.
//! A slow or failed observer cannot block delivery to the others.

use crate::auth::{self, AuthSession, ResponseAction, SubmitAction};
use crate::battery::BatteryState;
use crate::codec;
use crate::error::Error;
use crate::params::{Parameter, ParameterTable};
use crate::protocol::{self, ChemistryPreset, LineEvent};
use crate::queue::{Priority, WriteQueue, HEARTBEAT_INTERVAL};
use crate::reassembler::{LineReassembler, FLUSH_TIMEOUT};
use crate::transport::{DiscoveredDevice, Link, Transport};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

/// How long a scan runs before it is stopped automatically.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
/// Settling time between entering `Ready` and arming the heartbeat.
const STABILIZATION_DELAY: Duration = Duration::from_secs(2);

/// Where the session is in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnecting,
    Disconnected { error: Option<String> },
}

impl SessionState {
    /// Whether a link is (being) established, i.e. the corrected
    /// `connected && peripheral` disconnect guard holds.
    fn has_link(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::DiscoveringServices | SessionState::Ready
        )
    }
}

/// Transient, toast-style notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// A command was written and confirmed.
    CommandSent,
    /// A command write failed or timed out.
    CommandFailed,
    /// A command was rejected because the session is not `Ready`.
    NotReady,
    /// A privileged command was rejected; the password must be verified.
    PleaseVerifyPassword,
    PasswordVerified,
    PasswordAlreadyVerified,
    PasswordError,
    /// The 4-minute verification window lapsed.
    PasswordExpired,
    PasswordChanged,
    /// The device acknowledged a restart.
    Restarted,
    DeviceRenamed,
}

/// Flattened view of the engine pushed to observers. This is the only data
/// the core exposes to the rest of the application.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: SessionState,
    pub scanning: bool,
    pub discovered: Vec<DiscoveredDevice>,
    pub device_id: Option<String>,
    pub device_name: String,
    pub battery: BatteryState,
    pub parameters: ParameterTable,
    pub password_verified: bool,
    /// Firmware version, once the device has echoed `ver`.
    pub firmware_version: Option<String>,
    /// Why the charge MOS was last closed, as a stable label.
    pub cd_close_status: Option<&'static str>,
    /// Why the discharge MOS was last closed, as a stable label.
    pub fd_close_status: Option<&'static str>,
    /// Last connection-level problem; cleared on the next success.
    pub last_error: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            scanning: false,
            discovered: Vec::new(),
            device_id: None,
            device_name: String::new(),
            battery: BatteryState::new(),
            parameters: ParameterTable::new(),
            password_verified: false,
            firmware_version: None,
            cd_close_status: None,
            fd_close_status: None,
            last_error: None,
        }
    }
}

enum Op {
    StartScan,
    StopScan,
    SelectDevice(String),
    Disconnect,
    VerifyPassword(String),
    ChangePassword(String),
    ReadParameters,
    Refresh,
    StartCharging,
    StopCharging,
    StartDischarging,
    StopDischarging,
    SetChemistry(ChemistryPreset),
    OneKeyBalance,
    Restart,
    ResetCurrent,
    SetAnalog(Parameter, f64),
    SetInteger(Parameter, u8),
    Rename(String),
    SendRaw(Vec<u8>),
}

/// Handle to a running session engine.
///
/// Construct one per physical connection domain with [`Session::spawn`];
/// there is deliberately no global instance. Dropping the last handle shuts
/// the engine down, cancelling every timer and pending write.
#[derive(Clone)]
pub struct Session {
    ops: mpsc::UnboundedSender<Op>,
    snapshot: watch::Receiver<Snapshot>,
    notices: broadcast::Sender<Notice>,
}

impl Session {
    /// Start the engine actor on the current tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let (notices_tx, _) = broadcast::channel(64);

        let task = SessionTask {
            transport,
            ops: ops_rx,
            snapshot_tx,
            notices: notices_tx.clone(),
            state: SessionState::Idle,
            scanning: false,
            scan_stream: None,
            scan_deadline: None,
            discovered: Vec::new(),
            link: None,
            notifications: None,
            queue: WriteQueue::new(),
            auth: AuthSession::new(),
            battery: BatteryState::new(),
            params: ParameterTable::new(),
            reassembler: LineReassembler::new(),
            flush_deadline: None,
            heartbeat_arm_deadline: None,
            auth_expiry_deadline: None,
            gzys_deadline: None,
            device_id: None,
            device_name: String::new(),
            last_error: None,
        };
        tokio::spawn(task.run());

        Self {
            ops: ops_tx,
            snapshot: snapshot_rx,
            notices: notices_tx,
        }
    }

    /// Watch channel carrying the latest [`Snapshot`].
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to transient notices.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// The most recent snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn start_scan(&self) {
        self.send(Op::StartScan);
    }

    pub fn stop_scan(&self) {
        self.send(Op::StopScan);
    }

    /// Connect to a device discovered by the current or a previous scan.
    /// Scanning is not stopped implicitly; it ends on its own timeout.
    pub fn select_device(&self, device_id: impl Into<String>) {
        self.send(Op::SelectDevice(device_id.into()));
    }

    pub fn disconnect(&self) {
        self.send(Op::Disconnect);
    }

    /// Submit the device password. Progress is reported via notices and the
    /// `password_verified` snapshot field.
    pub fn verify_password(&self, password: impl Into<String>) {
        self.send(Op::VerifyPassword(password.into()));
    }

    pub fn change_password(&self, new_password: impl Into<String>) {
        self.send(Op::ChangePassword(new_password.into()));
    }

    /// Request a dump of every parameter echo.
    pub fn read_parameters(&self) {
        self.send(Op::ReadParameters);
    }

    /// One-shot telemetry poll, independent of the heartbeat.
    pub fn refresh(&self) {
        self.send(Op::Refresh);
    }

    pub fn start_charging(&self) {
        self.send(Op::StartCharging);
    }

    pub fn stop_charging(&self) {
        self.send(Op::StopCharging);
    }

    pub fn start_discharging(&self) {
        self.send(Op::StartDischarging);
    }

    pub fn stop_discharging(&self) {
        self.send(Op::StopDischarging);
    }

    /// Apply a one-command battery chemistry preset.
    pub fn set_chemistry(&self, preset: ChemistryPreset) {
        self.send(Op::SetChemistry(preset));
    }

    pub fn one_key_balance(&self) {
        self.send(Op::OneKeyBalance);
    }

    pub fn restart_device(&self) {
        self.send(Op::Restart);
    }

    /// Zero the device's current measurement.
    pub fn reset_current(&self) {
        self.send(Op::ResetCurrent);
    }

    /// Write an analog parameter (encoded as value x 10, 16-bit big-endian).
    pub fn set_analog_parameter(&self, param: Parameter, value: f64) {
        self.send(Op::SetAnalog(param, value));
    }

    /// Write an integer parameter (encoded as a single hex byte).
    pub fn set_integer_parameter(&self, param: Parameter, value: u8) {
        self.send(Op::SetInteger(param, value));
    }

    /// Rename the device. The name takes effect on the next connection, so
    /// the session disconnects after the command is sent.
    pub fn rename_device(&self, name: impl Into<String>) {
        self.send(Op::Rename(name.into()));
    }

    /// Write a raw payload (privileged).
    pub fn send_raw(&self, payload: Vec<u8>) {
        self.send(Op::SendRaw(payload));
    }

    fn send(&self, op: Op) {
        // Failure means the actor is gone; commands are then no-ops.
        let _ = self.ops.send(op);
    }
}

struct SessionTask {
    transport: Arc<dyn Transport>,
    ops: mpsc::UnboundedReceiver<Op>,
    snapshot_tx: watch::Sender<Snapshot>,
    notices: broadcast::Sender<Notice>,

    state: SessionState,
    scanning: bool,
    scan_stream: Option<BoxStream<'static, DiscoveredDevice>>,
    scan_deadline: Option<Instant>,
    discovered: Vec<DiscoveredDevice>,

    link: Option<Box<dyn Link>>,
    notifications: Option<BoxStream<'static, crate::error::Result<Vec<u8>>>>,
    queue: WriteQueue,
    auth: AuthSession,
    battery: BatteryState,
    params: ParameterTable,
    reassembler: LineReassembler,

    flush_deadline: Option<Instant>,
    heartbeat_arm_deadline: Option<Instant>,
    auth_expiry_deadline: Option<Instant>,
    gzys_deadline: Option<Instant>,

    device_id: Option<String>,
    device_name: String,
    last_error: Option<String>,
}

/// Await the next item of an optional stream, pending forever when absent.
async fn next_item<T>(stream: &mut Option<BoxStream<'static, T>>) -> Option<T> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Sleep until an optional deadline, pending forever when disarmed.
async fn at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(op) => self.handle_op(op).await,
                    None => break,
                },
                adv = next_item(&mut self.scan_stream) => match adv {
                    Some(adv) => self.on_advertisement(adv),
                    None => self.on_scan_ended(),
                },
                chunk = next_item(&mut self.notifications) => match chunk {
                    Some(Ok(data)) => self.on_chunk(&data),
                    Some(Err(err)) => self.teardown(Some(err.to_string())).await,
                    None => self.teardown(Some(Error::Disconnected.to_string())).await,
                },
                _ = at(self.scan_deadline) => self.on_scan_timeout(),
                _ = at(self.flush_deadline) => self.on_flush_timeout(),
                _ = at(self.heartbeat_arm_deadline) => self.on_stabilized(),
                _ = at(self.auth_expiry_deadline) => self.on_auth_expired(),
                _ = at(self.gzys_deadline) => self.on_gzys_tick(),
            }
        }
        // Handle dropped: universal cancellation path.
        self.teardown(None).await;
        self.stop_scanning();
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::StartScan => self.start_scan().await,
            Op::StopScan => {
                self.stop_scanning();
                self.publish();
            }
            Op::SelectDevice(id) => self.connect(id).await,
            Op::Disconnect => {
                if self.state.has_link() && self.link.is_some() {
                    self.teardown(None).await;
                    self.stop_scanning();
                    self.publish();
                } else {
                    debug!("disconnect requested without a link; ignoring");
                }
            }
            Op::VerifyPassword(password) => match self.auth.submit(&password) {
                SubmitAction::AlreadyVerified => self.notify(Notice::PasswordAlreadyVerified),
                SubmitAction::Send(command) => self.send_command(&command, Priority::High),
            },
            Op::ChangePassword(password) => {
                let command = protocol::password_command(&password);
                self.send_with_notice(&command, Priority::Normal, Notice::PasswordChanged);
            }
            Op::ReadParameters => self.send_command(protocol::READ_PARAMETERS, Priority::Low),
            Op::Refresh => self.send_command(protocol::POLL, Priority::Normal),
            Op::StartCharging => self.send_privileged(protocol::CHARGE_OPEN),
            Op::StopCharging => self.send_privileged(protocol::CHARGE_CLOSE),
            Op::StartDischarging => self.send_privileged(protocol::DISCHARGE_OPEN),
            Op::StopDischarging => self.send_privileged(protocol::DISCHARGE_CLOSE),
            Op::SetChemistry(preset) => self.send_privileged(preset.command()),
            Op::OneKeyBalance => self.send_privileged(protocol::ONE_KEY_BALANCE),
            Op::Restart => self.send_privileged(protocol::RESTART),
            Op::ResetCurrent => self.send_privileged(protocol::RESET_CURRENT),
            Op::SetAnalog(param, value) => {
                let command = protocol::analog_command(param, value);
                self.send_privileged(&command);
            }
            Op::SetInteger(param, value) => {
                let command = protocol::integer_command(param, value);
                self.send_privileged(&command);
            }
            Op::Rename(name) => self.rename(name).await,
            Op::SendRaw(payload) => {
                if self.guard() {
                    self.enqueue_with_notice(payload, Priority::Normal, Notice::CommandSent);
                }
            }
        }
    }

    // ---- scanning -------------------------------------------------------

    async fn start_scan(&mut self) {
        if self.state.has_link() {
            debug!("already connected; not scanning");
            return;
        }
        // Each scan starts from a clean slate, replacing any running scan.
        self.stop_scanning();
        self.discovered.clear();
        self.publish();

        if let Err(err) = self.transport.ready().await {
            self.fail_scan(err);
            return;
        }
        match self.transport.scan().await {
            Ok(stream) => {
                info!("scan started");
                self.scan_stream = Some(stream);
                self.scanning = true;
                self.scan_deadline = Some(Instant::now() + SCAN_TIMEOUT);
                if self.state == SessionState::Idle || matches!(self.state, SessionState::Disconnected { .. }) {
                    self.state = SessionState::Scanning;
                }
                self.last_error = None;
                self.publish();
            }
            Err(err) => self.fail_scan(err),
        }
    }

    fn fail_scan(&mut self, err: Error) {
        warn!("scan failed: {err}");
        self.last_error = Some(err.to_string());
        self.scanning = false;
        self.publish();
    }

    fn on_advertisement(&mut self, device: DiscoveredDevice) {
        if device.name.trim().is_empty() {
            return;
        }
        if self.discovered.iter().any(|d| d.id == device.id) {
            return;
        }
        // Named devices go to the front of the list, unknowns to the back.
        if device.name.to_lowercase().contains("unknown") {
            self.discovered.push(device);
        } else {
            self.discovered.insert(0, device);
        }
        self.publish();
    }

    fn on_scan_timeout(&mut self) {
        info!("scan timeout; stopping");
        self.stop_scanning();
        self.publish();
    }

    fn on_scan_ended(&mut self) {
        debug!("scan stream ended");
        self.stop_scanning();
        self.publish();
    }

    fn stop_scanning(&mut self) {
        self.scan_stream = None;
        self.scan_deadline = None;
        self.scanning = false;
        if self.state == SessionState::Scanning {
            self.state = SessionState::Idle;
        }
    }

    // ---- connecting -----------------------------------------------------

    async fn connect(&mut self, device_id: String) {
        if self.state.has_link() {
            warn!("connect requested while a link exists; ignoring");
            return;
        }
        self.state = SessionState::Connecting;
        self.publish();

        let link = match self.transport.connect(&device_id).await {
            Ok(link) => link,
            Err(err) => {
                warn!("connect failed: {err}");
                self.last_error = Some(err.to_string());
                self.state = SessionState::Disconnected { error: Some(err.to_string()) };
                self.publish();
                return;
            }
        };

        self.state = SessionState::DiscoveringServices;
        self.publish();

        let endpoints = match link.endpoints().await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                // Missing service or characteristic is fatal for the attempt.
                warn!("service discovery failed: {err}");
                let _ = link.disconnect().await;
                self.last_error = Some(err.to_string());
                self.state = SessionState::Disconnected { error: Some(err.to_string()) };
                self.publish();
                return;
            }
        };

        self.device_name = self
            .discovered
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| d.name.clone())
            .unwrap_or_default();
        self.device_id = Some(device_id);
        self.link = Some(link);
        self.notifications = Some(endpoints.notifications);
        self.queue.set_target(endpoints.write);
        self.auth.reset();
        self.state = SessionState::Ready;
        self.last_error = None;
        info!("connected to {}", self.device_name);

        // Initial parameter read, then the heartbeat once the link settles.
        self.send_command(protocol::READ_PARAMETERS, Priority::Low);
        self.heartbeat_arm_deadline = Some(Instant::now() + STABILIZATION_DELAY);
        self.publish();
    }

    fn on_stabilized(&mut self) {
        self.heartbeat_arm_deadline = None;
        self.queue
            .set_heartbeat(Some(codec::encode(protocol::POLL)), HEARTBEAT_INTERVAL);
    }

    /// Tear down the connection: queue, auth, timers, handles. Reconnection
    /// is always an explicit caller action, never automatic.
    async fn teardown(&mut self, error: Option<String>) {
        self.queue.dispose();
        self.auth.reset();
        self.reassembler.clear();
        self.flush_deadline = None;
        self.heartbeat_arm_deadline = None;
        self.auth_expiry_deadline = None;
        self.gzys_deadline = None;
        self.battery.gzys = 0;
        self.notifications = None;
        self.device_id = None;

        if let Some(link) = self.link.take() {
            self.state = SessionState::Disconnecting;
            self.publish();
            if let Err(err) = link.disconnect().await {
                debug!("disconnect failed: {err}");
            }
            info!("disconnected");
        }
        if error.is_some() {
            self.last_error = error.clone();
        }
        self.state = SessionState::Disconnected { error };
        self.publish();
    }

    // ---- inbound data ---------------------------------------------------

    fn on_chunk(&mut self, data: &[u8]) {
        for line in self.reassembler.push(data) {
            self.process_line(&line);
        }
        self.flush_deadline = self
            .reassembler
            .has_pending()
            .then(|| Instant::now() + FLUSH_TIMEOUT);
    }

    fn on_flush_timeout(&mut self) {
        self.flush_deadline = None;
        if let Some(line) = self.reassembler.flush() {
            debug!("flushing stale partial line");
            self.process_line(&line);
        }
    }

    fn process_line(&mut self, line: &str) {
        let events = protocol::decode_line(line, &mut self.battery, &mut self.params);
        for event in events {
            match event {
                LineEvent::Auth(response) => self.on_auth_response(response),
                LineEvent::Restarted => self.notify(Notice::Restarted),
                LineEvent::FaultDelaySeeded(seconds) => {
                    self.battery.gzys = seconds;
                    self.gzys_deadline = Some(Instant::now() + Duration::from_secs(1));
                }
            }
        }
        // One consolidated notification per line, however many fields moved.
        self.publish();
    }

    fn on_auth_response(&mut self, response: protocol::AuthResponse) {
        match self.auth.on_response(response) {
            ResponseAction::Resubmit(command) => self.send_command(&command, Priority::High),
            ResponseAction::Verified => {
                self.auth_expiry_deadline = Some(Instant::now() + auth::EXPIRY);
                self.last_error = None;
                self.notify(Notice::PasswordVerified);
            }
            ResponseAction::Failed => {
                self.auth_expiry_deadline = None;
                self.last_error = Some("password verification failed".to_owned());
                self.notify(Notice::PasswordError);
            }
            ResponseAction::None => {}
        }
    }

    fn on_auth_expired(&mut self) {
        self.auth_expiry_deadline = None;
        self.auth.on_expiry();
        self.notify(Notice::PasswordExpired);
        self.publish();
    }

    fn on_gzys_tick(&mut self) {
        self.battery.gzys = self.battery.gzys.saturating_sub(1);
        self.gzys_deadline = (self.battery.gzys > 0).then(|| Instant::now() + Duration::from_secs(1));
        self.publish();
    }

    // ---- outbound commands ----------------------------------------------

    /// Reject privileged commands until the password is verified.
    fn guard(&self) -> bool {
        if !self.auth.guard() {
            self.notify(Notice::PleaseVerifyPassword);
            return false;
        }
        true
    }

    fn send_privileged(&mut self, command: &str) {
        if self.guard() {
            self.send_command(command, Priority::High);
        }
    }

    fn send_command(&mut self, command: &str, priority: Priority) {
        // Polls are deliberately silent; everything else reports its
        // outcome as a notice.
        if command.starts_with(protocol::POLL) {
            self.enqueue_quiet(codec::encode(command), priority);
        } else {
            self.enqueue_with_notice(codec::encode(command), priority, Notice::CommandSent);
        }
    }

    fn send_with_notice(&mut self, command: &str, priority: Priority, success: Notice) {
        self.enqueue_with_notice(codec::encode(command), priority, success);
    }

    fn enqueue_quiet(&mut self, payload: Vec<u8>, priority: Priority) {
        if !self.ready_to_send() {
            return;
        }
        drop(self.queue.enqueue(payload, priority));
    }

    fn enqueue_with_notice(&mut self, payload: Vec<u8>, priority: Priority, success: Notice) {
        if !self.ready_to_send() {
            return;
        }
        let receipt = self.queue.enqueue(payload, priority);
        let notices = self.notices.clone();
        // Resolved off the main loop so a slow write never stalls it.
        tokio::spawn(async move {
            let notice = if receipt.wait().await { success } else { Notice::CommandFailed };
            let _ = notices.send(notice);
        });
    }

    fn ready_to_send(&self) -> bool {
        if self.state != SessionState::Ready || !self.queue.has_target() {
            warn!("command rejected: session not ready");
            self.notify(Notice::NotReady);
            return false;
        }
        true
    }

    async fn rename(&mut self, name: String) {
        if !self.ready_to_send() {
            return;
        }
        let command = protocol::rename_command(&name);
        let sent = self.queue.write(codec::encode(&command), Priority::Normal).await;
        // The local name is updated either way; the device applies it on
        // the next connection.
        self.device_name = name;
        self.notify(if sent { Notice::DeviceRenamed } else { Notice::CommandFailed });
        // The new identity only takes effect on reconnect.
        self.teardown(None).await;
    }

    // ---- observers ------------------------------------------------------

    fn notify(&self, notice: Notice) {
        // No receivers is fine; notices are fire-and-forget.
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.clone(),
            scanning: self.scanning,
            discovered: self.discovered.clone(),
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            battery: self.battery.clone(),
            parameters: self.params.clone(),
            password_verified: self.auth.verified(),
            firmware_version: self
                .params
                .get(Parameter::FirmwareVersion)
                .map(str::to_owned),
            cd_close_status: self.battery.cd_close_fault.map(|f| f.label()),
            fd_close_status: self.battery.fd_close_fault.map(|f| f.label()),
            last_error: self.last_error.clone(),
        }
    }
}
