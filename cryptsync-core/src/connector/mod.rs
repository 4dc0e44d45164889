//! The remote connector: a single-task session agent driving the connection
//! state machine over one duplex message channel.
//!
//! Everything (inbound frames, outbound calls, timers, the state machine)
//! runs on the task that executes [`RemoteConnector::run`]. The public
//! surface is [`RemoteConnectorHandle`], whose calls are marshalled onto
//! that task; results surface as [`RemoteEvent`]s.
//!
//! The upper layer reacts to `RemoteReadyWithChanges` by calling `resync()`,
//! which asks the server to stream the pending changes.

pub mod settings;
pub mod state;
pub mod transport;

use crate::crypto::controller::{CryptoController, SYM_SCHEME};
use crate::crypto::primitives::{self, EncryptionScheme, SecretKey, SignatureScheme};
use crate::crypto::CryptoError;
use crate::protocol::codec::CodecError;
use crate::protocol::messages::{
    export_sign_data, key_update_mac_data, AcceptMessage, AccessMessage, AccountMessage,
    ChangeAckMessage, ChangeMessage, ChangedAckMessage, ChangedInfoMessage, ChangedMessage,
    DenyMessage, DeviceChangeAckMessage, DeviceChangeMessage, DeviceKeysMessage, DevicesMessage,
    ErrorKind, ErrorMessage, GrantMessage, IdentifyMessage, KeyChangeMessage, LoginMessage,
    MacUpdateMessage, Message, NewKeyAckMessage, NewKeyDevice, NewKeyMessage, ProofMessage,
    RegisterMessage, RemoveMessage, RemovedMessage, WelcomeMessage, PING,
};
use settings::Settings;
use state::{Action, ConnectionState, Machine, StateEvent};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use transport::{Dialer, Transport, TransportError};
use uuid::Uuid;

/// Fixed reconnect back-off schedule. The index advances on every retry and
/// caps at the last entry.
const RETRY_TIMEOUTS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const PROOF_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors raised inside the connector. Handlers never propagate past the
/// dispatcher; every failure is converted into the error path.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Codec failure: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Not connected")]
    NotConnected,

    #[error("{0}")]
    Protocol(String),
}

/// A peer device as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: Uuid,
    pub name: String,
    pub fingerprint: Vec<u8>,
}

/// Remote configuration embedded in an account export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub access_key: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub keepalive_timeout: u32,
}

/// Account export handed to a new device out of band.
#[derive(Clone)]
pub struct ExportData {
    pub pnonce: Vec<u8>,
    pub partner_id: Uuid,
    pub trusted: bool,
    pub scheme: String,
    pub cmac: Vec<u8>,
    pub config: Option<RemoteConfig>,
}

impl ExportData {
    /// The byte range the export cmac covers.
    pub fn sign_data(&self) -> Vec<u8> {
        export_sign_data(&self.pnonce, self.partner_id, &self.scheme)
    }
}

/// Events surfaced to the owner of the connector.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    RemoteConnecting,
    RemoteReady,
    RemoteReadyWithChanges,
    RemoteDisconnected,
    UpdateUploadLimit(u32),
    UploadDone { data_id: u64 },
    DeviceUploadDone { data_id: u64, device_id: Uuid },
    DownloadStarted { estimate: u32 },
    DownloadData { data_index: u64, data: Vec<u8> },
    DevicesListed(Vec<DeviceInfo>),
    LoginRequested(DeviceInfo),
    AccountAccessGranted { device_id: Uuid },
    ImportCompleted,
    ControllerError { message: String },
    Finalized,
}

enum Command {
    Reconnect,
    Disconnect,
    Resync,
    ListDevices,
    RemoveDevice(Uuid),
    ResetAccount { clear_config: bool },
    LoginReply { device_id: Uuid, accept: bool },
    InitKeyUpdate,
    UploadData { key: String, data: Vec<u8> },
    UploadDeviceData { key: String, device_id: Uuid, data: Vec<u8> },
    DownloadDone { data_index: u64 },
    PrepareImport { data: ExportData, key: Option<SecretKey> },
    ExportAccount {
        include_server: bool,
        password: Option<String>,
        reply: oneshot::Sender<Result<(ExportData, Vec<u8>), String>>,
    },
    Finalize,
}

/// Cloneable public handle. All calls are queued onto the connector task;
/// calls that require the idle state are logged and dropped there.
#[derive(Clone)]
pub struct RemoteConnectorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RemoteConnectorHandle {
    fn send(&self, command: Command) {
        let _ = self.commands.send(command);
    }

    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn resync(&self) {
        self.send(Command::Resync);
    }

    pub fn list_devices(&self) {
        self.send(Command::ListDevices);
    }

    pub fn remove_device(&self, device_id: Uuid) {
        self.send(Command::RemoveDevice(device_id));
    }

    pub fn reset_account(&self, clear_config: bool) {
        self.send(Command::ResetAccount { clear_config });
    }

    pub fn login_reply(&self, device_id: Uuid, accept: bool) {
        self.send(Command::LoginReply { device_id, accept });
    }

    pub fn init_key_update(&self) {
        self.send(Command::InitKeyUpdate);
    }

    pub fn upload_data(&self, key: impl Into<String>, data: Vec<u8>) {
        self.send(Command::UploadData { key: key.into(), data });
    }

    pub fn upload_device_data(&self, key: impl Into<String>, device_id: Uuid, data: Vec<u8>) {
        self.send(Command::UploadDeviceData { key: key.into(), device_id, data });
    }

    pub fn download_done(&self, data_index: u64) {
        self.send(Command::DownloadDone { data_index });
    }

    pub fn prepare_import(&self, data: ExportData, key: Option<SecretKey>) {
        self.send(Command::PrepareImport { data, key });
    }

    /// Export the account for a new device. The returned salt is only
    /// relevant for trusted (password) exports.
    pub async fn export_account(
        &self,
        include_server: bool,
        password: Option<String>,
    ) -> Result<(ExportData, Vec<u8>), String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ExportAccount { include_server, password, reply });
        rx.await.map_err(|_| "connector gone".to_string())?
    }

    /// Shut the connector down. `Finalized` is emitted when done.
    pub fn finalize(&self) {
        self.send(Command::Finalize);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerKind {
    Retry,
    Operation,
    Ping,
    Proof(Uuid),
    ForceFinalize,
}

struct TimerQueue {
    entries: Vec<(Instant, TimerKind)>,
}

impl TimerQueue {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(&kind);
        self.entries.push((Instant::now() + delay, kind));
    }

    fn cancel(&mut self, kind: &TimerKind) {
        self.entries.retain(|(_, k)| k != kind);
    }

    fn cancel_proofs(&mut self) {
        self.entries.retain(|(_, k)| !matches!(k, TimerKind::Proof(_)));
    }

    async fn next(&mut self) -> TimerKind {
        let Some(index) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, (deadline, _))| *deadline)
            .map(|(i, _)| i)
        else {
            return std::future::pending().await;
        };
        let deadline = self.entries[index].0;
        tokio::time::sleep_until(deadline).await;
        self.entries.remove(index).1
    }
}

async fn recv_or_pending<T: Transport>(
    transport: &mut Option<T>,
) -> Option<Result<Vec<u8>, TransportError>> {
    match transport {
        Some(t) => t.recv().await,
        None => std::future::pending().await,
    }
}

enum Wake {
    Command(Option<Command>),
    Inbound(Option<Result<Vec<u8>, TransportError>>),
    Timer(TimerKind),
}

/// Connector construction options.
pub struct ConnectorOptions {
    pub sign_scheme: SignatureScheme,
    pub crypt_scheme: EncryptionScheme,
    pub finalize_timeout: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            sign_scheme: SignatureScheme::EcdsaP256Sha3_512,
            crypt_scheme: EncryptionScheme::RsaOaepSha3_512,
            finalize_timeout: Duration::from_secs(30),
        }
    }
}

/// The session agent. Owns the transport, the crypto controller, the typed
/// settings, and every timer.
pub struct RemoteConnector<D: Dialer> {
    dialer: D,
    transport: Option<D::Transport>,
    machine: Machine,
    crypto: CryptoController,
    settings: Settings,
    options: ConnectorOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<RemoteEvent>,
    timers: TimerQueue,
    retry_index: usize,
    expect_changes: bool,
    awaiting_ping: bool,
    device_id: Option<Uuid>,
    device_cache: Vec<DeviceInfo>,
    exports_cache: HashMap<Vec<u8>, SecretKey>,
    active_proofs: HashMap<Uuid, ProofMessage>,
    finished: bool,
}

impl<D: Dialer> RemoteConnector<D> {
    pub fn new(
        dialer: D,
        crypto: CryptoController,
        settings: Settings,
        options: ConnectorOptions,
    ) -> (Self, RemoteConnectorHandle, mpsc::UnboundedReceiver<RemoteEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connector = Self {
            dialer,
            transport: None,
            machine: Machine::new(),
            crypto,
            settings,
            options,
            commands: command_rx,
            events: event_tx,
            timers: TimerQueue::new(),
            retry_index: 0,
            expect_changes: false,
            awaiting_ping: false,
            device_id: None,
            device_cache: Vec::new(),
            exports_cache: HashMap::new(),
            active_proofs: HashMap::new(),
            finished: false,
        };
        (connector, RemoteConnectorHandle { commands: command_tx }, event_rx)
    }

    /// Run the session until finalized. Connects immediately.
    pub async fn run(mut self) {
        self.submit(StateEvent::Reconnect).await;

        while !self.finished {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                inbound = recv_or_pending(&mut self.transport) => Wake::Inbound(inbound),
                timer = self.timers.next() => Wake::Timer(timer),
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => self.start_finalize().await,
                Wake::Inbound(Some(Ok(frame))) => self.handle_frame(frame).await,
                Wake::Inbound(Some(Err(e))) => {
                    self.log_retry(&format!("transport error: {e}"));
                    self.drop_transport().await;
                    self.submit(StateEvent::Disconnected).await;
                }
                Wake::Inbound(None) => {
                    if self.machine.state().is_active()
                        && self.machine.state() != ConnectionState::Closing
                    {
                        self.log_retry("unexpected disconnect from server");
                    }
                    self.transport = None;
                    self.submit(StateEvent::Disconnected).await;
                }
                Wake::Timer(timer) => self.handle_timer(timer).await,
            }
        }
    }

    fn emit(&self, event: RemoteEvent) {
        let _ = self.events.send(event);
    }

    // Repeated connection failures degrade to debug logging.
    fn log_retry(&self, message: &str) {
        if self.retry_index == 0 {
            tracing::warn!("{message}");
        } else {
            tracing::debug!("{message} (repeated)");
        }
    }

    // -- state machine driving ----------------------------------------------

    async fn submit(&mut self, event: StateEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for action in self.machine.handle(event) {
                if let Some(follow_up) = self.apply_action(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn apply_action(&mut self, action: Action) -> Option<StateEvent> {
        match action {
            Action::OpenConnection => Some(self.do_connect().await),
            Action::CloseConnection => {
                self.drop_transport().await;
                Some(StateEvent::Disconnected)
            }
            Action::ScheduleRetry => {
                let delay = RETRY_TIMEOUTS[self.retry_index.min(RETRY_TIMEOUTS.len() - 1)];
                if self.retry_index < RETRY_TIMEOUTS.len() {
                    self.retry_index += 1;
                }
                tracing::debug!("retrying connection in {}s", delay.as_secs());
                self.timers.schedule(TimerKind::Retry, delay);
                None
            }
            Action::CancelRetry => {
                self.timers.cancel(&TimerKind::Retry);
                None
            }
            Action::EnterIdle => {
                self.retry_index = 0;
                if self.expect_changes {
                    self.expect_changes = false;
                    tracing::debug!("server has changes, reloading states");
                    self.emit(RemoteEvent::RemoteReadyWithChanges);
                } else {
                    self.emit(RemoteEvent::RemoteReady);
                }
                None
            }
            Action::LeaveActive => {
                self.device_cache.clear();
                self.active_proofs.clear();
                self.timers.cancel(&TimerKind::Operation);
                self.timers.cancel(&TimerKind::Ping);
                self.timers.cancel_proofs();
                self.awaiting_ping = false;
                self.emit(RemoteEvent::RemoteDisconnected);
                None
            }
            Action::ReportFatal => {
                tracing::error!("connection failed fatally");
                None
            }
            Action::EmitFinalized => {
                self.timers.cancel(&TimerKind::ForceFinalize);
                self.crypto.finalize();
                self.emit(RemoteEvent::Finalized);
                self.finished = true;
                None
            }
        }
    }

    async fn do_connect(&mut self) -> StateEvent {
        self.emit(RemoteEvent::RemoteConnecting);

        let Some(url) = self.check_can_sync() else {
            return StateEvent::NoConnect;
        };

        if self.transport.is_some() {
            tracing::warn!("discarding already open connection");
            self.drop_transport().await;
        }

        let access_key = self.settings.access_key();
        let headers = self.settings.headers();
        tracing::debug!("connecting to remote server");
        let dialed = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.dialer.connect(&url, &access_key, &headers),
        )
        .await;

        match dialed {
            Ok(Ok(transport)) => {
                self.transport = Some(transport);
                tracing::debug!("successfully connected to remote server");
                let keepalive = self.settings.keepalive_timeout();
                if keepalive > 0 {
                    self.awaiting_ping = false;
                    self.timers
                        .schedule(TimerKind::Ping, Duration::from_secs(u64::from(keepalive) * 60));
                }
                StateEvent::Connected
            }
            Ok(Err(e)) => {
                self.log_retry(&format!("failed to connect to server: {e}"));
                StateEvent::Disconnected
            }
            Err(_) => {
                self.log_retry("connection attempt timed out");
                StateEvent::Disconnected
            }
        }
    }

    /// Closing guard, identity, enabled flag, and URL check before a dial.
    fn check_can_sync(&mut self) -> Option<String> {
        if self.machine.is_closing() {
            return None;
        }
        if !self.load_identity() {
            tracing::error!("unable to load user identity, cannot synchronize");
            return None;
        }
        if !self.settings.enabled() {
            tracing::debug!("remote has been disabled, not connecting");
            return None;
        }
        let url = self.settings.remote_url();
        if url.is_none() {
            tracing::debug!("cannot connect to remote, no URL defined");
        }
        url
    }

    fn load_identity(&mut self) -> bool {
        let new_id = self.settings.device_id();
        if new_id != self.device_id || new_id.is_none() {
            self.device_id = new_id;
            self.crypto.clear_key_material();
            if !self.crypto.has_store() {
                return false;
            }
            if let Some(device_id) = new_id {
                let (Some(sign_scheme), Some(crypt_scheme)) =
                    (self.settings.sign_scheme(), self.settings.crypt_scheme())
                else {
                    tracing::error!("device id persisted without key schemes");
                    return false;
                };
                if let Err(e) = self
                    .crypto
                    .load_key_material(device_id, &sign_scheme, &crypt_scheme)
                {
                    tracing::error!("failed to load key material: {e}");
                    return false;
                }
            }
        }
        true
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.timers.cancel(&TimerKind::Ping);
    }

    async fn trigger_error(&mut self, can_recover: bool) {
        if can_recover {
            self.submit(StateEvent::BasicError).await;
        } else {
            self.submit(StateEvent::FatalError).await;
        }
    }

    fn begin_op(&mut self, timeout: Duration) {
        self.timers.schedule(TimerKind::Operation, timeout);
    }

    fn end_op(&mut self) {
        self.timers.cancel(&TimerKind::Operation);
    }

    fn is_idle(&self) -> bool {
        self.machine.state().is_idle()
    }

    async fn check_idle(&mut self, message_name: &str) -> bool {
        if self.is_idle() {
            true
        } else {
            tracing::warn!("unexpected {message_name}");
            self.trigger_error(true).await;
            false
        }
    }

    async fn send_message(&mut self, message: &Message) -> Result<(), ConnectorError> {
        let transport = self.transport.as_mut().ok_or(ConnectorError::NotConnected)?;
        transport.send(message.encode()).await?;
        Ok(())
    }

    async fn send_signed_message(&mut self, message: &Message) -> Result<(), ConnectorError> {
        let framed = self.crypto.serialize_signed_message(message)?;
        let transport = self.transport.as_mut().ok_or(ConnectorError::NotConnected)?;
        transport.send(framed).await?;
        Ok(())
    }

    // -- timers --------------------------------------------------------------

    async fn handle_timer(&mut self, timer: TimerKind) {
        match timer {
            TimerKind::Retry => {
                if self.machine.state() == ConnectionState::Retry {
                    self.submit(StateEvent::Reconnect).await;
                }
            }
            TimerKind::Operation => {
                tracing::error!("network operation timed out");
                self.trigger_error(false).await;
            }
            TimerKind::Ping => {
                if self.awaiting_ping {
                    self.awaiting_ping = false;
                    tracing::debug!("server connection idle, reconnecting to server");
                    self.submit(StateEvent::Reconnect).await;
                } else {
                    self.awaiting_ping = true;
                    if let Some(transport) = self.transport.as_mut() {
                        let _ = transport.send(PING.to_vec()).await;
                    }
                    let keepalive = self.settings.keepalive_timeout();
                    self.timers
                        .schedule(TimerKind::Ping, Duration::from_secs(u64::from(keepalive) * 60));
                }
            }
            TimerKind::Proof(device_id) => {
                if self.active_proofs.remove(&device_id).is_some() {
                    tracing::warn!(%device_id, "rejecting login proof after timeout");
                    let _ = self
                        .send_message(&Message::Deny(DenyMessage { device_id }))
                        .await;
                }
            }
            TimerKind::ForceFinalize => {
                tracing::warn!("finalize timed out, force-stopping connector");
                self.drop_transport().await;
                self.emit(RemoteEvent::Finalized);
                self.finished = true;
            }
        }
    }

    // -- commands ------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reconnect => self.submit(StateEvent::Reconnect).await,
            Command::Disconnect => self.trigger_error(false).await,
            Command::Resync => {
                if !self.is_idle() {
                    tracing::info!("cannot resync when not in idle state, ignoring request");
                    return;
                }
                self.emit(RemoteEvent::RemoteReadyWithChanges);
                if let Err(e) = self.send_message(&Message::Sync).await {
                    self.on_local_error("Sync", e).await;
                }
            }
            Command::ListDevices => {
                if !self.is_idle() {
                    tracing::info!("cannot list devices when not in idle state, ignoring request");
                    return;
                }
                if let Err(e) = self.send_message(&Message::ListDevices).await {
                    self.on_local_error("ListDevices", e).await;
                }
            }
            Command::RemoveDevice(device_id) => {
                if !self.is_idle() {
                    tracing::info!("cannot remove a device when not in idle state, ignoring request");
                    return;
                }
                if Some(device_id) == self.device_id {
                    tracing::warn!("cannot delete your own device, reset the account instead");
                    return;
                }
                if let Err(e) = self
                    .send_message(&Message::Remove(RemoveMessage { device_id }))
                    .await
                {
                    self.on_local_error("Remove", e).await;
                }
            }
            Command::ResetAccount { clear_config } => self.reset_account(clear_config).await,
            Command::LoginReply { device_id, accept } => self.login_reply(device_id, accept).await,
            Command::InitKeyUpdate => self.init_key_update().await,
            Command::UploadData { key, data } => {
                if !self.is_idle() {
                    tracing::info!("cannot upload when not in idle state, ignoring request");
                    return;
                }
                if let Err(e) = self.upload_data(key, &data).await {
                    self.on_local_error("Change", e).await;
                }
            }
            Command::UploadDeviceData { key, device_id, data } => {
                if !self.is_idle() {
                    tracing::info!("cannot upload when not in idle state, ignoring request");
                    return;
                }
                if let Err(e) = self.upload_device_data(key, device_id, &data).await {
                    self.on_local_error("DeviceChange", e).await;
                }
            }
            Command::DownloadDone { data_index } => {
                if !self.is_idle() {
                    tracing::info!("cannot download when not in idle state, ignoring request");
                    return;
                }
                let result = self
                    .send_message(&Message::ChangedAck(ChangedAckMessage { data_index }))
                    .await;
                match result {
                    Ok(()) => self.begin_op(DOWNLOAD_TIMEOUT),
                    Err(e) => self.on_local_error("ChangedAck", e).await,
                }
            }
            Command::PrepareImport { data, key } => self.prepare_import(data, key),
            Command::ExportAccount { include_server, password, reply } => {
                let result = self
                    .export_account(include_server, password.as_deref())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            Command::Finalize => self.start_finalize().await,
        }
    }

    async fn start_finalize(&mut self) {
        if self.machine.is_closing() {
            return;
        }
        self.machine.set_closing();
        self.timers.cancel(&TimerKind::Ping);
        let force_after = self
            .options
            .finalize_timeout
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        self.timers.schedule(TimerKind::ForceFinalize, force_after);
        self.submit(StateEvent::Close).await;
    }

    async fn init_key_update(&mut self) {
        if !self.is_idle() {
            tracing::warn!("can't update secret keys when not in idle state, ignoring request");
            return;
        }
        let result = async {
            let next_index = self.crypto.key_index()? + 1;
            self.send_message(&Message::KeyChange(KeyChangeMessage { next_index }))
                .await?;
            Ok::<_, ConnectorError>(())
        }
        .await;
        match result {
            Ok(()) => self.begin_op(OPERATION_TIMEOUT),
            Err(e) => self.on_local_error("KeyChange", e).await,
        }
    }

    async fn upload_data(&mut self, key: String, data: &[u8]) -> Result<(), ConnectorError> {
        let (key_index, salt, ciphertext) = self.crypto.encrypt_data(data)?;
        self.send_message(&Message::Change(ChangeMessage {
            key,
            key_index,
            salt,
            data: ciphertext,
        }))
        .await?;
        self.begin_op(OPERATION_TIMEOUT);
        Ok(())
    }

    async fn upload_device_data(
        &mut self,
        key: String,
        device_id: Uuid,
        data: &[u8],
    ) -> Result<(), ConnectorError> {
        let (key_index, salt, ciphertext) = self.crypto.encrypt_data(data)?;
        self.send_message(&Message::DeviceChange(DeviceChangeMessage {
            key,
            device_id,
            key_index,
            salt,
            data: ciphertext,
        }))
        .await?;
        self.begin_op(OPERATION_TIMEOUT);
        Ok(())
    }

    async fn reset_account(&mut self, clear_config: bool) {
        if clear_config {
            // Always clears imports as well, to reset a half-done import.
            self.settings.remove_remote_config();
            self.settings.clear_import();
        }

        let device_id = self.device_id.or_else(|| self.settings.device_id());
        match device_id {
            Some(device_id) => {
                self.device_cache.clear();
                self.exports_cache.clear();
                self.active_proofs.clear();
                self.settings.remove_device_id();
                if let Err(e) = self.crypto.delete_key_material(device_id) {
                    tracing::warn!("failed to delete key material: {e}");
                }
                if self.is_idle() && self.device_id == Some(device_id) {
                    // Delete ourselves; the remote disconnects once done.
                    if let Err(e) = self
                        .send_message(&Message::Remove(RemoveMessage { device_id }))
                        .await
                    {
                        self.on_local_error("Remove", e).await;
                    }
                } else {
                    self.device_id = None;
                    self.submit(StateEvent::Reconnect).await;
                }
            }
            None => {
                tracing::info!("skipping server reset, not registered to a server");
                // Still reconnect, as this completes the operation (and is
                // needed for imports).
                self.submit(StateEvent::Reconnect).await;
            }
        }
    }

    fn prepare_import(&mut self, data: ExportData, key: Option<SecretKey>) {
        match &data.config {
            Some(config) => {
                if let Some(url) = &config.url {
                    self.settings.set_remote_url(url);
                }
                self.settings.set_access_key(&config.access_key);
                for (name, value) in &config.headers {
                    self.settings.set_header(name, value);
                }
                self.settings.set_keepalive_timeout(config.keepalive_timeout);
            }
            None => self.settings.remove_remote_config(),
        }
        let key_bytes = key.as_ref().map(|k| k.as_bytes().to_vec());
        if data.trusted && key_bytes.is_none() {
            tracing::warn!("trusted import prepared without a key, downgrading to untrusted");
        }
        self.settings.set_import(
            &data.pnonce,
            data.partner_id,
            &data.scheme,
            &data.cmac,
            key_bytes.as_deref(),
        );
        // The caller completes the import by resetting the account, which
        // reconnects and sends the access request.
    }

    fn export_account(
        &mut self,
        include_server: bool,
        password: Option<&str>,
    ) -> Result<(ExportData, Vec<u8>), ConnectorError> {
        let partner_id = self.device_id.ok_or_else(|| {
            ConnectorError::Protocol("cannot export data without being registered on a server".to_string())
        })?;

        let pnonce = self.crypto.random_bytes(32);
        let (scheme, salt, key) = self.crypto.generate_export_key(password)?;
        let cmac = self.crypto.create_export_cmac(
            &scheme,
            &key,
            &export_sign_data(&pnonce, partner_id, &scheme),
        )?;

        let config = include_server.then(|| self.load_config());
        self.exports_cache.insert(pnonce.clone(), key);

        Ok((
            ExportData {
                pnonce,
                partner_id,
                trusted: password.is_some(),
                scheme,
                cmac,
                config,
            },
            salt,
        ))
    }

    fn load_config(&self) -> RemoteConfig {
        RemoteConfig {
            url: self.settings.remote_url(),
            access_key: self.settings.access_key(),
            headers: self.settings.headers(),
            keepalive_timeout: self.settings.keepalive_timeout(),
        }
    }

    async fn login_reply(&mut self, device_id: Uuid, accept: bool) {
        if !self.is_idle() {
            tracing::warn!("can't react to login when not in idle state, ignoring request");
            return;
        }
        let Some(proof) = self.active_proofs.remove(&device_id) else {
            tracing::warn!("received login reply for non existent request, probably already handled");
            return;
        };
        self.timers.cancel(&TimerKind::Proof(device_id));

        if accept {
            let result = async {
                let key_index = self.crypto.key_index()?;
                let secret =
                    self.crypto
                        .encrypt_secret_key(key_index, &proof.crypt_scheme, &proof.crypt_key)?;
                self.send_message(&Message::Accept(AcceptMessage {
                    device_id,
                    key_index,
                    scheme: SYM_SCHEME.to_string(),
                    secret,
                }))
                .await
            }
            .await;
            match result {
                Ok(()) => self.emit(RemoteEvent::AccountAccessGranted { device_id }),
                Err(e) => {
                    tracing::warn!("failed to reply to login with error: {e}");
                    let _ = self
                        .send_message(&Message::Deny(DenyMessage { device_id }))
                        .await;
                }
            }
        } else {
            let _ = self
                .send_message(&Message::Deny(DenyMessage { device_id }))
                .await;
        }
    }

    // -- inbound dispatch ----------------------------------------------------

    async fn handle_frame(&mut self, frame: Vec<u8>) {
        if frame == PING {
            self.awaiting_ping = false;
            let keepalive = self.settings.keepalive_timeout();
            if keepalive > 0 {
                self.timers
                    .schedule(TimerKind::Ping, Duration::from_secs(u64::from(keepalive) * 60));
            }
            return;
        }

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("remote message error: {e}");
                self.trigger_error(true).await;
                return;
            }
        };

        let name = message.type_name();
        let result = match message {
            Message::Error(m) => {
                self.on_error(&m, None).await;
                Ok(())
            }
            Message::Identify(m) => self.on_identify(m).await,
            Message::Account(m) => self.on_account(m, true).await,
            Message::Welcome(m) => self.on_welcome(m).await,
            Message::Grant(m) => self.on_grant(m).await,
            Message::ChangeAck(m) => self.on_change_ack(m).await,
            Message::DeviceChangeAck(m) => self.on_device_change_ack(m).await,
            Message::Changed(m) => self.on_changed(m).await,
            Message::ChangedInfo(m) => self.on_changed_info(m).await,
            Message::LastChanged => self.on_last_changed().await,
            Message::Devices(m) => self.on_devices(m).await,
            Message::Removed(m) => self.on_removed(m).await,
            Message::Proof(m) => self.on_proof(m).await,
            Message::MacUpdateAck => self.on_mac_update_ack().await,
            Message::DeviceKeys(m) => self.on_device_keys(m).await,
            Message::NewKeyAck(m) => self.on_new_key_ack(m).await,
            other => {
                tracing::warn!("unexpected message received: {}", other.type_name());
                self.trigger_error(true).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            // Any handler failure becomes a synthetic client error.
            self.on_local_error(name, e).await;
        }
    }

    async fn on_local_error(&mut self, message_name: &str, error: ConnectorError) {
        let message = ErrorMessage {
            kind: ErrorKind::Client,
            message: error.to_string(),
            can_recover: true,
        };
        self.on_error(&message, Some(message_name)).await;
    }

    async fn on_error(&mut self, message: &ErrorMessage, context: Option<&str>) {
        match context {
            Some(name) => tracing::error!("local error on {name}: {}", message.message),
            None => tracing::error!(
                "server error ({:?}, recoverable: {}): {}",
                message.kind,
                message.can_recover,
                message.message
            ),
        }
        self.trigger_error(message.can_recover).await;

        if !message.can_recover {
            let text = match message.kind {
                ErrorKind::IncompatibleVersion => {
                    "Server is not compatible with your application version."
                }
                ErrorKind::Authentication => {
                    "Authentication failed. Try to remove and add your device again, or reset your account!"
                }
                ErrorKind::Access => {
                    "Account access (import) failed. The partner device was not available or did not accept your request!"
                }
                ErrorKind::KeyIndex => {
                    "Cannot update key! This client is not using the latest existing keys."
                }
                ErrorKind::Client | ErrorKind::Server | ErrorKind::UnexpectedMessage => {
                    "Internal application error. Check the logs for details."
                }
                ErrorKind::Unknown => "Unknown error occurred.",
            };
            self.emit(RemoteEvent::ControllerError {
                message: text.to_string(),
            });
        }
    }

    async fn on_identify(&mut self, message: IdentifyMessage) -> Result<(), ConnectorError> {
        // Connecting is allowed too: the server frame can overtake the
        // connected event.
        if !matches!(
            self.machine.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            tracing::warn!("unexpected Identify");
            self.trigger_error(true).await;
            return Ok(());
        }
        if message.nonce.len() < 32 {
            return Err(ConnectorError::Protocol("identify nonce too short".to_string()));
        }

        self.submit(StateEvent::Identify).await;
        self.emit(RemoteEvent::UpdateUploadLimit(message.upload_limit));

        if let Some(device_id) = self.device_id {
            let login = Message::Login(LoginMessage {
                device_id,
                device_name: self.settings.device_name(),
                nonce: message.nonce,
            });
            self.submit(StateEvent::AwaitLogin).await;
            self.send_signed_message(&login).await?;
            self.begin_op(OPERATION_TIMEOUT);
            tracing::debug!(%device_id, "sent login message");
        } else {
            self.crypto.create_private_keys(
                &message.nonce,
                self.options.sign_scheme,
                self.options.crypt_scheme,
            )?;

            match self.settings.import_nonce() {
                None => {
                    let register = Message::Register(RegisterMessage {
                        device_name: self.settings.device_name(),
                        nonce: message.nonce,
                        sign_scheme: self.crypto.sign_scheme()?.to_string(),
                        sign_key: self.crypto.sign_key_spki()?,
                        crypt_scheme: self.crypto.crypt_scheme()?.to_string(),
                        crypt_key: self.crypto.crypt_key_spki()?,
                        cmac: self.crypto.generate_encryption_key_cmac(None)?,
                    });
                    self.submit(StateEvent::AwaitRegister).await;
                    self.send_signed_message(&register).await?;
                    self.begin_op(OPERATION_TIMEOUT);
                    tracing::debug!("sent registration message for new id");
                }
                Some(pnonce) => {
                    let partner_id = self.settings.import_partner().ok_or_else(|| {
                        ConnectorError::Protocol("import record without partner".to_string())
                    })?;
                    let mac_scheme = self.settings.import_scheme().ok_or_else(|| {
                        ConnectorError::Protocol("import record without scheme".to_string())
                    })?;
                    let mac_cmac = self.settings.import_cmac().ok_or_else(|| {
                        ConnectorError::Protocol("import record without cmac".to_string())
                    })?;

                    let trustmac = match self.settings.import_key() {
                        Some(key_bytes) => {
                            let key = SecretKey::from_bytes(&key_bytes)?;
                            Some(self.crypto.create_trust_cmac(&mac_scheme, &key)?)
                        }
                        None => None,
                    };

                    let access = Message::Access(AccessMessage {
                        device_name: self.settings.device_name(),
                        nonce: message.nonce,
                        sign_scheme: self.crypto.sign_scheme()?.to_string(),
                        sign_key: self.crypto.sign_key_spki()?,
                        crypt_scheme: self.crypto.crypt_scheme()?.to_string(),
                        crypt_key: self.crypto.crypt_key_spki()?,
                        pnonce,
                        partner_id,
                        mac_scheme,
                        mac_cmac,
                        trustmac,
                    });
                    self.submit(StateEvent::AwaitGranted).await;
                    self.send_signed_message(&access).await?;
                    self.begin_op(OPERATION_TIMEOUT);
                    tracing::debug!("sent access message for new id");
                }
            }
        }
        Ok(())
    }

    async fn on_account(
        &mut self,
        message: AccountMessage,
        check_state: bool,
    ) -> Result<(), ConnectorError> {
        if check_state && self.machine.state() != ConnectionState::Registering {
            tracing::warn!("unexpected Account");
            self.trigger_error(true).await;
            return Ok(());
        }
        self.end_op();

        self.device_id = Some(message.device_id);
        self.settings.set_device_id(message.device_id);

        let (sign_scheme, crypt_scheme) = self.crypto.store_private_keys(message.device_id)?;
        self.settings.set_schemes(&sign_scheme, &crypt_scheme);

        tracing::debug!("registration successful");
        self.expect_changes = false;
        self.submit(StateEvent::Account).await;
        Ok(())
    }

    async fn on_welcome(&mut self, message: WelcomeMessage) -> Result<(), ConnectorError> {
        if self.machine.state() != ConnectionState::LoggingIn {
            tracing::warn!("unexpected Welcome");
            self.trigger_error(true).await;
            return Ok(());
        }
        self.end_op();
        tracing::debug!("login successful");
        self.expect_changes = message.has_changes;
        self.submit(StateEvent::Account).await;

        let device_id = self
            .device_id
            .ok_or_else(|| ConnectorError::Protocol("welcome without device id".to_string()))?;

        // Updates are ordered by index; each entry is verified under the key
        // immediately preceding it, then installed so the next entry can be
        // verified in turn.
        let mut key_updated = false;
        let mut highest = 0;
        for update in &message.key_updates {
            if update.index == 0 {
                return Err(ConnectorError::Protocol("key update for index 0".to_string()));
            }
            let mac_data =
                key_update_mac_data(device_id, update.index, &update.scheme, &update.cipher);
            self.crypto
                .verify_cmac(update.index - 1, &mac_data, &update.cmac)?;
            self.crypto
                .decrypt_secret_key(update.index, &update.scheme, &update.cipher, false)?;
            highest = highest.max(update.index);
            key_updated = true;
        }
        if key_updated {
            self.crypto.activate_installed_key(highest)?;
            self.crypto.store_symmetric_keys(device_id)?;
        }

        if key_updated || self.settings.send_cmac() {
            self.send_key_update().await?;
        }
        Ok(())
    }

    /// Publish the possession proof of the current key; `sendCmac` stays set
    /// until the server acknowledges.
    async fn send_key_update(&mut self) -> Result<(), ConnectorError> {
        self.settings.set_send_cmac(true);
        let key_index = self.crypto.key_index()?;
        let cmac = self.crypto.generate_encryption_key_cmac(None)?;
        self.send_message(&Message::MacUpdate(MacUpdateMessage { key_index, cmac }))
            .await
    }

    async fn on_grant(&mut self, message: GrantMessage) -> Result<(), ConnectorError> {
        if self.machine.state() != ConnectionState::Granting {
            tracing::warn!("unexpected Grant");
            self.trigger_error(true).await;
            return Ok(());
        }
        tracing::debug!("account access granted");
        self.crypto
            .decrypt_secret_key(message.key_index, &message.scheme, &message.secret, true)?;
        self.on_account(
            AccountMessage {
                device_id: message.device_id,
            },
            false,
        )
        .await?;
        // Import succeeded, drop the import record.
        self.settings.clear_import();
        self.send_key_update().await?;
        self.emit(RemoteEvent::ImportCompleted);
        Ok(())
    }

    async fn on_change_ack(&mut self, message: ChangeAckMessage) -> Result<(), ConnectorError> {
        if self.check_idle("ChangeAck").await {
            self.end_op();
            self.emit(RemoteEvent::UploadDone {
                data_id: message.data_id,
            });
        }
        Ok(())
    }

    async fn on_device_change_ack(
        &mut self,
        message: DeviceChangeAckMessage,
    ) -> Result<(), ConnectorError> {
        if self.check_idle("DeviceChangeAck").await {
            self.end_op();
            self.emit(RemoteEvent::DeviceUploadDone {
                data_id: message.data_id,
                device_id: message.device_id,
            });
        }
        Ok(())
    }

    async fn on_changed(&mut self, message: ChangedMessage) -> Result<(), ConnectorError> {
        if self.check_idle("Changed").await {
            let data = self
                .crypto
                .decrypt_data(message.key_index, &message.salt, &message.data)?;
            self.begin_op(DOWNLOAD_TIMEOUT);
            self.emit(RemoteEvent::DownloadData {
                data_index: message.data_index,
                data,
            });
        }
        Ok(())
    }

    async fn on_changed_info(&mut self, message: ChangedInfoMessage) -> Result<(), ConnectorError> {
        if self.check_idle("ChangedInfo").await {
            tracing::debug!("started downloading, estimated changes: {}", message.change_estimate);
            self.submit(StateEvent::Download).await;
            self.emit(RemoteEvent::DownloadStarted {
                estimate: message.change_estimate,
            });
            self.on_changed(ChangedMessage {
                data_index: message.data_index,
                key_index: message.key_index,
                salt: message.salt,
                data: message.data,
            })
            .await?;
        }
        Ok(())
    }

    async fn on_last_changed(&mut self) -> Result<(), ConnectorError> {
        if self.check_idle("LastChanged").await {
            tracing::debug!("completed downloading changes");
            self.end_op();
            self.submit(StateEvent::Downloaded).await;
        }
        Ok(())
    }

    async fn on_devices(&mut self, message: DevicesMessage) -> Result<(), ConnectorError> {
        if self.check_idle("Devices").await {
            tracing::debug!("received list of devices with {} entries", message.devices.len());
            self.device_cache = message
                .devices
                .into_iter()
                .map(|d| DeviceInfo {
                    device_id: d.device_id,
                    name: d.name,
                    fingerprint: d.fingerprint,
                })
                .collect();
            self.emit(RemoteEvent::DevicesListed(self.device_cache.clone()));
        }
        Ok(())
    }

    async fn on_removed(&mut self, message: RemovedMessage) -> Result<(), ConnectorError> {
        if self.check_idle("Removed").await {
            tracing::debug!(device_id = %message.device_id, "device was removed");
            if self.device_id == Some(message.device_id) {
                self.settings.remove_device_id();
                self.device_id = None;
                self.submit(StateEvent::Reconnect).await;
            } else if let Some(position) = self
                .device_cache
                .iter()
                .position(|d| d.device_id == message.device_id)
            {
                self.device_cache.remove(position);
                self.emit(RemoteEvent::DevicesListed(self.device_cache.clone()));
            }
        }
        Ok(())
    }

    async fn on_proof(&mut self, message: ProofMessage) -> Result<(), ConnectorError> {
        if !self.check_idle("Proof").await {
            return Ok(());
        }

        let device_id = message.device_id;
        let verified = self.verify_proof(&message);
        match verified {
            Ok(trusted) => {
                let info = DeviceInfo {
                    device_id,
                    name: message.device_name.clone(),
                    fingerprint: primitives::fingerprint(
                        &message.sign_scheme,
                        &message.sign_key,
                        &message.crypt_scheme,
                        &message.crypt_key,
                    ),
                };
                self.active_proofs.insert(device_id, message);
                if trusted {
                    tracing::info!(%device_id, "accepted trusted import proof request");
                    self.login_reply(device_id, true).await;
                } else {
                    tracing::info!(%device_id, "received untrusted import proof request");
                    self.timers.schedule(TimerKind::Proof(device_id), PROOF_TIMEOUT);
                    self.emit(RemoteEvent::LoginRequested(info));
                }
            }
            Err(e) => {
                tracing::warn!("rejecting proof with error: {e}");
                self.send_message(&Message::Deny(DenyMessage { device_id }))
                    .await?;
            }
        }
        Ok(())
    }

    /// Check a proof against the export cache. Returns whether the trustmac
    /// verified (pre-trusted request).
    fn verify_proof(&mut self, message: &ProofMessage) -> Result<bool, ConnectorError> {
        let own_id = self
            .device_id
            .ok_or_else(|| ConnectorError::Protocol("proof without own device id".to_string()))?;
        let key = self
            .exports_cache
            .remove(&message.pnonce)
            .ok_or_else(|| ConnectorError::Protocol("proof for non existing export".to_string()))?;

        let mac_data = export_sign_data(&message.pnonce, own_id, &message.mac_scheme);
        self.crypto
            .verify_import_cmac(&message.mac_scheme, &key, &mac_data, &message.cmac)?;

        match &message.trustmac {
            Some(trustmac) => {
                self.crypto.verify_trust_cmac(
                    &message.mac_scheme,
                    &key,
                    &message.sign_scheme,
                    &message.sign_key,
                    &message.crypt_scheme,
                    &message.crypt_key,
                    trustmac,
                )?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn on_mac_update_ack(&mut self) -> Result<(), ConnectorError> {
        if self.check_idle("MacUpdateAck").await {
            self.settings.set_send_cmac(false);
        }
        Ok(())
    }

    async fn on_device_keys(&mut self, message: DeviceKeysMessage) -> Result<(), ConnectorError> {
        if !self.check_idle("DeviceKeys").await {
            return Ok(());
        }
        self.end_op();

        if message.duplicated {
            self.crypto.activate_next_key(message.key_index)?;
            self.persist_symmetric_keys()?;
            return Ok(());
        }

        let (key_index, scheme) = self.crypto.generate_next_key()?;
        let previous_index = self.crypto.key_index()?;
        let mut device_keys = Vec::new();

        for info in &message.devices {
            // The peer must prove possession of the previous secret (which
            // is still the current one) before receiving the new key.
            let prepared = (|| -> Result<NewKeyDevice, ConnectorError> {
                self.crypto
                    .verify_peer_key_cmac(previous_index, &info.sign_key, &info.cmac)?;
                let cipher =
                    self.crypto
                        .encrypt_secret_key(key_index, &info.crypt_scheme, &info.crypt_key)?;
                let cmac = self.crypto.create_cmac(
                    previous_index,
                    &key_update_mac_data(info.device_id, key_index, scheme, &cipher),
                )?;
                Ok(NewKeyDevice {
                    device_id: info.device_id,
                    cipher,
                    cmac,
                })
            })();
            match prepared {
                Ok(update) => {
                    tracing::debug!(device_id = %info.device_id, "prepared key update");
                    device_keys.push(update);
                }
                Err(e) => {
                    tracing::warn!(
                        device_id = %info.device_id,
                        "failed to prepare exchange key update, device is excluded from synchronisation: {e}"
                    );
                }
            }
        }

        self.send_message(&Message::NewKey(NewKeyMessage {
            key_index,
            scheme: scheme.to_string(),
            device_keys,
        }))
        .await?;
        self.begin_op(OPERATION_TIMEOUT);
        tracing::debug!("sent key update to server");
        Ok(())
    }

    async fn on_new_key_ack(&mut self, message: NewKeyAckMessage) -> Result<(), ConnectorError> {
        if self.check_idle("NewKeyAck").await {
            self.end_op();
            self.crypto.activate_next_key(message.key_index)?;
            self.persist_symmetric_keys()?;
            // Publish the possession proof of the freshly activated key.
            self.send_key_update().await?;
        }
        Ok(())
    }

    fn persist_symmetric_keys(&mut self) -> Result<(), ConnectorError> {
        if let Some(device_id) = self.device_id {
            self.crypto.store_symmetric_keys(device_id)?;
        }
        Ok(())
    }
}
