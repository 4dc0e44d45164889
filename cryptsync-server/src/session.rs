//! Per-connection session: the server half of the exchange protocol.
//!
//! A session authenticates one device (`Register`/`Login`/`Access`), then
//! serves the idle exchange: change upload with fan-out, ordered change
//! download against acks, key rotation bookkeeping, device management, and
//! the import handshake relayed between sessions through the broker.

use crate::broker::{Broker, ImportRequest, Notice};
use crate::database::{
    encode_envelope, DatabaseController, DeviceRecord, KeyChangeOutcome, NewDevice, PendingChange,
};
use crate::error::{Result, ServerError};
use cryptsync_core::connector::transport::Transport;
use cryptsync_core::crypto::primitives;
use cryptsync_core::crypto::CryptoController;
use cryptsync_core::protocol::messages::{
    decode_signed, AcceptMessage, AccessMessage, AccountMessage, ChangeAckMessage, ChangeMessage,
    ChangedAckMessage, ChangedInfoMessage, ChangedMessage, DenyMessage, DeviceChangeAckMessage,
    DeviceChangeMessage, DeviceKeyInfo, DeviceKeysMessage, DeviceListEntry, DevicesMessage,
    GrantMessage, IdentifyMessage, KeyChangeMessage, LoginMessage, MacUpdateMessage, Message,
    NewKeyAckMessage, NewKeyMessage, ProofMessage, RegisterMessage, RemoveMessage, RemovedMessage,
    WelcomeKeyUpdate, WelcomeMessage, PING,
};
use rand::RngCore;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use uuid::Uuid;

struct AuthInfo {
    user_id: Uuid,
    device_id: Uuid,
    device_row: i64,
}

enum Flow {
    Continue,
    Close,
}

/// One connected client.
pub struct Session<T: Transport> {
    transport: T,
    db: DatabaseController,
    broker: Broker,
    upload_limit: u32,
    nonce: Vec<u8>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    notices: mpsc::UnboundedReceiver<Notice>,
    auth: Option<AuthInfo>,
    /// Device id assigned to a parked import, while awaiting the grant.
    pending_import: Option<Uuid>,
    /// Outstanding download queue; the front entry has been sent and awaits
    /// its ack.
    download: Option<VecDeque<PendingChange>>,
}

enum Wake {
    Frame(Option<Vec<u8>>),
    Notice(Option<Notice>),
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, db: DatabaseController, broker: Broker, upload_limit: u32) -> Self {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let mut nonce = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Self {
            transport,
            db,
            broker,
            upload_limit,
            nonce,
            notice_tx,
            notices,
            auth: None,
            pending_import: None,
            download: None,
        }
    }

    /// Serve the connection until the peer disconnects or a fatal error.
    pub async fn run(mut self) {
        let identify = Message::Identify(IdentifyMessage {
            nonce: self.nonce.clone(),
            upload_limit: self.upload_limit,
        });
        if self.send(&identify).await.is_err() {
            return;
        }

        loop {
            let wake = tokio::select! {
                frame = self.transport.recv() => Wake::Frame(frame.and_then(|r| r.ok())),
                notice = self.notices.recv() => Wake::Notice(notice),
            };

            let flow = match wake {
                Wake::Frame(Some(frame)) => self.handle_frame(frame).await,
                Wake::Frame(None) => break,
                Wake::Notice(Some(notice)) => self.handle_notice(notice).await,
                Wake::Notice(None) => break,
            };
            if matches!(flow, Flow::Close) {
                break;
            }
        }

        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(auth) = &self.auth {
            self.broker
                .deregister(auth.user_id, auth.device_id, &self.notice_tx);
        }
        if let Some(device_id) = self.pending_import.take() {
            let _ = self.broker.take_import(device_id);
        }
    }

    async fn send(&mut self, message: &Message) -> std::result::Result<(), ()> {
        self.transport.send(message.encode()).await.map_err(|e| {
            tracing::debug!("session send failed: {e}");
        })
    }

    async fn report(&mut self, error: ServerError) -> Flow {
        tracing::warn!("session error: {error}");
        let fatal = error.is_fatal();
        let _ = self.send(&Message::Error(error.to_message())).await;
        if fatal {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    // -- inbound -------------------------------------------------------------

    async fn handle_frame(&mut self, frame: Vec<u8>) -> Flow {
        if frame == PING {
            let _ = self.transport.send(PING.to_vec()).await;
            return Flow::Continue;
        }

        let result = if self.auth.is_some() {
            self.handle_exchange_frame(&frame).await
        } else if self.pending_import.is_some() {
            Err(ServerError::UnexpectedMessage(
                "client talked while awaiting grant".to_string(),
            ))
        } else {
            self.handle_auth_frame(&frame).await
        };

        match result {
            Ok(flow) => flow,
            Err(error) => self.report(error).await,
        }
    }

    /// First frame of a connection: a signed `Register`, `Login`, or
    /// `Access` envelope.
    async fn handle_auth_frame(&mut self, frame: &[u8]) -> Result<Flow> {
        let signed = decode_signed(frame)
            .map_err(|e| ServerError::Client(format!("malformed auth frame: {e}")))?;
        let body = &frame[..signed.signed_len];

        match signed.message {
            Message::Register(message) => {
                verify_embedded_signature(&message.sign_scheme, &message.sign_key, body, &signed.signature)?;
                self.verify_nonce(&message.nonce)?;
                self.on_register(message).await
            }
            Message::Login(message) => {
                let record = self
                    .db
                    .device_by_id(message.device_id)
                    .await?
                    .ok_or_else(|| {
                        ServerError::Authentication(format!("unknown device {}", message.device_id))
                    })?;
                CryptoController::verify_peer_signature(
                    &record.sign_scheme,
                    &record.sign_key,
                    body,
                    &signed.signature,
                )
                .map_err(|e| ServerError::Authentication(format!("signature rejected: {e}")))?;
                self.verify_nonce(&message.nonce)?;
                self.on_login(message, record).await
            }
            Message::Access(message) => {
                verify_embedded_signature(&message.sign_scheme, &message.sign_key, body, &signed.signature)?;
                self.verify_nonce(&message.nonce)?;
                self.on_access(message).await
            }
            other => Err(ServerError::UnexpectedMessage(format!(
                "{} before authentication",
                other.type_name()
            ))),
        }
    }

    fn verify_nonce(&self, nonce: &[u8]) -> Result<()> {
        if nonce == self.nonce.as_slice() {
            Ok(())
        } else {
            Err(ServerError::Authentication("nonce mismatch".to_string()))
        }
    }

    async fn on_register(&mut self, message: RegisterMessage) -> Result<Flow> {
        let device_id = Uuid::new_v4();
        let fingerprint = primitives::fingerprint(
            &message.sign_scheme,
            &message.sign_key,
            &message.crypt_scheme,
            &message.crypt_key,
        );
        let user_id = self
            .db
            .create_identity(NewDevice {
                device_id,
                name: message.device_name,
                sign_scheme: message.sign_scheme,
                sign_key: message.sign_key,
                crypt_scheme: message.crypt_scheme,
                crypt_key: message.crypt_key,
                fingerprint,
                key_index: 0,
                key_cmac: Some(message.cmac),
            })
            .await?;
        let record = self
            .db
            .device_by_id(device_id)
            .await?
            .ok_or_else(|| ServerError::Internal("registered device vanished".to_string()))?;

        self.authenticate(user_id, device_id, record.row_id);
        tracing::info!(%user_id, %device_id, "registered new identity");
        let _ = self.send(&Message::Account(AccountMessage { device_id })).await;
        Ok(Flow::Continue)
    }

    async fn on_login(&mut self, message: LoginMessage, record: DeviceRecord) -> Result<Flow> {
        let has_changes = self.db.count_pending(record.row_id).await? > 0;
        let key_updates = self
            .db
            .pending_key_updates(record.row_id)
            .await?
            .into_iter()
            .map(|update| WelcomeKeyUpdate {
                index: update.key_index,
                scheme: update.scheme,
                cipher: update.cipher,
                cmac: update.cmac,
            })
            .collect();

        self.authenticate(record.user_id, record.device_id, record.row_id);
        tracing::info!(
            user_id = %record.user_id,
            device_id = %record.device_id,
            name = %message.device_name,
            "device logged in"
        );
        let _ = self
            .send(&Message::Welcome(WelcomeMessage { has_changes, key_updates }))
            .await;
        Ok(Flow::Continue)
    }

    async fn on_access(&mut self, message: AccessMessage) -> Result<Flow> {
        let partner = self
            .db
            .device_by_id(message.partner_id)
            .await?
            .ok_or_else(|| {
                ServerError::Access(format!("unknown partner device {}", message.partner_id))
            })?;
        if !self.broker.is_online(partner.user_id, partner.device_id) {
            return Err(ServerError::Access("partner device is not available".to_string()));
        }

        let device_id = Uuid::new_v4();
        self.broker.park_import(ImportRequest {
            user_id: partner.user_id,
            device_id,
            device_name: message.device_name.clone(),
            sign_scheme: message.sign_scheme.clone(),
            sign_key: message.sign_key.clone(),
            crypt_scheme: message.crypt_scheme.clone(),
            crypt_key: message.crypt_key.clone(),
            session: self.notice_tx.clone(),
        });

        let proof = ProofMessage {
            pnonce: message.pnonce,
            partner_id: message.partner_id,
            device_id,
            device_name: message.device_name,
            sign_scheme: message.sign_scheme,
            sign_key: message.sign_key,
            crypt_scheme: message.crypt_scheme,
            crypt_key: message.crypt_key,
            mac_scheme: message.mac_scheme,
            cmac: message.mac_cmac,
            trustmac: message.trustmac,
        };
        if !self
            .broker
            .notify_device(partner.user_id, partner.device_id, Notice::Proof(proof))
        {
            let _ = self.broker.take_import(device_id);
            return Err(ServerError::Access("partner device went away".to_string()));
        }

        self.pending_import = Some(device_id);
        tracing::info!(%device_id, partner = %partner.device_id, "relayed import proof");
        Ok(Flow::Continue)
    }

    fn authenticate(&mut self, user_id: Uuid, device_id: Uuid, device_row: i64) {
        self.broker.register(user_id, device_id, self.notice_tx.clone());
        self.auth = Some(AuthInfo {
            user_id,
            device_id,
            device_row,
        });
    }

    fn auth(&self) -> Result<&AuthInfo> {
        self.auth
            .as_ref()
            .ok_or_else(|| ServerError::Internal("exchange frame without auth".to_string()))
    }

    async fn handle_exchange_frame(&mut self, frame: &[u8]) -> Result<Flow> {
        let message = Message::decode(frame)
            .map_err(|e| ServerError::Client(format!("malformed frame: {e}")))?;
        match message {
            Message::Change(m) => self.on_change(m).await?,
            Message::DeviceChange(m) => self.on_device_change(m).await?,
            Message::ChangedAck(m) => self.on_changed_ack(m).await?,
            Message::Sync => self.start_download(true).await?,
            Message::ListDevices => self.on_list_devices().await?,
            Message::Remove(m) => self.on_remove(m).await?,
            Message::KeyChange(m) => self.on_key_change(m).await?,
            Message::NewKey(m) => self.on_new_key(m).await?,
            Message::MacUpdate(m) => self.on_mac_update(m).await?,
            Message::Accept(m) => self.on_accept(m).await?,
            Message::Deny(m) => self.on_deny(m).await?,
            other => {
                return Err(ServerError::UnexpectedMessage(
                    other.type_name().to_string(),
                ))
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_change(&mut self, message: ChangeMessage) -> Result<()> {
        if message.data.len() > self.upload_limit as usize {
            return Err(ServerError::Client("payload exceeds upload limit".to_string()));
        }
        let auth = self.auth()?;
        let (user_id, writer) = (auth.user_id, auth.device_id);
        let (data_type, key) = split_key(&message.key);
        let envelope = encode_envelope(message.key_index, &message.salt, &message.data);
        let data_id = self
            .db
            .save(user_id, writer, data_type, key, envelope)
            .await?;

        let _ = self.send(&Message::ChangeAck(ChangeAckMessage { data_id })).await;
        self.broker.notify_peers(user_id, writer);
        Ok(())
    }

    async fn on_device_change(&mut self, message: DeviceChangeMessage) -> Result<()> {
        if message.data.len() > self.upload_limit as usize {
            return Err(ServerError::Client("payload exceeds upload limit".to_string()));
        }
        let auth = self.auth()?;
        let user_id = auth.user_id;
        let (data_type, key) = split_key(&message.key);
        let envelope = encode_envelope(message.key_index, &message.salt, &message.data);
        let data_id = self
            .db
            .save_device_change(user_id, message.device_id, data_type, key, envelope)
            .await?;

        let _ = self
            .send(&Message::DeviceChangeAck(DeviceChangeAckMessage {
                data_id,
                device_id: message.device_id,
            }))
            .await;
        self.broker
            .notify_device(user_id, message.device_id, Notice::DataChanged);
        Ok(())
    }

    /// Start (or skip) a download stream. The pending queue is served one
    /// change at a time: the next frame goes out only once the previous one
    /// was acknowledged.
    async fn start_download(&mut self, explicit: bool) -> Result<()> {
        if self.download.is_some() {
            return Ok(());
        }
        let device_row = self.auth()?.device_row;
        let pending = self.db.pending_changes(device_row).await?;
        if pending.is_empty() {
            if explicit {
                let _ = self.send(&Message::LastChanged).await;
            }
            return Ok(());
        }

        let mut queue: VecDeque<PendingChange> = pending.into();
        let first = queue.front().cloned().expect("queue is non-empty");
        let info = Message::ChangedInfo(ChangedInfoMessage {
            change_estimate: queue.len() as u32,
            data_index: first.data_index,
            key_index: first.key_index,
            salt: first.salt,
            data: first.data,
        });
        self.download = Some(queue);
        let _ = self.send(&info).await;
        Ok(())
    }

    async fn on_changed_ack(&mut self, message: ChangedAckMessage) -> Result<()> {
        let device_row = self.auth()?.device_row;
        self.db.mark_consumed(device_row, message.data_index).await?;

        let Some(queue) = self.download.as_mut() else {
            return Ok(());
        };
        if queue.front().map(|c| c.data_index) == Some(message.data_index) {
            queue.pop_front();
        }

        match self.download.as_mut().and_then(|q| q.front().cloned()) {
            Some(next) => {
                let _ = self
                    .send(&Message::Changed(ChangedMessage {
                        data_index: next.data_index,
                        key_index: next.key_index,
                        salt: next.salt,
                        data: next.data,
                    }))
                    .await;
            }
            None => {
                // Pick up anything that arrived while streaming.
                let fresh = self.db.pending_changes(device_row).await?;
                if fresh.is_empty() {
                    self.download = None;
                    let _ = self.send(&Message::LastChanged).await;
                } else {
                    let mut queue: VecDeque<PendingChange> = fresh.into();
                    let next = queue.front().cloned().expect("queue is non-empty");
                    self.download = Some(queue);
                    let _ = self
                        .send(&Message::Changed(ChangedMessage {
                            data_index: next.data_index,
                            key_index: next.key_index,
                            salt: next.salt,
                            data: next.data,
                        }))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn on_list_devices(&mut self) -> Result<()> {
        let user_id = self.auth()?.user_id;
        let devices = self
            .db
            .list_devices(user_id)
            .await?
            .into_iter()
            .map(|record| DeviceListEntry {
                device_id: record.device_id,
                name: record.name,
                fingerprint: record.fingerprint,
            })
            .collect();
        let _ = self.send(&Message::Devices(DevicesMessage { devices })).await;
        Ok(())
    }

    async fn on_remove(&mut self, message: RemoveMessage) -> Result<()> {
        let auth = self.auth()?;
        let (user_id, own_device) = (auth.user_id, auth.device_id);
        if !self.db.remove_device(user_id, message.device_id).await? {
            return Err(ServerError::Client(format!(
                "unknown device {}",
                message.device_id
            )));
        }

        tracing::info!(%user_id, device_id = %message.device_id, "device removed");
        let _ = self
            .send(&Message::Removed(RemovedMessage {
                device_id: message.device_id,
            }))
            .await;

        if message.device_id == own_device {
            // Self-removal (account reset): stop serving this identity.
            self.broker.deregister(user_id, own_device, &self.notice_tx);
            self.auth = None;
            self.download = None;
        } else {
            self.broker.notify_device(
                user_id,
                message.device_id,
                Notice::Removed {
                    device_id: message.device_id,
                },
            );
        }
        Ok(())
    }

    async fn on_key_change(&mut self, message: KeyChangeMessage) -> Result<()> {
        let auth = self.auth()?;
        let (user_id, device_row) = (auth.user_id, auth.device_row);
        let outcome = self
            .db
            .propose_key_change(user_id, device_row, message.next_index)
            .await?;

        let reply = match outcome {
            KeyChangeOutcome::Duplicated => DeviceKeysMessage {
                key_index: message.next_index,
                duplicated: true,
                devices: Vec::new(),
            },
            KeyChangeOutcome::Devices(devices) => DeviceKeysMessage {
                key_index: message.next_index,
                duplicated: false,
                devices: devices
                    .into_iter()
                    // Devices that never proved key possession cannot take
                    // part in the rotation.
                    .filter_map(|record| {
                        let cmac = record.key_cmac?;
                        Some(DeviceKeyInfo {
                            device_id: record.device_id,
                            sign_scheme: record.sign_scheme,
                            sign_key: record.sign_key,
                            crypt_scheme: record.crypt_scheme,
                            crypt_key: record.crypt_key,
                            cmac,
                        })
                    })
                    .collect(),
            },
        };
        let _ = self.send(&Message::DeviceKeys(reply)).await;
        Ok(())
    }

    async fn on_new_key(&mut self, message: NewKeyMessage) -> Result<()> {
        let auth = self.auth()?;
        let (user_id, device_row) = (auth.user_id, auth.device_row);
        let updates = message
            .device_keys
            .iter()
            .map(|update| (update.device_id, update.cipher.clone(), update.cmac.clone()))
            .collect();
        self.db
            .store_new_key(user_id, device_row, message.key_index, message.scheme, updates)
            .await?;

        tracing::info!(%user_id, key_index = message.key_index, "symmetric key rotated");
        let _ = self
            .send(&Message::NewKeyAck(NewKeyAckMessage {
                key_index: message.key_index,
            }))
            .await;
        Ok(())
    }

    async fn on_mac_update(&mut self, message: MacUpdateMessage) -> Result<()> {
        let auth = self.auth()?;
        let (user_id, device_row) = (auth.user_id, auth.device_row);
        let current = self.db.user_key_index(user_id).await?;
        if message.key_index > current {
            return Err(ServerError::KeyIndex(format!(
                "mac update for unknown key index {}",
                message.key_index
            )));
        }
        self.db
            .update_device_mac(device_row, message.key_index, message.cmac)
            .await?;
        let _ = self.send(&Message::MacUpdateAck).await;
        Ok(())
    }

    async fn on_accept(&mut self, message: AcceptMessage) -> Result<()> {
        let auth = self.auth()?;
        let user_id = auth.user_id;
        let request = self
            .broker
            .take_import(message.device_id)
            .ok_or_else(|| ServerError::Client("accept for unknown import".to_string()))?;
        if request.user_id != user_id {
            return Err(ServerError::Access("import belongs to another account".to_string()));
        }

        let fingerprint = primitives::fingerprint(
            &request.sign_scheme,
            &request.sign_key,
            &request.crypt_scheme,
            &request.crypt_key,
        );
        self.db
            .identify(
                user_id,
                NewDevice {
                    device_id: request.device_id,
                    name: request.device_name,
                    sign_scheme: request.sign_scheme,
                    sign_key: request.sign_key,
                    crypt_scheme: request.crypt_scheme,
                    crypt_key: request.crypt_key,
                    fingerprint,
                    key_index: message.key_index,
                    key_cmac: None,
                },
            )
            .await?;

        let granted = request.session.send(Notice::Granted(GrantMessage {
            device_id: message.device_id,
            key_index: message.key_index,
            scheme: message.scheme,
            secret: message.secret,
        }));
        if granted.is_err() {
            tracing::warn!(device_id = %message.device_id, "importing session vanished before grant");
        }
        Ok(())
    }

    async fn on_deny(&mut self, message: DenyMessage) -> Result<()> {
        if let Some(request) = self.broker.take_import(message.device_id) {
            let _ = request.session.send(Notice::Denied {
                device_id: message.device_id,
            });
        }
        Ok(())
    }

    // -- broker notices ------------------------------------------------------

    async fn handle_notice(&mut self, notice: Notice) -> Flow {
        match notice {
            Notice::DataChanged => {
                if self.auth.is_some() {
                    if let Err(e) = self.start_download(false).await {
                        return self.report(e).await;
                    }
                }
                Flow::Continue
            }
            Notice::Proof(proof) => {
                let _ = self.send(&Message::Proof(proof)).await;
                Flow::Continue
            }
            Notice::Granted(grant) => {
                if self.pending_import.take() != Some(grant.device_id) {
                    tracing::warn!("grant for unexpected device");
                    return Flow::Close;
                }
                match self.db.device_by_id(grant.device_id).await {
                    Ok(Some(record)) => {
                        self.authenticate(record.user_id, record.device_id, record.row_id);
                        tracing::info!(device_id = %grant.device_id, "import granted");
                        let _ = self.send(&Message::Grant(grant)).await;
                        Flow::Continue
                    }
                    _ => {
                        let _ = self
                            .report(ServerError::Internal("granted device vanished".to_string()))
                            .await;
                        Flow::Close
                    }
                }
            }
            Notice::Denied { .. } => {
                self.pending_import = None;
                self.report(ServerError::Access(
                    "the partner device did not accept your request".to_string(),
                ))
                .await
            }
            Notice::Removed { device_id } => {
                let _ = self.send(&Message::Removed(RemovedMessage { device_id })).await;
                Flow::Continue
            }
        }
    }
}

fn verify_embedded_signature(
    scheme: &str,
    spki: &[u8],
    body: &[u8],
    signature: &[u8],
) -> Result<()> {
    CryptoController::verify_peer_signature(scheme, spki, body, signature)
        .map_err(|e| ServerError::Authentication(format!("signature rejected: {e}")))
}

/// Split a wire data key of the form `type/key` into its parts.
fn split_key(raw: &str) -> (String, String) {
    match raw.split_once('/') {
        Some((data_type, key)) => (data_type.to_string(), key.to_string()),
        None => (String::new(), raw.to_string()),
    }
}
