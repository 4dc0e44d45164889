//! Full-stack exchange tests: real connectors against real server sessions
//! over in-memory transports.

use cryptsync_core::connector::settings::{Settings, SettingsBackend};
use cryptsync_core::connector::transport::{Dialer, MemoryTransport, TransportError};
use cryptsync_core::connector::{ConnectorOptions, RemoteConnector, RemoteConnectorHandle, RemoteEvent};
use cryptsync_core::crypto::controller::derive_export_key;
use cryptsync_core::crypto::keystore::{KeyStore, KeyStoreProvider, KeyStoreRegistry};
use cryptsync_core::crypto::{CryptoController, CryptoError};
use cryptsync_server::broker::Broker;
use cryptsync_server::database::DatabaseController;
use cryptsync_server::session::Session;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;
use zeroize::Zeroizing;

// -- client fixtures ---------------------------------------------------------

#[derive(Clone, Default)]
struct SharedBackend(Arc<Mutex<BTreeMap<String, String>>>);

impl SettingsBackend for SharedBackend {
    fn get(&self, key: &str) -> Option<String> {
        self.0.lock().unwrap().get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.0.lock().unwrap().insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.0.lock().unwrap().remove(key);
    }

    fn remove_group(&mut self, prefix: &str) {
        self.0.lock().unwrap().retain(|k, _| !k.starts_with(prefix));
    }

    fn keys_in_group(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

struct SharedKeyStore {
    map: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl KeyStore for SharedKeyStore {
    fn open(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn contains(&self, label: &str) -> Result<bool, CryptoError> {
        Ok(self.map.lock().unwrap().contains_key(label))
    }

    fn load_private_key(&self, label: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.map
            .lock()
            .unwrap()
            .get(label)
            .map(|v| Zeroizing::new(v.clone()))
            .ok_or_else(|| CryptoError::KeyStoreMissing(label.to_string()))
    }

    fn store_private_key(&mut self, label: &str, der: &[u8]) -> Result<(), CryptoError> {
        self.map.lock().unwrap().insert(label.to_string(), der.to_vec());
        Ok(())
    }

    fn remove_private_key(&mut self, label: &str) -> Result<(), CryptoError> {
        self.map.lock().unwrap().remove(label);
        Ok(())
    }

    fn labels_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CryptoError> {
        let mut labels: Vec<String> = self
            .map
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        labels.sort();
        Ok(labels)
    }
}

struct SharedKeyStoreProvider {
    map: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl KeyStoreProvider for SharedKeyStoreProvider {
    fn name(&self) -> &str {
        "shared"
    }

    fn create(&self) -> Box<dyn KeyStore> {
        Box::new(SharedKeyStore {
            map: self.map.clone(),
        })
    }
}

/// One client device: settings and key store that survive restarts.
struct Device {
    settings_map: Arc<Mutex<BTreeMap<String, String>>>,
    keystore_map: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Device {
    fn new(name: &'static str) -> Self {
        let device = Self {
            settings_map: Arc::default(),
            keystore_map: Arc::default(),
        };
        let mut settings = device.settings();
        settings.set_remote_url("wss://sync.example.org");
        settings.set_device_name(name);
        device
    }

    fn settings(&self) -> Settings {
        Settings::new(Box::new(SharedBackend(self.settings_map.clone())))
    }

    fn crypto(&self) -> CryptoController {
        let mut registry = KeyStoreRegistry::new();
        registry.register(Box::new(SharedKeyStoreProvider {
            map: self.keystore_map.clone(),
        }));
        let mut crypto = CryptoController::new();
        crypto.initialize(&registry, "shared").unwrap();
        crypto
    }

    fn device_id(&self) -> Option<Uuid> {
        self.settings()
            .device_id()
    }
}

// -- the in-process server ---------------------------------------------------

/// Dialer that spawns a fresh real session per connection attempt.
#[derive(Clone)]
struct ServerDialer {
    db: DatabaseController,
    broker: Broker,
}

impl Dialer for ServerDialer {
    type Transport = MemoryTransport;

    async fn connect(
        &mut self,
        _url: &str,
        _access_key: &str,
        _headers: &[(String, Vec<u8>)],
    ) -> Result<MemoryTransport, TransportError> {
        let (client_side, server_side) = MemoryTransport::pair();
        let session = Session::new(server_side, self.db.clone(), self.broker.clone(), 1 << 20);
        tokio::spawn(session.run());
        Ok(client_side)
    }
}

struct TestServer {
    db: DatabaseController,
    dialer: ServerDialer,
}

impl TestServer {
    async fn new() -> Self {
        let db = DatabaseController::in_memory().await.unwrap();
        let dialer = ServerDialer {
            db: db.clone(),
            broker: Broker::new(),
        };
        Self { db, dialer }
    }

    fn start_client(
        &self,
        device: &Device,
    ) -> (
        RemoteConnectorHandle,
        mpsc::UnboundedReceiver<RemoteEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (connector, handle, events) = RemoteConnector::new(
            self.dialer.clone(),
            device.crypto(),
            device.settings(),
            ConnectorOptions::default(),
        );
        let task = tokio::spawn(connector.run());
        (handle, events, task)
    }
}

async fn wait_for<F: Fn(&RemoteEvent) -> bool>(
    events: &mut mpsc::UnboundedReceiver<RemoteEvent>,
    what: &str,
    predicate: F,
) -> RemoteEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// Register device A, then join device B to the account through a trusted
/// (password) import.
async fn establish_account(
    server: &TestServer,
    a: &Device,
    b: &Device,
) -> (
    RemoteConnectorHandle,
    mpsc::UnboundedReceiver<RemoteEvent>,
    RemoteConnectorHandle,
    mpsc::UnboundedReceiver<RemoteEvent>,
) {
    let (a_handle, mut a_events, _a_task) = server.start_client(a);
    wait_for(&mut a_events, "A ready", |e| matches!(e, RemoteEvent::RemoteReady)).await;

    let (export, salt) = a_handle
        .export_account(false, Some("correct horse".to_string()))
        .await
        .unwrap();
    assert!(export.trusted);

    let key = derive_export_key("correct horse", &salt).unwrap();
    let mut b_settings = b.settings();
    b_settings.set_import(
        &export.pnonce,
        export.partner_id,
        &export.scheme,
        &export.cmac,
        Some(key.as_bytes().as_slice()),
    );

    // The grant reaches idle state first, then the import record is
    // cleared, so `ImportCompleted` is the completion signal.
    let (b_handle, mut b_events, _b_task) = server.start_client(b);
    wait_for(&mut b_events, "B import", |e| matches!(e, RemoteEvent::ImportCompleted)).await;
    wait_for(&mut a_events, "A granted", |e| {
        matches!(e, RemoteEvent::AccountAccessGranted { .. })
    })
    .await;

    (a_handle, a_events, b_handle, b_events)
}

// -- tests -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_creates_identity_on_server() {
    let server = TestServer::new().await;
    let a = Device::new("host-1");

    let (_handle, mut events, _task) = server.start_client(&a);
    wait_for(&mut events, "ready", |e| matches!(e, RemoteEvent::RemoteReady)).await;

    let device_id = a.device_id().expect("device id persisted");
    let record = server.db.device_by_id(device_id).await.unwrap().unwrap();
    assert_eq!(record.name, "host-1");
    assert_eq!(record.key_index, 0);
    assert!(record.key_cmac.is_some());
    assert_eq!(record.fingerprint.len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trusted_import_grants_access_without_login_prompt() {
    let server = TestServer::new().await;
    let a = Device::new("host-1");
    let b = Device::new("phone-1");

    let (_a_handle, mut a_events, _b_handle, _b_events) =
        establish_account(&server, &a, &b).await;

    // The pre-trusted proof never surfaced a login request on A.
    while let Ok(event) = a_events.try_recv() {
        assert!(
            !matches!(event, RemoteEvent::LoginRequested(_)),
            "trusted import must not prompt"
        );
    }

    // Both devices belong to the same account now.
    let a_record = server
        .db
        .device_by_id(a.device_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    let b_record = server
        .db
        .device_by_id(b.device_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a_record.user_id, b_record.user_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn untrusted_import_waits_for_login_reply() {
    let server = TestServer::new().await;
    let a = Device::new("host-1");
    let b = Device::new("phone-1");

    let (a_handle, mut a_events, _a_task) = server.start_client(&a);
    wait_for(&mut a_events, "A ready", |e| matches!(e, RemoteEvent::RemoteReady)).await;

    let (export, _salt) = a_handle.export_account(false, None).await.unwrap();
    assert!(!export.trusted);

    let mut b_settings = b.settings();
    b_settings.set_import(
        &export.pnonce,
        export.partner_id,
        &export.scheme,
        &export.cmac,
        None,
    );

    let (_b_handle, mut b_events, _b_task) = server.start_client(&b);

    // A is asked to confirm the new device.
    let event = wait_for(&mut a_events, "login request", |e| {
        matches!(e, RemoteEvent::LoginRequested(_))
    })
    .await;
    let RemoteEvent::LoginRequested(info) = event else { unreachable!() };
    assert_eq!(info.name, "phone-1");
    assert_eq!(info.fingerprint.len(), 32);

    a_handle.login_reply(info.device_id, true);
    wait_for(&mut b_events, "B import", |e| matches!(e, RemoteEvent::ImportCompleted)).await;
    wait_for(&mut a_events, "A granted", |e| {
        matches!(e, RemoteEvent::AccountAccessGranted { .. })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn change_fans_out_and_ack_clears_pending_state() {
    let server = TestServer::new().await;
    let a = Device::new("host-1");
    let b = Device::new("phone-1");

    let (a_handle, mut a_events, b_handle, mut b_events) =
        establish_account(&server, &a, &b).await;

    a_handle.upload_data("todo/42", b"buy milk".to_vec());
    wait_for(&mut a_events, "upload ack", |e| matches!(e, RemoteEvent::UploadDone { .. })).await;

    // B is online, so the server pushes the change immediately.
    let event = wait_for(&mut b_events, "download", |e| {
        matches!(e, RemoteEvent::DownloadData { .. })
    })
    .await;
    let RemoteEvent::DownloadData { data_index, data } = event else { unreachable!() };
    assert_eq!(data, b"buy milk");

    // The pending state exists until B acknowledges.
    let b_row = server
        .db
        .device_by_id(b.device_id().unwrap())
        .await
        .unwrap()
        .unwrap()
        .row_id;
    assert_eq!(server.db.count_pending(b_row).await.unwrap(), 1);

    b_handle.download_done(data_index);
    wait_for(&mut b_events, "B back to idle", |e| matches!(e, RemoteEvent::RemoteReady)).await;
    assert_eq!(server.db.count_pending(b_row).await.unwrap(), 0);

    // A never queues its own writes.
    let a_row = server
        .db
        .device_by_id(a.device_id().unwrap())
        .await
        .unwrap()
        .unwrap()
        .row_id;
    assert_eq!(server.db.count_pending(a_row).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn key_rotation_reaches_offline_peer_on_next_login() {
    let server = TestServer::new().await;
    let a = Device::new("host-1");
    let b = Device::new("phone-1");

    let (a_handle, mut a_events, b_handle, mut b_events) =
        establish_account(&server, &a, &b).await;

    // B's possession proof must have landed before the rotation, or B would
    // be excluded from the new key.
    let b_id = b.device_id().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let record = server.db.device_by_id(b_id).await.unwrap().unwrap();
        if record.key_cmac.is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "B never proved its key");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // A rotates the account key while B is online but passive.
    a_handle.init_key_update();

    let user_id = server
        .db
        .device_by_id(a.device_id().unwrap())
        .await
        .unwrap()
        .unwrap()
        .user_id;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while server.db.user_key_index(user_id).await.unwrap() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "rotation did not complete");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // B restarts and receives the staged key update in its welcome.
    b_handle.finalize();
    wait_for(&mut b_events, "B finalized", |e| matches!(e, RemoteEvent::Finalized)).await;

    let (_b2_handle, mut b2_events, _b2_task) = server.start_client(&b);
    wait_for(&mut b2_events, "B relogin", |e| matches!(e, RemoteEvent::RemoteReady)).await;

    // Data encrypted under the new key is readable on B.
    a_handle.upload_data("todo/rotated", b"fresh secret".to_vec());
    wait_for(&mut a_events, "upload ack", |e| matches!(e, RemoteEvent::UploadDone { .. })).await;

    let event = wait_for(&mut b2_events, "download", |e| {
        matches!(e, RemoteEvent::DownloadData { .. })
    })
    .await;
    let RemoteEvent::DownloadData { data, .. } = event else { unreachable!() };
    assert_eq!(data, b"fresh secret");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn list_devices_shows_fleet_and_remove_revokes() {
    let server = TestServer::new().await;
    let a = Device::new("host-1");
    let b = Device::new("phone-1");

    let (a_handle, mut a_events, _b_handle, _b_events) =
        establish_account(&server, &a, &b).await;

    a_handle.list_devices();
    let event = wait_for(&mut a_events, "device list", |e| {
        matches!(e, RemoteEvent::DevicesListed(_))
    })
    .await;
    let RemoteEvent::DevicesListed(devices) = event else { unreachable!() };
    assert_eq!(devices.len(), 2);
    let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
    assert!(names.contains(&"host-1"));
    assert!(names.contains(&"phone-1"));

    let b_id = b.device_id().unwrap();
    a_handle.remove_device(b_id);
    let event = wait_for(&mut a_events, "updated list", |e| {
        matches!(e, RemoteEvent::DevicesListed(devices) if devices.len() == 1)
    })
    .await;
    let RemoteEvent::DevicesListed(devices) = event else { unreachable!() };
    assert_eq!(devices[0].name, "host-1");

    assert!(server.db.device_by_id(b_id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn device_change_reaches_only_the_target() {
    let server = TestServer::new().await;
    let a = Device::new("host-1");
    let b = Device::new("phone-1");

    let (a_handle, mut a_events, _b_handle, mut b_events) =
        establish_account(&server, &a, &b).await;

    let b_id = b.device_id().unwrap();
    a_handle.upload_device_data("todo/handoff", b_id, b"for the new device".to_vec());
    wait_for(&mut a_events, "device upload ack", |e| {
        matches!(e, RemoteEvent::DeviceUploadDone { device_id, .. } if *device_id == b_id)
    })
    .await;

    let event = wait_for(&mut b_events, "targeted download", |e| {
        matches!(e, RemoteEvent::DownloadData { .. })
    })
    .await;
    let RemoteEvent::DownloadData { data, .. } = event else { unreachable!() };
    assert_eq!(data, b"for the new device");
}
