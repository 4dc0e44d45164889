//! The message broker: routes server-initiated traffic between live
//! sessions. Each session registers an unbounded sender; notices are
//! marshalled onto the target session's loop.

use cryptsync_core::protocol::messages::{GrantMessage, ProofMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Cross-session notifications.
#[derive(Debug)]
pub enum Notice {
    /// New data rows are pending for the receiving device.
    DataChanged,
    /// An import request that must be proven to the partner device.
    Proof(ProofMessage),
    /// The partner accepted; deliver the grant to the importing session.
    Granted(GrantMessage),
    /// The partner denied the import.
    Denied { device_id: Uuid },
    /// The receiving device was removed from the account.
    Removed { device_id: Uuid },
}

/// A parked import handshake, waiting for the partner's verdict.
pub struct ImportRequest {
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub device_name: String,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub session: mpsc::UnboundedSender<Notice>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<(Uuid, Uuid), mpsc::UnboundedSender<Notice>>,
    imports: HashMap<Uuid, ImportRequest>,
}

/// Shared registry of live sessions, keyed by (user, device).
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Mutex<Inner>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: Uuid, device_id: Uuid, sender: mpsc::UnboundedSender<Notice>) {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert((user_id, device_id), sender);
    }

    /// Remove a session's registration. The sender is compared so a dying
    /// session cannot evict its successor after a quick reconnect.
    pub fn deregister(&self, user_id: Uuid, device_id: Uuid, sender: &mpsc::UnboundedSender<Notice>) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .sessions
            .get(&(user_id, device_id))
            .is_some_and(|current| current.same_channel(sender))
        {
            inner.sessions.remove(&(user_id, device_id));
        }
    }

    pub fn is_online(&self, user_id: Uuid, device_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .contains_key(&(user_id, device_id))
    }

    /// Deliver a notice to one device's session. Returns false if offline.
    pub fn notify_device(&self, user_id: Uuid, device_id: Uuid, notice: Notice) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.sessions.get(&(user_id, device_id)) {
            Some(sender) => sender.send(notice).is_ok(),
            None => false,
        }
    }

    /// Wake every other session of the same user.
    pub fn notify_peers(&self, user_id: Uuid, exclude_device: Uuid) {
        let inner = self.inner.lock().unwrap();
        for ((user, device), sender) in inner.sessions.iter() {
            if *user == user_id && *device != exclude_device {
                let _ = sender.send(Notice::DataChanged);
            }
        }
    }

    pub fn park_import(&self, request: ImportRequest) {
        self.inner
            .lock()
            .unwrap()
            .imports
            .insert(request.device_id, request);
    }

    pub fn take_import(&self, device_id: Uuid) -> Option<ImportRequest> {
        self.inner.lock().unwrap().imports.remove(&device_id)
    }
}
