//! Transactional persistence of users, devices, data rows, and per-device
//! pending states.
//!
//! Every worker thread owns its own sqlite handle through thread-local
//! storage; handles are opened lazily and torn down with the thread. All
//! public operations run on the blocking pool and are transaction scripts:
//! any failing step rolls the whole transaction back.

use crate::error::{Result, ServerError};
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// A registered device row.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub row_id: i64,
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub fingerprint: Vec<u8>,
    pub key_index: u32,
    pub key_cmac: Option<Vec<u8>>,
}

/// Key material accompanying a registration.
pub struct NewDevice {
    pub device_id: Uuid,
    pub name: String,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub fingerprint: Vec<u8>,
    pub key_index: u32,
    pub key_cmac: Option<Vec<u8>>,
}

/// One pending change for a device.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub data_index: u64,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

/// A staged key update for a device, served in `Welcome`.
#[derive(Debug, Clone)]
pub struct StagedKeyUpdate {
    pub key_index: u32,
    pub scheme: String,
    pub cipher: Vec<u8>,
    pub cmac: Vec<u8>,
}

/// Outcome of a `KeyChange` proposal.
pub enum KeyChangeOutcome {
    /// The same device already completed this rotation; it only needs to
    /// activate its staged key.
    Duplicated,
    /// Rotation may proceed; these peers expect the new key.
    Devices(Vec<DeviceRecord>),
}

thread_local! {
    static CONNECTIONS: RefCell<HashMap<String, Connection>> = RefCell::new(HashMap::new());
}

static MEMORY_DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn open_connection(uri: &str) -> Result<Connection> {
    let conn = if uri.starts_with("file:") {
        Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(uri)?
    };
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    tracing::debug!(thread = ?std::thread::current().id(), "db connected");
    Ok(conn)
}

fn with_connection<T>(uri: &str, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    CONNECTIONS.with(|cell| {
        let mut connections = cell.borrow_mut();
        if !connections.contains_key(uri) {
            connections.insert(uri.to_string(), open_connection(uri)?);
        }
        f(connections.get_mut(uri).expect("connection just inserted"))
    })
}

/// Handle to the server database. Cheap to clone; each worker thread opens
/// its own connection on first use.
#[derive(Clone)]
pub struct DatabaseController {
    uri: String,
}

impl DatabaseController {
    /// Open (and bootstrap) the database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let controller = Self {
            uri: path.to_string_lossy().into_owned(),
        };
        controller.call(bootstrap_schema).await?;
        Ok(controller)
    }

    /// Fresh throwaway database under the system temp directory, for tests.
    pub async fn in_memory() -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "cryptsync-test-{}-{}.db",
            std::process::id(),
            MEMORY_DB_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        Self::open(&path).await
    }

    async fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || with_connection(&uri, f))
            .await
            .map_err(|e| ServerError::Internal(format!("database worker died: {e}")))?
    }

    /// Create a fresh user identity together with its first device.
    pub async fn create_identity(&self, device: NewDevice) -> Result<Uuid> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let user_id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO users (identity, keyindex) VALUES (?1, 0)",
                params![user_id.to_string()],
            )?;
            insert_device(&tx, user_id, &device)?;
            tx.commit()?;
            Ok(user_id)
        })
        .await
    }

    /// Attach a device to an existing user. The user must exist; re-adding
    /// the same device is a no-op.
    pub async fn identify(&self, user_id: Uuid, device: NewDevice) -> Result<i64> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT identity FROM users WHERE identity = ?1)",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(ServerError::Authentication(format!(
                    "unknown user {user_id}"
                )));
            }
            let row_id = insert_device(&tx, user_id, &device)?;
            tx.commit()?;
            Ok(row_id)
        })
        .await
    }

    /// Look up a device by its public id.
    pub async fn device_by_id(&self, device_id: Uuid) -> Result<Option<DeviceRecord>> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, deviceid, userid, name, signscheme, signkey,
                        cryptscheme, cryptkey, fingerprint, keyindex, keycmac
                 FROM devices WHERE deviceid = ?1",
                params![device_id.to_string()],
                device_record_from_row,
            )
            .optional()
            .map_err(ServerError::from)
        })
        .await
    }

    /// Upsert a data row and enqueue a pending state for every peer device
    /// of the same user except the writer. Idempotent under replay.
    pub async fn save(
        &self,
        user_id: Uuid,
        writer_device_id: Uuid,
        data_type: String,
        key: String,
        envelope: serde_json::Value,
    ) -> Result<u64> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let index = upsert_data_row(&tx, user_id, &data_type, &key, &envelope)?;
            tx.execute(
                "INSERT INTO states (dataindex, deviceid)
                 SELECT ?1, id FROM devices
                 WHERE userid = ?2 AND deviceid != ?3
                 ON CONFLICT DO NOTHING",
                params![index as i64, user_id.to_string(), writer_device_id.to_string()],
            )?;
            tx.commit()?;
            Ok(index)
        })
        .await
    }

    /// Upsert a data row addressed to a single device (login-grant payload
    /// handoff); only the target device gets a pending state.
    pub async fn save_device_change(
        &self,
        user_id: Uuid,
        target_device_id: Uuid,
        data_type: String,
        key: String,
        envelope: serde_json::Value,
    ) -> Result<u64> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let index = upsert_data_row(&tx, user_id, &data_type, &key, &envelope)?;
            let inserted = tx.execute(
                "INSERT INTO states (dataindex, deviceid)
                 SELECT ?1, id FROM devices
                 WHERE userid = ?2 AND deviceid = ?3
                 ON CONFLICT DO NOTHING",
                params![index as i64, user_id.to_string(), target_device_id.to_string()],
            )?;
            if inserted == 0 {
                let known: bool = tx.query_row(
                    "SELECT EXISTS(SELECT id FROM devices WHERE userid = ?1 AND deviceid = ?2)",
                    params![user_id.to_string(), target_device_id.to_string()],
                    |row| row.get(0),
                )?;
                if !known {
                    return Err(ServerError::Client(format!(
                        "unknown target device {target_device_id}"
                    )));
                }
            }
            tx.commit()?;
            Ok(index)
        })
        .await
    }

    /// All pending changes for a device, oldest first.
    pub async fn pending_changes(&self, device_row: i64) -> Result<Vec<PendingChange>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT d.idx, d.data FROM data d
                 JOIN states s ON s.dataindex = d.idx
                 WHERE s.deviceid = ?1
                 ORDER BY d.idx ASC",
            )?;
            let rows = stmt.query_map(params![device_row], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut changes = Vec::new();
            for row in rows {
                let (index, raw) = row?;
                changes.push(decode_envelope(index as u64, &raw)?);
            }
            Ok(changes)
        })
        .await
    }

    pub async fn count_pending(&self, device_row: i64) -> Result<u64> {
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM states WHERE deviceid = ?1",
                params![device_row],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    /// Remove the pending state once the device acknowledged the change.
    pub async fn mark_consumed(&self, device_row: i64, data_index: u64) -> Result<bool> {
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM states WHERE dataindex = ?1 AND deviceid = ?2",
                params![data_index as i64, device_row],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    /// All devices of a user.
    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, deviceid, userid, name, signscheme, signkey,
                        cryptscheme, cryptkey, fingerprint, keyindex, keycmac
                 FROM devices WHERE userid = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![user_id.to_string()], device_record_from_row)?;
            let mut devices = Vec::new();
            for row in rows {
                devices.push(row?);
            }
            Ok(devices)
        })
        .await
    }

    /// Delete a device and everything queued for it.
    pub async fn remove_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM devices WHERE userid = ?1 AND deviceid = ?2",
                    params![user_id.to_string(), device_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(row_id) = row_id else {
                return Ok(false);
            };
            tx.execute("DELETE FROM states WHERE deviceid = ?1", params![row_id])?;
            tx.execute("DELETE FROM keychanges WHERE deviceid = ?1", params![row_id])?;
            tx.execute("DELETE FROM rotations WHERE deviceid = ?1", params![row_id])?;
            tx.execute("DELETE FROM devices WHERE id = ?1", params![row_id])?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// The user's latest symmetric key index.
    pub async fn user_key_index(&self, user_id: Uuid) -> Result<u32> {
        self.call(move |conn| {
            let index: i64 = conn.query_row(
                "SELECT keyindex FROM users WHERE identity = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(index as u32)
        })
        .await
    }

    /// Validate a rotation proposal from a device.
    pub async fn propose_key_change(
        &self,
        user_id: Uuid,
        initiator_row: i64,
        proposed_index: u32,
    ) -> Result<KeyChangeOutcome> {
        self.call(move |conn| {
            let current: i64 = conn.query_row(
                "SELECT keyindex FROM users WHERE identity = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;

            let staged_by: Option<i64> = conn
                .query_row(
                    "SELECT deviceid FROM rotations WHERE userid = ?1 AND keyindex = ?2",
                    params![user_id.to_string(), proposed_index as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(staged_by) = staged_by {
                return if staged_by == initiator_row {
                    Ok(KeyChangeOutcome::Duplicated)
                } else {
                    Err(ServerError::KeyIndex(format!(
                        "key index {proposed_index} was already rotated by another device"
                    )))
                };
            }

            if proposed_index as i64 != current + 1 {
                return Err(ServerError::KeyIndex(format!(
                    "proposed key index {proposed_index} does not follow current {current}"
                )));
            }

            let mut stmt = conn.prepare(
                "SELECT id, deviceid, userid, name, signscheme, signkey,
                        cryptscheme, cryptkey, fingerprint, keyindex, keycmac
                 FROM devices WHERE userid = ?1 AND id != ?2 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![user_id.to_string(), initiator_row], device_record_from_row)?;
            let mut devices = Vec::new();
            for row in rows {
                devices.push(row?);
            }
            Ok(KeyChangeOutcome::Devices(devices))
        })
        .await
    }

    /// Record a completed rotation: bump the user key index and stage one
    /// key update per recipient device.
    pub async fn store_new_key(
        &self,
        user_id: Uuid,
        initiator_row: i64,
        key_index: u32,
        scheme: String,
        updates: Vec<(Uuid, Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: i64 = tx.query_row(
                "SELECT keyindex FROM users WHERE identity = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;
            if key_index as i64 != current + 1 {
                return Err(ServerError::KeyIndex(format!(
                    "new key index {key_index} does not follow current {current}"
                )));
            }
            tx.execute(
                "UPDATE users SET keyindex = ?1 WHERE identity = ?2",
                params![key_index as i64, user_id.to_string()],
            )?;
            tx.execute(
                "INSERT INTO rotations (userid, keyindex, deviceid) VALUES (?1, ?2, ?3)",
                params![user_id.to_string(), key_index as i64, initiator_row],
            )?;
            for (device_id, cipher, cmac) in &updates {
                tx.execute(
                    "INSERT INTO keychanges (deviceid, keyindex, scheme, cipher, cmac)
                     SELECT id, ?1, ?2, ?3, ?4 FROM devices
                     WHERE userid = ?5 AND deviceid = ?6
                     ON CONFLICT DO NOTHING",
                    params![
                        key_index as i64,
                        scheme,
                        cipher,
                        cmac,
                        user_id.to_string(),
                        device_id.to_string()
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Key updates a device has not consumed yet, ordered by index.
    pub async fn pending_key_updates(&self, device_row: i64) -> Result<Vec<StagedKeyUpdate>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT keyindex, scheme, cipher, cmac FROM keychanges
                 WHERE deviceid = ?1 ORDER BY keyindex ASC",
            )?;
            let rows = stmt.query_map(params![device_row], |row| {
                Ok(StagedKeyUpdate {
                    key_index: row.get::<_, i64>(0)? as u32,
                    scheme: row.get(1)?,
                    cipher: row.get(2)?,
                    cmac: row.get(3)?,
                })
            })?;
            let mut updates = Vec::new();
            for row in rows {
                updates.push(row?);
            }
            Ok(updates)
        })
        .await
    }

    /// Record a device's possession proof and drop the consumed staged
    /// updates.
    pub async fn update_device_mac(
        &self,
        device_row: i64,
        key_index: u32,
        cmac: Vec<u8>,
    ) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE devices SET keyindex = ?1, keycmac = ?2 WHERE id = ?3",
                params![key_index as i64, cmac, device_row],
            )?;
            tx.execute(
                "DELETE FROM keychanges WHERE deviceid = ?1 AND keyindex <= ?2",
                params![device_row, key_index as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn bootstrap_schema(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            identity    TEXT PRIMARY KEY NOT NULL UNIQUE,
            keyindex    INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS devices (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            deviceid    TEXT NOT NULL,
            userid      TEXT NOT NULL REFERENCES users(identity),
            name        TEXT NOT NULL,
            signscheme  TEXT NOT NULL,
            signkey     BLOB NOT NULL,
            cryptscheme TEXT NOT NULL,
            cryptkey    BLOB NOT NULL,
            fingerprint BLOB NOT NULL,
            keyindex    INTEGER NOT NULL DEFAULT 0,
            keycmac     BLOB,
            CONSTRAINT device_id UNIQUE (deviceid, userid)
        );

        CREATE TABLE IF NOT EXISTS data (
            idx         INTEGER PRIMARY KEY AUTOINCREMENT,
            userid      TEXT NOT NULL REFERENCES users(identity),
            type        TEXT NOT NULL,
            key         TEXT NOT NULL,
            data        TEXT,
            createdat   INTEGER NOT NULL,
            CONSTRAINT data_id UNIQUE (userid, type, key)
        );

        CREATE TABLE IF NOT EXISTS states (
            dataindex   INTEGER NOT NULL REFERENCES data(idx),
            deviceid    INTEGER NOT NULL REFERENCES devices(id),
            PRIMARY KEY (dataindex, deviceid)
        );

        CREATE TABLE IF NOT EXISTS keychanges (
            deviceid    INTEGER NOT NULL REFERENCES devices(id),
            keyindex    INTEGER NOT NULL,
            scheme      TEXT NOT NULL,
            cipher      BLOB NOT NULL,
            cmac        BLOB NOT NULL,
            PRIMARY KEY (deviceid, keyindex)
        );

        CREATE TABLE IF NOT EXISTS rotations (
            userid      TEXT NOT NULL REFERENCES users(identity),
            keyindex    INTEGER NOT NULL,
            deviceid    INTEGER NOT NULL REFERENCES devices(id),
            PRIMARY KEY (userid, keyindex)
        );

        CREATE INDEX IF NOT EXISTS idx_states_device ON states(deviceid);
        CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(userid);",
    )?;
    Ok(())
}

fn insert_device(tx: &rusqlite::Transaction<'_>, user_id: Uuid, device: &NewDevice) -> Result<i64> {
    tx.execute(
        "INSERT INTO devices (deviceid, userid, name, signscheme, signkey,
                              cryptscheme, cryptkey, fingerprint, keyindex, keycmac)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (deviceid, userid) DO NOTHING",
        params![
            device.device_id.to_string(),
            user_id.to_string(),
            device.name,
            device.sign_scheme,
            device.sign_key,
            device.crypt_scheme,
            device.crypt_key,
            device.fingerprint,
            device.key_index as i64,
            device.key_cmac,
        ],
    )?;
    let row_id: i64 = tx.query_row(
        "SELECT id FROM devices WHERE deviceid = ?1 AND userid = ?2",
        params![device.device_id.to_string(), user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(row_id)
}

fn upsert_data_row(
    tx: &rusqlite::Transaction<'_>,
    user_id: Uuid,
    data_type: &str,
    key: &str,
    envelope: &serde_json::Value,
) -> Result<u64> {
    let raw = serde_json::to_string(envelope)
        .map_err(|e| ServerError::Internal(format!("encode data envelope: {e}")))?;
    let existing: Option<i64> = tx
        .query_row(
            "SELECT idx FROM data WHERE userid = ?1 AND type = ?2 AND key = ?3",
            params![user_id.to_string(), data_type, key],
            |row| row.get(0),
        )
        .optional()?;
    let index = match existing {
        Some(index) => {
            tx.execute("UPDATE data SET data = ?1 WHERE idx = ?2", params![raw, index])?;
            index
        }
        None => {
            tx.execute(
                "INSERT INTO data (userid, type, key, data, createdat) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id.to_string(),
                    data_type,
                    key,
                    raw,
                    Utc::now().timestamp()
                ],
            )?;
            tx.last_insert_rowid()
        }
    };
    Ok(index as u64)
}

fn device_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let device_id: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    Ok(DeviceRecord {
        row_id: row.get(0)?,
        device_id: Uuid::parse_str(&device_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        user_id: Uuid::parse_str(&user_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        name: row.get(3)?,
        sign_scheme: row.get(4)?,
        sign_key: row.get(5)?,
        crypt_scheme: row.get(6)?,
        crypt_key: row.get(7)?,
        fingerprint: row.get(8)?,
        key_index: row.get::<_, i64>(9)? as u32,
        key_cmac: row.get(10)?,
    })
}

/// Encode the encrypted payload envelope stored in the `data` column.
pub fn encode_envelope(key_index: u32, salt: &[u8], data: &[u8]) -> serde_json::Value {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    serde_json::json!({
        "keyIndex": key_index,
        "salt": BASE64.encode(salt),
        "data": BASE64.encode(data),
    })
}

fn decode_envelope(data_index: u64, raw: &str) -> Result<PendingChange> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ServerError::Internal(format!("corrupt data envelope: {e}")))?;
    let key_index = value["keyIndex"]
        .as_u64()
        .ok_or_else(|| ServerError::Internal("data envelope without keyIndex".to_string()))?;
    let salt = BASE64
        .decode(value["salt"].as_str().unwrap_or_default())
        .map_err(|e| ServerError::Internal(format!("corrupt salt: {e}")))?;
    let data = BASE64
        .decode(value["data"].as_str().unwrap_or_default())
        .map_err(|e| ServerError::Internal(format!("corrupt data: {e}")))?;
    Ok(PendingChange {
        data_index,
        key_index: key_index as u32,
        salt,
        data,
    })
}
