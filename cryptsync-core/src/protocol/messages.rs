//! Message catalog: one struct per wire message and the tagged [`Message`]
//! union decoded by type name.
//!
//! Authenticated client messages (`Register`, `Access`, `Login`) travel in a
//! signed envelope: the encoded body followed by a detached signature over
//! exactly the body bytes.

use crate::protocol::codec::{CodecError, Reader, Writer};
use uuid::Uuid;

/// Keepalive frame: a single byte, bypassing the codec.
pub const PING: &[u8] = &[0xFF];

/// Error categories reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unknown,
    IncompatibleVersion,
    Authentication,
    Access,
    KeyIndex,
    Client,
    Server,
    UnexpectedMessage,
}

impl ErrorKind {
    fn to_wire(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::IncompatibleVersion => 1,
            Self::Authentication => 2,
            Self::Access => 3,
            Self::KeyIndex => 4,
            Self::Client => 5,
            Self::Server => 6,
            Self::UnexpectedMessage => 7,
        }
    }

    fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::IncompatibleVersion,
            2 => Self::Authentication,
            3 => Self::Access,
            4 => Self::KeyIndex,
            5 => Self::Client,
            6 => Self::Server,
            7 => Self::UnexpectedMessage,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub kind: ErrorKind,
    pub message: String,
    pub can_recover: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyMessage {
    pub nonce: Vec<u8>,
    pub upload_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMessage {
    pub device_name: String,
    pub nonce: Vec<u8>,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub cmac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMessage {
    pub device_name: String,
    pub nonce: Vec<u8>,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub pnonce: Vec<u8>,
    pub partner_id: Uuid,
    pub mac_scheme: String,
    pub mac_cmac: Vec<u8>,
    pub trustmac: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginMessage {
    pub device_id: Uuid,
    pub device_name: String,
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountMessage {
    pub device_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantMessage {
    pub device_id: Uuid,
    pub key_index: u32,
    pub scheme: String,
    pub secret: Vec<u8>,
}

/// One staged symmetric key update delivered in a [`WelcomeMessage`],
/// authenticated with a cmac under the key preceding `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeKeyUpdate {
    pub index: u32,
    pub scheme: String,
    pub cipher: Vec<u8>,
    pub cmac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeMessage {
    pub has_changes: bool,
    pub key_updates: Vec<WelcomeKeyUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacUpdateMessage {
    pub key_index: u32,
    pub cmac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChangeMessage {
    pub next_index: u32,
}

/// Peer device entry in a [`DeviceKeysMessage`]: its signing identity and
/// its possession proof for the current (pre-rotation) key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeyInfo {
    pub device_id: Uuid,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub cmac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeysMessage {
    pub key_index: u32,
    pub duplicated: bool,
    pub devices: Vec<DeviceKeyInfo>,
}

/// Per-recipient key update in a [`NewKeyMessage`]: the new secret encrypted
/// for the recipient, cmac'd under the previous key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKeyDevice {
    pub device_id: Uuid,
    pub cipher: Vec<u8>,
    pub cmac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKeyMessage {
    pub key_index: u32,
    pub scheme: String,
    pub device_keys: Vec<NewKeyDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKeyAckMessage {
    pub key_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMessage {
    pub key: String,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChangeMessage {
    pub key: String,
    pub device_id: Uuid,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeAckMessage {
    pub data_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChangeAckMessage {
    pub data_id: u64,
    pub device_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedMessage {
    pub data_index: u64,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedInfoMessage {
    pub change_estimate: u32,
    pub data_index: u64,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedAckMessage {
    pub data_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListEntry {
    pub device_id: Uuid,
    pub name: String,
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicesMessage {
    pub devices: Vec<DeviceListEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveMessage {
    pub device_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedMessage {
    pub device_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofMessage {
    pub pnonce: Vec<u8>,
    pub partner_id: Uuid,
    pub device_id: Uuid,
    pub device_name: String,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub mac_scheme: String,
    pub cmac: Vec<u8>,
    pub trustmac: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptMessage {
    pub device_id: Uuid,
    pub key_index: u32,
    pub scheme: String,
    pub secret: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyMessage {
    pub device_id: Uuid,
}

/// The tagged union of all wire messages, keyed by type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Error(ErrorMessage),
    Identify(IdentifyMessage),
    Register(RegisterMessage),
    Access(AccessMessage),
    Login(LoginMessage),
    Account(AccountMessage),
    Grant(GrantMessage),
    Welcome(WelcomeMessage),
    MacUpdate(MacUpdateMessage),
    MacUpdateAck,
    KeyChange(KeyChangeMessage),
    DeviceKeys(DeviceKeysMessage),
    NewKey(NewKeyMessage),
    NewKeyAck(NewKeyAckMessage),
    Change(ChangeMessage),
    DeviceChange(DeviceChangeMessage),
    ChangeAck(ChangeAckMessage),
    DeviceChangeAck(DeviceChangeAckMessage),
    Changed(ChangedMessage),
    ChangedInfo(ChangedInfoMessage),
    ChangedAck(ChangedAckMessage),
    LastChanged,
    Sync,
    ListDevices,
    Devices(DevicesMessage),
    Remove(RemoveMessage),
    Removed(RemovedMessage),
    Proof(ProofMessage),
    Accept(AcceptMessage),
    Deny(DenyMessage),
}

impl Message {
    /// The wire type name this message travels under.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Error(_) => "Error",
            Self::Identify(_) => "Identify",
            Self::Register(_) => "Register",
            Self::Access(_) => "Access",
            Self::Login(_) => "Login",
            Self::Account(_) => "Account",
            Self::Grant(_) => "Grant",
            Self::Welcome(_) => "Welcome",
            Self::MacUpdate(_) => "MacUpdate",
            Self::MacUpdateAck => "MacUpdateAck",
            Self::KeyChange(_) => "KeyChange",
            Self::DeviceKeys(_) => "DeviceKeys",
            Self::NewKey(_) => "NewKey",
            Self::NewKeyAck(_) => "NewKeyAck",
            Self::Change(_) => "Change",
            Self::DeviceChange(_) => "DeviceChange",
            Self::ChangeAck(_) => "ChangeAck",
            Self::DeviceChangeAck(_) => "DeviceChangeAck",
            Self::Changed(_) => "Changed",
            Self::ChangedInfo(_) => "ChangedInfo",
            Self::ChangedAck(_) => "ChangedAck",
            Self::LastChanged => "LastChanged",
            Self::Sync => "Sync",
            Self::ListDevices => "ListDevices",
            Self::Devices(_) => "Devices",
            Self::Remove(_) => "Remove",
            Self::Removed(_) => "Removed",
            Self::Proof(_) => "Proof",
            Self::Accept(_) => "Accept",
            Self::Deny(_) => "Deny",
        }
    }

    /// Encode the full frame: version, type name, fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str(self.type_name());
        self.encode_fields(&mut w);
        w.finish()
    }

    fn encode_fields(&self, w: &mut Writer) {
        match self {
            Self::Error(m) => {
                w.put_u32(m.kind.to_wire());
                w.put_str(&m.message);
                w.put_bool(m.can_recover);
            }
            Self::Identify(m) => {
                w.put_bytes(&m.nonce);
                w.put_u32(m.upload_limit);
            }
            Self::Register(m) => {
                w.put_str(&m.device_name);
                w.put_bytes(&m.nonce);
                w.put_str(&m.sign_scheme);
                w.put_bytes(&m.sign_key);
                w.put_str(&m.crypt_scheme);
                w.put_bytes(&m.crypt_key);
                w.put_bytes(&m.cmac);
            }
            Self::Access(m) => {
                w.put_str(&m.device_name);
                w.put_bytes(&m.nonce);
                w.put_str(&m.sign_scheme);
                w.put_bytes(&m.sign_key);
                w.put_str(&m.crypt_scheme);
                w.put_bytes(&m.crypt_key);
                w.put_bytes(&m.pnonce);
                w.put_uuid(m.partner_id);
                w.put_str(&m.mac_scheme);
                w.put_bytes(&m.mac_cmac);
                w.put_opt_bytes(m.trustmac.as_deref());
            }
            Self::Login(m) => {
                w.put_uuid(m.device_id);
                w.put_str(&m.device_name);
                w.put_bytes(&m.nonce);
            }
            Self::Account(m) => {
                w.put_uuid(m.device_id);
            }
            Self::Grant(m) => {
                w.put_uuid(m.device_id);
                w.put_u32(m.key_index);
                w.put_str(&m.scheme);
                w.put_bytes(&m.secret);
            }
            Self::Welcome(m) => {
                w.put_bool(m.has_changes);
                w.put_u32(m.key_updates.len() as u32);
                for update in &m.key_updates {
                    w.put_u32(update.index);
                    w.put_str(&update.scheme);
                    w.put_bytes(&update.cipher);
                    w.put_bytes(&update.cmac);
                }
            }
            Self::MacUpdate(m) => {
                w.put_u32(m.key_index);
                w.put_bytes(&m.cmac);
            }
            Self::MacUpdateAck | Self::LastChanged | Self::Sync | Self::ListDevices => {}
            Self::KeyChange(m) => {
                w.put_u32(m.next_index);
            }
            Self::DeviceKeys(m) => {
                w.put_u32(m.key_index);
                w.put_bool(m.duplicated);
                w.put_u32(m.devices.len() as u32);
                for device in &m.devices {
                    w.put_uuid(device.device_id);
                    w.put_str(&device.sign_scheme);
                    w.put_bytes(&device.sign_key);
                    w.put_str(&device.crypt_scheme);
                    w.put_bytes(&device.crypt_key);
                    w.put_bytes(&device.cmac);
                }
            }
            Self::NewKey(m) => {
                w.put_u32(m.key_index);
                w.put_str(&m.scheme);
                w.put_u32(m.device_keys.len() as u32);
                for device in &m.device_keys {
                    w.put_uuid(device.device_id);
                    w.put_bytes(&device.cipher);
                    w.put_bytes(&device.cmac);
                }
            }
            Self::NewKeyAck(m) => {
                w.put_u32(m.key_index);
            }
            Self::Change(m) => {
                w.put_str(&m.key);
                w.put_u32(m.key_index);
                w.put_bytes(&m.salt);
                w.put_bytes(&m.data);
            }
            Self::DeviceChange(m) => {
                w.put_str(&m.key);
                w.put_uuid(m.device_id);
                w.put_u32(m.key_index);
                w.put_bytes(&m.salt);
                w.put_bytes(&m.data);
            }
            Self::ChangeAck(m) => {
                w.put_u64(m.data_id);
            }
            Self::DeviceChangeAck(m) => {
                w.put_u64(m.data_id);
                w.put_uuid(m.device_id);
            }
            Self::Changed(m) => {
                w.put_u64(m.data_index);
                w.put_u32(m.key_index);
                w.put_bytes(&m.salt);
                w.put_bytes(&m.data);
            }
            Self::ChangedInfo(m) => {
                w.put_u32(m.change_estimate);
                w.put_u64(m.data_index);
                w.put_u32(m.key_index);
                w.put_bytes(&m.salt);
                w.put_bytes(&m.data);
            }
            Self::ChangedAck(m) => {
                w.put_u64(m.data_index);
            }
            Self::Devices(m) => {
                w.put_u32(m.devices.len() as u32);
                for device in &m.devices {
                    w.put_uuid(device.device_id);
                    w.put_str(&device.name);
                    w.put_bytes(&device.fingerprint);
                }
            }
            Self::Remove(m) => {
                w.put_uuid(m.device_id);
            }
            Self::Removed(m) => {
                w.put_uuid(m.device_id);
            }
            Self::Proof(m) => {
                w.put_bytes(&m.pnonce);
                w.put_uuid(m.partner_id);
                w.put_uuid(m.device_id);
                w.put_str(&m.device_name);
                w.put_str(&m.sign_scheme);
                w.put_bytes(&m.sign_key);
                w.put_str(&m.crypt_scheme);
                w.put_bytes(&m.crypt_key);
                w.put_str(&m.mac_scheme);
                w.put_bytes(&m.cmac);
                w.put_opt_bytes(m.trustmac.as_deref());
            }
            Self::Accept(m) => {
                w.put_uuid(m.device_id);
                w.put_u32(m.key_index);
                w.put_str(&m.scheme);
                w.put_bytes(&m.secret);
            }
            Self::Deny(m) => {
                w.put_uuid(m.device_id);
            }
        }
    }

    /// Decode a complete frame, rejecting trailing bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data)?;
        let message = Self::decode_inner(&mut reader)?;
        reader.finish()?;
        Ok(message)
    }

    fn decode_inner(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let name = r.get_str()?;
        match name.as_str() {
            "Error" => Ok(Self::Error(ErrorMessage {
                kind: ErrorKind::from_wire(r.get_u32()?),
                message: r.get_str()?,
                can_recover: r.get_bool()?,
            })),
            "Identify" => Ok(Self::Identify(IdentifyMessage {
                nonce: r.get_bytes()?,
                upload_limit: r.get_u32()?,
            })),
            "Register" => Ok(Self::Register(RegisterMessage {
                device_name: r.get_str()?,
                nonce: r.get_bytes()?,
                sign_scheme: r.get_str()?,
                sign_key: r.get_bytes()?,
                crypt_scheme: r.get_str()?,
                crypt_key: r.get_bytes()?,
                cmac: r.get_bytes()?,
            })),
            "Access" => Ok(Self::Access(AccessMessage {
                device_name: r.get_str()?,
                nonce: r.get_bytes()?,
                sign_scheme: r.get_str()?,
                sign_key: r.get_bytes()?,
                crypt_scheme: r.get_str()?,
                crypt_key: r.get_bytes()?,
                pnonce: r.get_bytes()?,
                partner_id: r.get_uuid()?,
                mac_scheme: r.get_str()?,
                mac_cmac: r.get_bytes()?,
                trustmac: r.get_opt_bytes()?,
            })),
            "Login" => Ok(Self::Login(LoginMessage {
                device_id: r.get_uuid()?,
                device_name: r.get_str()?,
                nonce: r.get_bytes()?,
            })),
            "Account" => Ok(Self::Account(AccountMessage {
                device_id: r.get_uuid()?,
            })),
            "Grant" => Ok(Self::Grant(GrantMessage {
                device_id: r.get_uuid()?,
                key_index: r.get_u32()?,
                scheme: r.get_str()?,
                secret: r.get_bytes()?,
            })),
            "Welcome" => Ok(Self::Welcome(WelcomeMessage {
                has_changes: r.get_bool()?,
                key_updates: r.get_list(|r| {
                    Ok(WelcomeKeyUpdate {
                        index: r.get_u32()?,
                        scheme: r.get_str()?,
                        cipher: r.get_bytes()?,
                        cmac: r.get_bytes()?,
                    })
                })?,
            })),
            "MacUpdate" => Ok(Self::MacUpdate(MacUpdateMessage {
                key_index: r.get_u32()?,
                cmac: r.get_bytes()?,
            })),
            "MacUpdateAck" => Ok(Self::MacUpdateAck),
            "KeyChange" => Ok(Self::KeyChange(KeyChangeMessage {
                next_index: r.get_u32()?,
            })),
            "DeviceKeys" => Ok(Self::DeviceKeys(DeviceKeysMessage {
                key_index: r.get_u32()?,
                duplicated: r.get_bool()?,
                devices: r.get_list(|r| {
                    Ok(DeviceKeyInfo {
                        device_id: r.get_uuid()?,
                        sign_scheme: r.get_str()?,
                        sign_key: r.get_bytes()?,
                        crypt_scheme: r.get_str()?,
                        crypt_key: r.get_bytes()?,
                        cmac: r.get_bytes()?,
                    })
                })?,
            })),
            "NewKey" => Ok(Self::NewKey(NewKeyMessage {
                key_index: r.get_u32()?,
                scheme: r.get_str()?,
                device_keys: r.get_list(|r| {
                    Ok(NewKeyDevice {
                        device_id: r.get_uuid()?,
                        cipher: r.get_bytes()?,
                        cmac: r.get_bytes()?,
                    })
                })?,
            })),
            "NewKeyAck" => Ok(Self::NewKeyAck(NewKeyAckMessage {
                key_index: r.get_u32()?,
            })),
            "Change" => Ok(Self::Change(ChangeMessage {
                key: r.get_str()?,
                key_index: r.get_u32()?,
                salt: r.get_bytes()?,
                data: r.get_bytes()?,
            })),
            "DeviceChange" => Ok(Self::DeviceChange(DeviceChangeMessage {
                key: r.get_str()?,
                device_id: r.get_uuid()?,
                key_index: r.get_u32()?,
                salt: r.get_bytes()?,
                data: r.get_bytes()?,
            })),
            "ChangeAck" => Ok(Self::ChangeAck(ChangeAckMessage {
                data_id: r.get_u64()?,
            })),
            "DeviceChangeAck" => Ok(Self::DeviceChangeAck(DeviceChangeAckMessage {
                data_id: r.get_u64()?,
                device_id: r.get_uuid()?,
            })),
            "Changed" => Ok(Self::Changed(ChangedMessage {
                data_index: r.get_u64()?,
                key_index: r.get_u32()?,
                salt: r.get_bytes()?,
                data: r.get_bytes()?,
            })),
            "ChangedInfo" => Ok(Self::ChangedInfo(ChangedInfoMessage {
                change_estimate: r.get_u32()?,
                data_index: r.get_u64()?,
                key_index: r.get_u32()?,
                salt: r.get_bytes()?,
                data: r.get_bytes()?,
            })),
            "ChangedAck" => Ok(Self::ChangedAck(ChangedAckMessage {
                data_index: r.get_u64()?,
            })),
            "LastChanged" => Ok(Self::LastChanged),
            "Sync" => Ok(Self::Sync),
            "ListDevices" => Ok(Self::ListDevices),
            "Devices" => Ok(Self::Devices(DevicesMessage {
                devices: r.get_list(|r| {
                    Ok(DeviceListEntry {
                        device_id: r.get_uuid()?,
                        name: r.get_str()?,
                        fingerprint: r.get_bytes()?,
                    })
                })?,
            })),
            "Remove" => Ok(Self::Remove(RemoveMessage {
                device_id: r.get_uuid()?,
            })),
            "Removed" => Ok(Self::Removed(RemovedMessage {
                device_id: r.get_uuid()?,
            })),
            "Proof" => Ok(Self::Proof(ProofMessage {
                pnonce: r.get_bytes()?,
                partner_id: r.get_uuid()?,
                device_id: r.get_uuid()?,
                device_name: r.get_str()?,
                sign_scheme: r.get_str()?,
                sign_key: r.get_bytes()?,
                crypt_scheme: r.get_str()?,
                crypt_key: r.get_bytes()?,
                mac_scheme: r.get_str()?,
                cmac: r.get_bytes()?,
                trustmac: r.get_opt_bytes()?,
            })),
            "Accept" => Ok(Self::Accept(AcceptMessage {
                device_id: r.get_uuid()?,
                key_index: r.get_u32()?,
                scheme: r.get_str()?,
                secret: r.get_bytes()?,
            })),
            "Deny" => Ok(Self::Deny(DenyMessage {
                device_id: r.get_uuid()?,
            })),
            _ => Err(CodecError::UnknownMessage(name)),
        }
    }
}

/// A decoded signed envelope. `signed_len` is the length of the body byte
/// range covered by the signature.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: Vec<u8>,
    pub signed_len: usize,
}

/// Decode `body ‖ signature`, returning the message and the byte range the
/// signature covers. The caller verifies with `&data[..signed_len]`.
pub fn decode_signed(data: &[u8]) -> Result<SignedMessage, CodecError> {
    let mut reader = Reader::new(data)?;
    let message = Message::decode_inner(&mut reader)?;
    let signed_len = reader.position();
    let signature = reader.get_bytes()?;
    reader.finish()?;
    Ok(SignedMessage {
        message,
        signature,
        signed_len,
    })
}

/// Append a detached signature to an encoded body, forming a signed envelope.
pub fn encode_signed(body: Vec<u8>, signature: &[u8]) -> Vec<u8> {
    let mut framed = body;
    framed.extend_from_slice(&(signature.len() as u32).to_be_bytes());
    framed.extend_from_slice(signature);
    framed
}

/// Mac input for a symmetric key update: binds the recipient device, the new
/// index, the scheme, and the encrypted secret. Keyed under the key
/// immediately preceding `index` on both sides of the exchange.
pub fn key_update_mac_data(device_id: Uuid, index: u32, scheme: &str, cipher: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(16 + 4 + scheme.len() + cipher.len());
    data.extend_from_slice(device_id.as_bytes());
    data.extend_from_slice(&index.to_be_bytes());
    data.extend_from_slice(scheme.as_bytes());
    data.extend_from_slice(cipher);
    data
}

/// Mac input for the account export/import handshake:
/// `pNonce ‖ partnerId ‖ scheme`.
pub fn export_sign_data(pnonce: &[u8], partner_id: Uuid, scheme: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(pnonce.len() + 16 + scheme.len());
    data.extend_from_slice(pnonce);
    data.extend_from_slice(partner_id.as_bytes());
    data.extend_from_slice(scheme.as_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let encoded = message.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn identify_roundtrip() {
        roundtrip(Message::Identify(IdentifyMessage {
            nonce: vec![1; 32],
            upload_limit: 4096,
        }));
    }

    #[test]
    fn welcome_roundtrip_with_updates() {
        roundtrip(Message::Welcome(WelcomeMessage {
            has_changes: true,
            key_updates: vec![
                WelcomeKeyUpdate {
                    index: 8,
                    scheme: "RSAES-OAEP/SHA3-512".to_string(),
                    cipher: vec![0xAA; 64],
                    cmac: vec![0xBB; 16],
                },
                WelcomeKeyUpdate {
                    index: 9,
                    scheme: "RSAES-OAEP/SHA3-512".to_string(),
                    cipher: vec![0xCC; 64],
                    cmac: vec![0xDD; 16],
                },
            ],
        }));
    }

    #[test]
    fn access_trustmac_nullable() {
        let base = AccessMessage {
            device_name: "host-1".to_string(),
            nonce: vec![2; 32],
            sign_scheme: "ECDSA_ECP_SHA3_512".to_string(),
            sign_key: vec![3; 16],
            crypt_scheme: "RSAES-OAEP/SHA3-512".to_string(),
            crypt_key: vec![4; 16],
            pnonce: vec![5; 32],
            partner_id: Uuid::new_v4(),
            mac_scheme: "CMAC/AES-256".to_string(),
            mac_cmac: vec![6; 16],
            trustmac: None,
        };
        roundtrip(Message::Access(base.clone()));
        roundtrip(Message::Access(AccessMessage {
            trustmac: Some(vec![7; 16]),
            ..base
        }));
    }

    #[test]
    fn empty_messages_roundtrip() {
        for message in [
            Message::MacUpdateAck,
            Message::LastChanged,
            Message::Sync,
            Message::ListDevices,
        ] {
            roundtrip(message);
        }
    }

    #[test]
    fn error_kind_wire_values_roundtrip() {
        for kind in [
            ErrorKind::Unknown,
            ErrorKind::IncompatibleVersion,
            ErrorKind::Authentication,
            ErrorKind::Access,
            ErrorKind::KeyIndex,
            ErrorKind::Client,
            ErrorKind::Server,
            ErrorKind::UnexpectedMessage,
        ] {
            roundtrip(Message::Error(ErrorMessage {
                kind,
                message: "details".to_string(),
                can_recover: kind == ErrorKind::Client,
            }));
        }
    }

    #[test]
    fn unknown_message_name_rejected() {
        let mut w = Writer::new();
        w.put_str("Bogus");
        let frame = w.finish();
        assert_eq!(
            Message::decode(&frame),
            Err(CodecError::UnknownMessage("Bogus".to_string()))
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = Message::Sync.encode();
        frame.push(0);
        assert_eq!(Message::decode(&frame), Err(CodecError::TrailingData));
    }

    #[test]
    fn signed_envelope_covers_body_exactly() {
        let message = Message::Login(LoginMessage {
            device_id: Uuid::new_v4(),
            device_name: "host-1".to_string(),
            nonce: vec![9; 32],
        });
        let body = message.encode();
        let body_len = body.len();
        let framed = encode_signed(body, b"signature-bytes");

        let signed = decode_signed(&framed).unwrap();
        assert_eq!(signed.message, message);
        assert_eq!(signed.signature, b"signature-bytes");
        assert_eq!(signed.signed_len, body_len);
        assert_eq!(&framed[..signed.signed_len], message.encode().as_slice());
    }

    #[test]
    fn change_flow_messages_roundtrip() {
        roundtrip(Message::Change(ChangeMessage {
            key: "todo/42".to_string(),
            key_index: 8,
            salt: vec![1; 12],
            data: vec![2; 48],
        }));
        roundtrip(Message::ChangedInfo(ChangedInfoMessage {
            change_estimate: 1,
            data_index: 77,
            key_index: 8,
            salt: vec![1; 12],
            data: vec![2; 48],
        }));
        roundtrip(Message::ChangedAck(ChangedAckMessage { data_index: 77 }));
        roundtrip(Message::DeviceChangeAck(DeviceChangeAckMessage {
            data_id: 12,
            device_id: Uuid::new_v4(),
        }));
    }
}
