//! Wire protocol: frame codec, message catalog, signed envelopes.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, Reader, Writer, WIRE_VERSION};
pub use messages::{
    decode_signed, encode_signed, export_sign_data, key_update_mac_data, AcceptMessage,
    AccountMessage, ChangeAckMessage, ChangeMessage, ChangedAckMessage, ChangedInfoMessage,
    ChangedMessage, DenyMessage, DeviceChangeAckMessage, DeviceChangeMessage, DeviceKeyInfo,
    DeviceKeysMessage, DeviceListEntry, DevicesMessage, ErrorKind, ErrorMessage, GrantMessage,
    IdentifyMessage, KeyChangeMessage, LoginMessage, MacUpdateMessage, Message, NewKeyAckMessage,
    NewKeyDevice, NewKeyMessage, ProofMessage, RegisterMessage, RemoveMessage, RemovedMessage,
    SignedMessage, WelcomeKeyUpdate, WelcomeMessage, PING,
};
