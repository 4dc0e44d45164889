//! CryptSync Client Core
//!
//! This library provides the client side of end-to-end encrypted,
//! multi-device dataset synchronization:
//! - Asymmetric device identity and symmetric payload encryption
//! - Pluggable private key storage
//! - Binary wire codec and message catalog
//! - The remote connector state machine and session loop

pub mod connector;
pub mod crypto;
pub mod protocol;

pub use connector::settings::{JsonFileSettings, MemorySettings, Settings, SettingsBackend};
pub use connector::state::{ConnectionState, StateEvent};
pub use connector::transport::{
    Dialer, MemoryDialer, MemoryTransport, Transport, TransportError, WsDialer,
};
pub use connector::{
    ConnectorError, ConnectorOptions, DeviceInfo, ExportData, RemoteConfig, RemoteConnector,
    RemoteConnectorHandle, RemoteEvent,
};
pub use crypto::controller::{derive_export_key, CryptoController};
pub use crypto::keystore::{
    FileKeyStore, KeyStore, KeyStoreProvider, KeyStoreRegistry, MemoryKeyStore,
};
pub use crypto::CryptoError;
pub use protocol::{CodecError, Message};
