// homesync-api: Async transport for Home Assistant style hubs (REST + WebSocket)

pub mod error;
pub mod fetch;
pub mod model;
pub mod protocol;
pub mod rest;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use fetch::StateFetcher;
pub use model::{Attributes, EntityKey, EntityState, StateValue, UNAVAILABLE};
pub use rest::RestClient;
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{HubChannel, ReconnectConfig};
