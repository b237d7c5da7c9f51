//! Three-party ticket authentication: an authentication role (AS), a
//! ticket-granting role (TGS), protected services, and the client that walks
//! through all three, plus the bootstrap exchange that gives each pair of
//! roles its long-term key.

pub mod bootstrap;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod key_store;
pub mod lifetime;
pub mod logging;
pub mod observability;
pub mod roles;
pub mod ticket;
pub mod transport;


pub use client::{Approval, Client, Realm};
pub use codec::Message;
pub use config::RealmConfig;
pub use crypto::{CryptoProvider, SealedBoxProvider};
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use key_store::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use ticket::Ticket;
