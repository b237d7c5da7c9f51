//! Bootstrap key exchange.
//!
//! Establishes the long-term symmetric key two roles share before any ticket
//! is issued. The initiator offers its public key; the responder generates
//! the symmetric key, keeps it, and returns it sealed to that public key.
//! There is no authority vouching for the offered key: the deployment is
//! trusted during bootstrap.
//!
//! ```text
//! initiator                           responder
//!   | -- keyOffer{subjectId, pk} ------> |  store pk as <peer>Received
//!   |                                    |  K = fresh, store (self, peer)
//!   | <-- keyGrant{subjectId, K}_pk ---- |
//!   |  open with sk, store (self, peer)  |
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::codec::Message;
use crate::crypto::{CryptoProvider, PublicKey, SymmetricKey};
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::key_store::{received_label, KeyStore};
use crate::observability;
use crate::ticket::{purpose, Field, OpenKey, SealKey, Ticket};
use crate::transport::{self, Handler, RoleListener};

/// Generate and persist a role's asymmetric identity.
pub async fn create_identity(
    store: &dyn KeyStore,
    crypto: &dyn CryptoProvider,
    role: &str,
) -> Result<PublicKey, ProtocolError> {
    let pair = crypto.generate_key_pair();
    store.put_key_pair(role, &pair).await?;
    info!(role, "identity created");
    Ok(pair.public)
}

/// Run the initiating side against the responder at `addr`.
///
/// On success the shared key is stored under `(role, peer)` and returned.
pub async fn initiate(
    store: &dyn KeyStore,
    crypto: &dyn CryptoProvider,
    role: &str,
    peer: &str,
    addr: &str,
) -> Result<SymmetricKey, ProtocolError> {
    let pair = store.key_pair(role).await?;
    let offer = Envelope::from_tickets([Ticket::key_offer(role, &pair.public)])?;

    let (reply, _) = transport::exchange(addr, &Message::Envelope(offer)).await?;
    let mut reply = match reply {
        Message::Envelope(envelope) => envelope,
        Message::Rejected { reason } => return Err(ProtocolError::Rejected(reason)),
    };

    reply.open(purpose::KEY_GRANT, crypto, OpenKey::Private(&pair.private))?;
    let grant = reply.get(purpose::KEY_GRANT)?;
    let granted_by = grant.require(Field::SubjectId)?;
    if granted_by != peer {
        return Err(ProtocolError::IdentityMismatch {
            field: "subjectId",
            expected: peer.to_string(),
            actual: granted_by.to_string(),
        });
    }
    let key = grant.session_key()?;
    store.put_symmetric_key(role, peer, &key).await?;

    observability::record_bootstrap_exchange();
    info!(role, peer, "long-term key established");
    Ok(key)
}

/// Answering side of the exchange, for a fixed set of peers.
pub struct Responder {
    role: String,
    peers: Vec<String>,
    store: Arc<dyn KeyStore>,
    crypto: Arc<dyn CryptoProvider>,
    served: Mutex<HashSet<String>>,
}

impl Responder {
    pub fn new(
        role: impl Into<String>,
        peers: Vec<String>,
        store: Arc<dyn KeyStore>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        Self { role: role.into(), peers, store, crypto, served: Mutex::new(HashSet::new()) }
    }

    /// Peers that have not completed an exchange yet.
    pub fn pending(&self) -> Vec<String> {
        let served = match self.served.lock() {
            Ok(served) => served,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.peers.iter().filter(|p| !served.contains(*p)).cloned().collect()
    }

    fn mark_served(&self, peer: &str) {
        let mut served = match self.served.lock() {
            Ok(served) => served,
            Err(poisoned) => poisoned.into_inner(),
        };
        served.insert(peer.to_string());
    }
}

#[async_trait]
impl Handler for Responder {
    fn role(&self) -> &str {
        &self.role
    }

    async fn handle(&self, _peer_addr: SocketAddr, request: Envelope) -> Result<Envelope, ProtocolError> {
        let offer = request.get(purpose::KEY_OFFER)?;
        let peer = offer.require(Field::SubjectId)?.to_string();
        if !self.peers.contains(&peer) {
            return Err(ProtocolError::IdentityMismatch {
                field: "subjectId",
                expected: self.peers.join("|"),
                actual: peer,
            });
        }
        let public = PublicKey::from_base64(offer.require(Field::KeyMaterial)?)
            .map_err(|e| ProtocolError::Malformed(format!("offered public key: {e}")))?;
        self.store.put_public_key(&received_label(&peer), &public).await?;

        let key = self.crypto.generate_symmetric_key();
        self.store.put_symmetric_key(&self.role, &peer, &key).await?;

        let mut grant = Ticket::key_grant(&self.role, &key);
        grant.seal(self.crypto.as_ref(), SealKey::Public(&public))?;

        self.mark_served(&peer);
        observability::record_bootstrap_exchange();
        info!(role = %self.role, peer = %peer, "long-term key granted");
        Ok(Envelope::from_tickets([grant])?)
    }
}

/// Serve bootstrap offers one connection at a time until every peer of
/// `responder` has completed an exchange.
pub async fn respond_to_peers(listener: &RoleListener, responder: &Responder) -> Result<(), ProtocolError> {
    while !responder.pending().is_empty() {
        let (stream, peer) = listener.accept().await?;
        if let Err(e) = transport::handle_connection(stream, peer, responder).await {
            warn!(role = %responder.role, peer = %peer, error = %e, "bootstrap connection failed");
        }
    }
    info!(role = %responder.role, "all peers bootstrapped");
    Ok(())
}
