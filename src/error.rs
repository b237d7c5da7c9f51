//! Protocol-level error taxonomy.
//!
//! Lower layers (crypto, key store, ticket model, codec, transport) each have
//! their own error enum. Role handlers and the client orchestrator collapse
//! them into [`ProtocolError`], which is what the accept loop and the CLI see.

use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;
use crate::key_store::KeyError;
use crate::ticket::TicketError;
use crate::transport::TransportError;

/// Errors surfaced by one leg of the protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A long-term or session key required for this request is absent.
    #[error("key not found for ({owner}, {peer})")]
    KeyNotFound { owner: String, peer: String },

    /// Wrong key or corrupted ciphertext.
    #[error("decryption failed for ticket `{ticket}`")]
    DecryptionFailure { ticket: String },

    /// `lifetimeEnd` lies before the current time.
    #[error("ticket `{ticket}` expired at {lifetime_end}")]
    ExpiredTicket { ticket: String, lifetime_end: String },

    /// Authenticator and ticket disagree on subject, target or address.
    #[error("identity mismatch on {field}: expected `{expected}`, got `{actual}`")]
    IdentityMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// The authenticator was already presented, or is outside the skew window.
    #[error("authenticator for `{subject}` rejected: {reason}")]
    Replay { subject: String, reason: &'static str },

    /// A ticket the step needs is not in the envelope.
    #[error("envelope is missing ticket `{0}`")]
    MissingTicket(String),

    /// The envelope or a ticket inside it is structurally unusable.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The peer answered with a negative acknowledgement.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// Connection refused, reset, or closed without a reply.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// The key store could not complete a read or write.
    #[error("key storage failure: {0}")]
    Storage(String),

    /// Encryption or key generation failed (not a decryption failure).
    #[error("crypto failure: {0}")]
    Crypto(String),
}

impl ProtocolError {
    /// True if the peer should get an explicit negative acknowledgement.
    ///
    /// Missing keys and storage or crypto faults abort the request without a
    /// reply; everything the peer caused by sending bad material is answered.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProtocolError::DecryptionFailure { .. }
                | ProtocolError::ExpiredTicket { .. }
                | ProtocolError::IdentityMismatch { .. }
                | ProtocolError::Replay { .. }
                | ProtocolError::MissingTicket(_)
                | ProtocolError::Malformed(_)
        )
    }

    /// Short class label used in logs and counters.
    pub fn class(&self) -> &'static str {
        match self {
            ProtocolError::KeyNotFound { .. } => "key_not_found",
            ProtocolError::DecryptionFailure { .. } => "decryption_failure",
            ProtocolError::ExpiredTicket { .. } => "expired_ticket",
            ProtocolError::IdentityMismatch { .. } => "identity_mismatch",
            ProtocolError::Replay { .. } => "replay",
            ProtocolError::MissingTicket(_) => "missing_ticket",
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::Rejected(_) => "rejected",
            ProtocolError::TransportFailure(_) => "transport_failure",
            ProtocolError::Storage(_) => "storage",
            ProtocolError::Crypto(_) => "crypto",
        }
    }

    /// Map a crypto failure while opening `ticket`.
    pub fn decrypt(ticket: &str, err: CryptoError) -> Self {
        match err {
            CryptoError::Decrypt | CryptoError::Encoding(_) => {
                ProtocolError::DecryptionFailure { ticket: ticket.to_string() }
            }
            other => ProtocolError::Crypto(other.to_string()),
        }
    }
}

impl From<KeyError> for ProtocolError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::NotFound { owner, peer } => ProtocolError::KeyNotFound { owner, peer },
            other => ProtocolError::Storage(other.to_string()),
        }
    }
}

impl From<TicketError> for ProtocolError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::Missing(name) => ProtocolError::MissingTicket(name),
            TicketError::Crypto { ticket, source } => ProtocolError::decrypt(&ticket, source),
            other => ProtocolError::Malformed(other.to_string()),
        }
    }
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        ProtocolError::Crypto(err.to_string())
    }
}
