//! Tickets: named records with up to six optional fields, sealed field by
//! field.
//!
//! A ticket's purpose decides which fields are populated. Sealing replaces
//! every populated field with ciphertext in one step; a failure part way
//! through leaves the ticket untouched, so a ticket is never half sealed.
//! Sealing may be layered under several keys and must be undone in reverse
//! order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoError, CryptoProvider, PrivateKey, PublicKey, SymmetricKey};
use crate::lifetime;

/// Purpose names used on the wire.
pub mod purpose {
    pub const REQUEST: &str = "request";
    pub const RESPONSE_TO_CLIENT: &str = "responseToClient";
    pub const GRANTING_TICKET: &str = "grantingTicket";
    pub const SERVICE_TICKET: &str = "serviceTicket";
    pub const REQUEST_NEXT_HOP: &str = "request4NextHop";
    pub const AUTHENTICATOR: &str = "authenticator";
    /// Bootstrap: initiator's public key.
    pub const KEY_OFFER: &str = "keyOffer";
    /// Bootstrap: responder's symmetric key, sealed to the offered public key.
    pub const KEY_GRANT: &str = "keyGrant";
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("ticket `{0}` not present")]
    Missing(String),
    #[error("ticket `{0}` already present in envelope")]
    Duplicate(String),
    #[error("ticket `{ticket}` has no `{field}` field")]
    MissingField { ticket: String, field: &'static str },
    #[error("ticket `{0}` is sealed")]
    Sealed(String),
    #[error("ticket `{0}` is not sealed")]
    NotSealed(String),
    #[error("ticket `{ticket}`: {source}")]
    Crypto {
        ticket: String,
        #[source]
        source: CryptoError,
    },
    #[error("ticket `{ticket}` has unreadable `{field}`: {value}")]
    Timestamp {
        ticket: String,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    SubjectId,
    TargetId,
    Address,
    LifetimeEnd,
    IssuedAt,
    KeyMaterial,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::SubjectId,
        Field::TargetId,
        Field::Address,
        Field::LifetimeEnd,
        Field::IssuedAt,
        Field::KeyMaterial,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::SubjectId => "subjectId",
            Field::TargetId => "targetId",
            Field::Address => "address",
            Field::LifetimeEnd => "lifetimeEnd",
            Field::IssuedAt => "issuedAt",
            Field::KeyMaterial => "keyMaterial",
        }
    }
}

/// Key used to add a sealing layer.
#[derive(Clone, Copy)]
pub enum SealKey<'a> {
    Symmetric(&'a SymmetricKey),
    Public(&'a PublicKey),
}

/// Key used to remove a sealing layer.
#[derive(Clone, Copy)]
pub enum OpenKey<'a> {
    Symmetric(&'a SymmetricKey),
    Private(&'a PrivateKey),
}

type Fields = [Option<String>; 6];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    purpose: String,
    #[serde(default)]
    sealed_layers: u8,
    subject_id: Option<String>,
    target_id: Option<String>,
    address: Option<String>,
    lifetime_end: Option<String>,
    issued_at: Option<String>,
    key_material: Option<String>,
}

impl Ticket {
    /// Empty ticket with only its purpose set.
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            sealed_layers: 0,
            subject_id: None,
            target_id: None,
            address: None,
            lifetime_end: None,
            issued_at: None,
            key_material: None,
        }
    }

    /// Client's opening request to the AS.
    pub fn request(client: &str, granting_role: &str, lifetime_end: DateTime<Utc>) -> Self {
        Self::new(purpose::REQUEST)
            .with(Field::SubjectId, client)
            .with(Field::TargetId, granting_role)
            .with(Field::LifetimeEnd, lifetime::format(lifetime_end))
    }

    /// The half of an issuance only the client can read.
    pub fn response_to_client(
        issued_for: &str,
        issued_at: DateTime<Utc>,
        lifetime_end: DateTime<Utc>,
        session_key: &SymmetricKey,
    ) -> Self {
        Self::new(purpose::RESPONSE_TO_CLIENT)
            .with(Field::SubjectId, issued_for)
            .with(Field::IssuedAt, lifetime::format(issued_at))
            .with(Field::LifetimeEnd, lifetime::format(lifetime_end))
            .with(Field::KeyMaterial, session_key.to_base64())
    }

    /// Granting or service ticket: the half only the redeeming role can read.
    pub fn credential(
        purpose: &str,
        client: &str,
        target: &str,
        address: &str,
        issued_at: DateTime<Utc>,
        lifetime_end: DateTime<Utc>,
        session_key: &SymmetricKey,
    ) -> Self {
        Self::new(purpose)
            .with(Field::SubjectId, client)
            .with(Field::TargetId, target)
            .with(Field::Address, address)
            .with(Field::IssuedAt, lifetime::format(issued_at))
            .with(Field::LifetimeEnd, lifetime::format(lifetime_end))
            .with(Field::KeyMaterial, session_key.to_base64())
    }

    pub fn next_hop_request(target_service: &str) -> Self {
        Self::new(purpose::REQUEST_NEXT_HOP).with(Field::TargetId, target_service)
    }

    pub fn authenticator(subject: &str, address: &str, issued_at: DateTime<Utc>) -> Self {
        Self::new(purpose::AUTHENTICATOR)
            .with(Field::SubjectId, subject)
            .with(Field::Address, address)
            .with(Field::IssuedAt, lifetime::format(issued_at))
    }

    pub fn key_offer(role: &str, public: &PublicKey) -> Self {
        Self::new(purpose::KEY_OFFER)
            .with(Field::SubjectId, role)
            .with(Field::KeyMaterial, public.to_base64())
    }

    pub fn key_grant(role: &str, secret: &SymmetricKey) -> Self {
        Self::new(purpose::KEY_GRANT)
            .with(Field::SubjectId, role)
            .with(Field::KeyMaterial, secret.to_base64())
    }

    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        *self.slot_mut(field) = Some(value.into());
        self
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_layers > 0
    }

    pub fn sealed_layers(&self) -> u8 {
        self.sealed_layers
    }

    pub fn is_present(&self, field: Field) -> bool {
        self.slot(field).is_some()
    }

    /// Raw field value, ciphertext if the ticket is sealed.
    pub fn raw(&self, field: Field) -> Option<&str> {
        self.slot(field).as_deref()
    }

    /// Plaintext value of a field that must be present.
    pub fn require(&self, field: Field) -> Result<&str, TicketError> {
        if self.is_sealed() {
            return Err(TicketError::Sealed(self.purpose.clone()));
        }
        self.slot(field).as_deref().ok_or_else(|| TicketError::MissingField {
            ticket: self.purpose.clone(),
            field: field.name(),
        })
    }

    pub fn require_time(&self, field: Field) -> Result<DateTime<Utc>, TicketError> {
        let value = self.require(field)?;
        lifetime::parse(value).map_err(|_| TicketError::Timestamp {
            ticket: self.purpose.clone(),
            field: field.name(),
            value: value.to_string(),
        })
    }

    /// Session key carried in `keyMaterial`.
    pub fn session_key(&self) -> Result<SymmetricKey, TicketError> {
        SymmetricKey::from_base64(self.require(Field::KeyMaterial)?).map_err(|source| {
            TicketError::Crypto { ticket: self.purpose.clone(), source }
        })
    }

    /// Add one sealing layer over every populated field.
    pub fn seal(&mut self, crypto: &dyn CryptoProvider, key: SealKey<'_>) -> Result<(), TicketError> {
        let sealed = self.map_fields(|value| match key {
            SealKey::Symmetric(k) => crypto.symmetric_encrypt(k, value),
            SealKey::Public(k) => crypto.asymmetric_encrypt(k, value),
        })?;
        self.store(sealed);
        self.sealed_layers = self.sealed_layers.saturating_add(1);
        Ok(())
    }

    /// Remove the outermost sealing layer.
    pub fn open(&mut self, crypto: &dyn CryptoProvider, key: OpenKey<'_>) -> Result<(), TicketError> {
        if !self.is_sealed() {
            return Err(TicketError::NotSealed(self.purpose.clone()));
        }
        let opened = self.map_fields(|value| match key {
            OpenKey::Symmetric(k) => crypto.symmetric_decrypt(k, value),
            OpenKey::Private(k) => crypto.asymmetric_decrypt(k, value),
        })?;
        self.store(opened);
        self.sealed_layers -= 1;
        Ok(())
    }

    /// Transform all populated fields into a fresh array, committing nothing
    /// unless every field succeeds.
    fn map_fields<F>(&self, mut op: F) -> Result<Fields, TicketError>
    where
        F: FnMut(&str) -> Result<String, CryptoError>,
    {
        let mut out: Fields = Default::default();
        for (slot, field) in out.iter_mut().zip(Field::ALL) {
            if let Some(value) = self.slot(field) {
                let mapped = op(value).map_err(|source| TicketError::Crypto {
                    ticket: self.purpose.clone(),
                    source,
                })?;
                *slot = Some(mapped);
            }
        }
        Ok(out)
    }

    fn store(&mut self, fields: Fields) {
        let [subject_id, target_id, address, lifetime_end, issued_at, key_material] = fields;
        self.subject_id = subject_id;
        self.target_id = target_id;
        self.address = address;
        self.lifetime_end = lifetime_end;
        self.issued_at = issued_at;
        self.key_material = key_material;
    }

    fn slot(&self, field: Field) -> &Option<String> {
        match field {
            Field::SubjectId => &self.subject_id,
            Field::TargetId => &self.target_id,
            Field::Address => &self.address,
            Field::LifetimeEnd => &self.lifetime_end,
            Field::IssuedAt => &self.issued_at,
            Field::KeyMaterial => &self.key_material,
        }
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::SubjectId => &mut self.subject_id,
            Field::TargetId => &mut self.target_id,
            Field::Address => &mut self.address,
            Field::LifetimeEnd => &mut self.lifetime_end,
            Field::IssuedAt => &mut self.issued_at,
            Field::KeyMaterial => &mut self.key_material,
        }
    }
}

/// Shows purpose, seal depth and which fields are present. Never values.
impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.purpose)?;
        if self.is_sealed() {
            write!(f, " (sealed x{})", self.sealed_layers)?;
        }
        let present: Vec<&str> = Field::ALL
            .iter()
            .filter(|field| self.is_present(**field))
            .map(|field| field.name())
            .collect();
        write!(f, " [{}]", present.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealedBoxProvider;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn purpose_decides_populated_fields() {
        let key = SealedBoxProvider::new().generate_symmetric_key();

        let request = Ticket::request("C1", "TGS", at(300));
        assert!(request.is_present(Field::SubjectId));
        assert!(request.is_present(Field::TargetId));
        assert!(request.is_present(Field::LifetimeEnd));
        assert!(!request.is_present(Field::KeyMaterial));

        let next_hop = Ticket::next_hop_request("SvcA");
        assert_eq!(next_hop.raw(Field::TargetId), Some("SvcA"));
        assert!(!next_hop.is_present(Field::SubjectId));

        let auth = Ticket::authenticator("C1", "127.0.0.1", at(0));
        assert!(!auth.is_present(Field::TargetId));
        assert!(auth.is_present(Field::IssuedAt));

        let granting = Ticket::credential(purpose::GRANTING_TICKET, "C1", "TGS", "127.0.0.1", at(0), at(300), &key);
        assert!(Field::ALL.iter().all(|f| granting.is_present(*f)));
    }

    #[test]
    fn sealing_covers_every_populated_field() {
        let crypto = SealedBoxProvider::new();
        let key = crypto.generate_symmetric_key();
        let mut ticket = Ticket::authenticator("C1", "127.0.0.1", at(0));

        ticket.seal(&crypto, SealKey::Symmetric(&key)).unwrap();
        assert!(ticket.is_sealed());
        assert_ne!(ticket.raw(Field::SubjectId), Some("C1"));
        assert_ne!(ticket.raw(Field::Address), Some("127.0.0.1"));
        assert!(!ticket.is_present(Field::TargetId));
        assert!(matches!(ticket.require(Field::SubjectId), Err(TicketError::Sealed(_))));

        ticket.open(&crypto, OpenKey::Symmetric(&key)).unwrap();
        assert_eq!(ticket.require(Field::SubjectId).unwrap(), "C1");
    }

    #[test]
    fn failed_open_leaves_ticket_sealed() {
        let crypto = SealedBoxProvider::new();
        let key = crypto.generate_symmetric_key();
        let wrong = crypto.generate_symmetric_key();
        let mut ticket = Ticket::request("C1", "TGS", at(300));
        ticket.seal(&crypto, SealKey::Symmetric(&key)).unwrap();
        let before = ticket.clone();

        let err = ticket.open(&crypto, OpenKey::Symmetric(&wrong)).unwrap_err();
        assert!(matches!(err, TicketError::Crypto { source: CryptoError::Decrypt, .. }));
        assert_eq!(ticket, before);
    }

    #[test]
    fn layers_unwind_in_reverse_order() {
        let crypto = SealedBoxProvider::new();
        let inner = crypto.generate_symmetric_key();
        let outer = crypto.generate_symmetric_key();
        let original = Ticket::next_hop_request("SvcA");
        let mut ticket = original.clone();

        ticket.seal(&crypto, SealKey::Symmetric(&inner)).unwrap();
        ticket.seal(&crypto, SealKey::Symmetric(&outer)).unwrap();
        assert_eq!(ticket.sealed_layers(), 2);

        assert!(ticket.clone().open(&crypto, OpenKey::Symmetric(&inner)).is_err());
        ticket.open(&crypto, OpenKey::Symmetric(&outer)).unwrap();
        ticket.open(&crypto, OpenKey::Symmetric(&inner)).unwrap();
        assert_eq!(ticket, original);
    }

    #[test]
    fn asymmetric_layer_for_bootstrap() {
        let crypto = SealedBoxProvider::new();
        let pair = crypto.generate_key_pair();
        let secret = crypto.generate_symmetric_key();
        let mut grant = Ticket::key_grant("AS", &secret);

        grant.seal(&crypto, SealKey::Public(&pair.public)).unwrap();
        grant.open(&crypto, OpenKey::Private(&pair.private)).unwrap();
        assert_eq!(grant.session_key().unwrap(), secret);
    }

    #[test]
    fn opening_plaintext_is_an_error() {
        let crypto = SealedBoxProvider::new();
        let key = crypto.generate_symmetric_key();
        let mut ticket = Ticket::next_hop_request("SvcA");
        assert!(matches!(ticket.open(&crypto, OpenKey::Symmetric(&key)), Err(TicketError::NotSealed(_))));
    }

    #[test]
    fn display_never_shows_values() {
        let key = SealedBoxProvider::new().generate_symmetric_key();
        let ticket = Ticket::response_to_client("TGS", at(0), at(300), &key);
        let shown = ticket.to_string();
        assert_eq!(shown, "responseToClient [subjectId, lifetimeEnd, issuedAt, keyMaterial]");
        assert!(!shown.contains(&key.to_base64()));
    }

    #[test]
    fn timestamps_parse_back() {
        let ticket = Ticket::request("C1", "TGS", at(300));
        assert_eq!(ticket.require_time(Field::LifetimeEnd).unwrap(), at(300));

        let broken = Ticket::new(purpose::REQUEST).with(Field::LifetimeEnd, "yesterday");
        assert!(matches!(broken.require_time(Field::LifetimeEnd), Err(TicketError::Timestamp { .. })));
    }

    fn arb_field() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[ -~]{0,24}")
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn seal_then_open_is_identity(
            purpose_idx in 0usize..6,
            fields in proptest::array::uniform6(arb_field()),
        ) {
            let purposes = [
                purpose::REQUEST,
                purpose::RESPONSE_TO_CLIENT,
                purpose::GRANTING_TICKET,
                purpose::SERVICE_TICKET,
                purpose::REQUEST_NEXT_HOP,
                purpose::AUTHENTICATOR,
            ];
            let mut ticket = Ticket::new(purposes[purpose_idx]);
            for (field, value) in Field::ALL.iter().zip(fields) {
                if let Some(value) = value {
                    ticket = ticket.with(*field, value);
                }
            }
            let original = ticket.clone();

            let crypto = SealedBoxProvider::new();
            let key = crypto.generate_symmetric_key();
            ticket.seal(&crypto, SealKey::Symmetric(&key)).unwrap();
            ticket.open(&crypto, OpenKey::Symmetric(&key)).unwrap();
            prop_assert_eq!(ticket, original);
        }
    }
}
