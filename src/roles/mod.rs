//! Request handlers for the three serving roles, and the checks they share.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::crypto::{CryptoProvider, SymmetricKey};
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::key_store::KeyStore;
use crate::lifetime::{self, Clock, ReplayCache};
use crate::ticket::{purpose, Field, OpenKey, Ticket};

pub mod authentication;
pub mod service;
pub mod ticket_granting;

pub use authentication::AuthenticationService;
pub use service::ServiceEndpoint;
pub use ticket_granting::TicketGrantingService;

/// What every role needs besides its own settings.
#[derive(Clone)]
pub struct RoleContext {
    pub identity: String,
    pub store: Arc<dyn KeyStore>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub clock: Arc<dyn Clock>,
}

impl RoleContext {
    pub fn new(
        identity: impl Into<String>,
        store: Arc<dyn KeyStore>,
        crypto: Arc<dyn CryptoProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { identity: identity.into(), store, crypto, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Key this role shares with `peer`.
    pub async fn key_with(&self, peer: &str) -> Result<SymmetricKey, ProtocolError> {
        Ok(self.store.symmetric_key(&self.identity, peer).await?)
    }

    /// Open `name` in place and return a copy of the plaintext ticket.
    pub fn open(&self, envelope: &mut Envelope, name: &str, key: &SymmetricKey) -> Result<Ticket, ProtocolError> {
        envelope.open(name, self.crypto.as_ref(), OpenKey::Symmetric(key))?;
        Ok(envelope.get(name)?.clone())
    }
}

/// Plaintext view of a granting or service ticket.
pub(crate) struct Credential {
    pub purpose: String,
    pub subject: String,
    pub target: String,
    pub address: String,
    pub lifetime_end: DateTime<Utc>,
    pub session_key: SymmetricKey,
}

impl Credential {
    pub fn read(ticket: &Ticket) -> Result<Self, ProtocolError> {
        Ok(Self {
            purpose: ticket.purpose().to_string(),
            subject: ticket.require(Field::SubjectId)?.to_string(),
            target: ticket.require(Field::TargetId)?.to_string(),
            address: ticket.require(Field::Address)?.to_string(),
            lifetime_end: ticket.require_time(Field::LifetimeEnd)?,
            session_key: ticket.session_key()?,
        })
    }

    pub fn check_fresh(&self, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        if lifetime::is_fresh(self.lifetime_end, now) {
            Ok(())
        } else {
            Err(ProtocolError::ExpiredTicket {
                ticket: self.purpose.clone(),
                lifetime_end: lifetime::format(self.lifetime_end),
            })
        }
    }

    pub fn check_target(&self, own_identity: &str) -> Result<(), ProtocolError> {
        same("targetId", &self.target, own_identity)
    }
}

pub(crate) fn same(field: &'static str, expected: &str, actual: &str) -> Result<(), ProtocolError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ProtocolError::IdentityMismatch {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Authenticator checks shared by the TGS and the service.
pub(crate) struct AuthenticatorPolicy {
    pub skew: Duration,
    pub replays: ReplayCache,
}

impl AuthenticatorPolicy {
    pub fn new(skew: Duration) -> Self {
        Self { skew, replays: ReplayCache::new() }
    }

    /// Bind an opened authenticator to the credential it accompanies.
    pub fn verify(&self, authenticator: &Ticket, credential: &Credential, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        let subject = authenticator.require(Field::SubjectId)?;
        same("subjectId", &credential.subject, subject)?;
        same("address", &credential.address, authenticator.require(Field::Address)?)?;

        let issued_at = authenticator.require_time(Field::IssuedAt)?;
        if !lifetime::within_skew(issued_at, now, self.skew) {
            return Err(ProtocolError::Replay {
                subject: subject.to_string(),
                reason: "timestamp outside clock skew",
            });
        }
        let stamp = authenticator.require(Field::IssuedAt)?;
        if !self.replays.check_and_insert(subject, stamp, credential.lifetime_end, now) {
            return Err(ProtocolError::Replay {
                subject: subject.to_string(),
                reason: "already presented",
            });
        }
        Ok(())
    }
}

/// Open the credential `name`, check it is current and addressed to us, then
/// open and verify the authenticator under the session key it carries.
pub(crate) async fn redeem(
    ctx: &RoleContext,
    policy: &AuthenticatorPolicy,
    request: &mut Envelope,
    name: &str,
    issuer: &str,
) -> Result<Credential, ProtocolError> {
    let long_term = ctx.key_with(issuer).await?;
    let credential = Credential::read(&ctx.open(request, name, &long_term)?)?;
    credential.check_fresh(ctx.now())?;
    credential.check_target(&ctx.identity)?;

    let authenticator = ctx.open(request, purpose::AUTHENTICATOR, &credential.session_key)?;
    policy.verify(&authenticator, &credential, ctx.now())?;
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealedBoxProvider;
    use chrono::TimeZone;

    fn credential(now: DateTime<Utc>) -> Credential {
        Credential {
            purpose: purpose::SERVICE_TICKET.into(),
            subject: "C1".into(),
            target: "SvcA".into(),
            address: "10.0.0.7".into(),
            lifetime_end: now + Duration::minutes(5),
            session_key: SealedBoxProvider::new().generate_symmetric_key(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap()
    }

    #[test]
    fn each_binding_field_is_checked() {
        let policy = AuthenticatorPolicy::new(Duration::minutes(5));
        let cred = credential(now());

        let wrong_subject = Ticket::authenticator("C2", "10.0.0.7", now());
        assert!(matches!(
            policy.verify(&wrong_subject, &cred, now()),
            Err(ProtocolError::IdentityMismatch { field: "subjectId", .. })
        ));

        let wrong_address = Ticket::authenticator("C1", "10.0.0.8", now());
        assert!(matches!(
            policy.verify(&wrong_address, &cred, now()),
            Err(ProtocolError::IdentityMismatch { field: "address", .. })
        ));

        assert!(matches!(cred.check_target("SvcB"), Err(ProtocolError::IdentityMismatch { field: "targetId", .. })));
        assert!(cred.check_target("SvcA").is_ok());

        let good = Ticket::authenticator("C1", "10.0.0.7", now());
        assert!(policy.verify(&good, &cred, now()).is_ok());
    }

    #[test]
    fn replayed_or_stale_authenticators_fail() {
        let policy = AuthenticatorPolicy::new(Duration::minutes(5));
        let cred = credential(now());
        let auth = Ticket::authenticator("C1", "10.0.0.7", now());

        assert!(policy.verify(&auth, &cred, now()).is_ok());
        assert!(matches!(
            policy.verify(&auth, &cred, now()),
            Err(ProtocolError::Replay { reason: "already presented", .. })
        ));

        let stale = Ticket::authenticator("C1", "10.0.0.7", now() - Duration::minutes(6));
        assert!(matches!(
            policy.verify(&stale, &cred, now()),
            Err(ProtocolError::Replay { reason: "timestamp outside clock skew", .. })
        ));
    }

    #[test]
    fn expiry_is_inclusive() {
        let cred = credential(now());
        assert!(cred.check_fresh(cred.lifetime_end).is_ok());
        assert!(matches!(
            cred.check_fresh(cred.lifetime_end + Duration::milliseconds(1)),
            Err(ProtocolError::ExpiredTicket { .. })
        ));
    }
}
