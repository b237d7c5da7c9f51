//! Client orchestrator: drives the three legs in sequence.
//!
//! The granting and service tickets are sealed for the roles that redeem
//! them, so the client only ever opens `responseToClient` and the final
//! approval; the tickets themselves are forwarded as received.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::codec::Message;
use crate::crypto::SymmetricKey;
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::lifetime;
use crate::roles::{same, RoleContext};
use crate::ticket::{purpose, Field, SealKey, Ticket};
use crate::transport;

/// Where the client finds the two issuing roles.
#[derive(Debug, Clone)]
pub struct Realm {
    pub authentication: String,
    pub authentication_addr: String,
    pub ticket_granting: String,
    pub ticket_granting_addr: String,
}

/// Result of the first leg.
#[derive(Debug, Clone)]
pub struct GrantingCredentials {
    pub granting_ticket: Ticket,
    pub session_key: SymmetricKey,
    pub lifetime_end: DateTime<Utc>,
    /// Address the AS bound into the granting ticket.
    pub address: String,
}

/// Result of the second leg.
#[derive(Debug, Clone)]
pub struct ServiceCredentials {
    pub service: String,
    pub service_ticket: Ticket,
    pub session_key: SymmetricKey,
    pub lifetime_end: DateTime<Utc>,
    pub address: String,
}

/// Opened approval from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub service: String,
    pub marker: String,
    pub issued_at: DateTime<Utc>,
}

pub struct Client {
    ctx: RoleContext,
    realm: Realm,
    requested_lifetime: Duration,
    address_override: Option<IpAddr>,
}

impl Client {
    pub fn new(ctx: RoleContext, realm: Realm, requested_lifetime: Duration) -> Self {
        Self { ctx, realm, requested_lifetime, address_override: None }
    }

    /// Claim `address` in authenticators instead of the observed local one.
    pub fn with_address(mut self, address: Option<IpAddr>) -> Self {
        self.address_override = address;
        self
    }

    pub fn identity(&self) -> &str {
        &self.ctx.identity
    }

    async fn send(&self, addr: &str, envelope: Envelope) -> Result<(Envelope, IpAddr), ProtocolError> {
        let (reply, local) = transport::exchange(addr, &Message::Envelope(envelope)).await?;
        match reply {
            Message::Envelope(envelope) => Ok((envelope, local.ip())),
            Message::Rejected { reason } => Err(ProtocolError::Rejected(reason)),
        }
    }

    /// Open `responseToClient`, check who it is about, and return its key and
    /// lifetime.
    fn open_response(
        &self,
        reply: &mut Envelope,
        key: &SymmetricKey,
        expected_subject: &str,
    ) -> Result<(SymmetricKey, DateTime<Utc>), ProtocolError> {
        let response = self.ctx.open(reply, purpose::RESPONSE_TO_CLIENT, key)?;
        same("subjectId", expected_subject, response.require(Field::SubjectId)?)?;
        let lifetime_end = response.require_time(Field::LifetimeEnd)?;
        if !lifetime::is_fresh(lifetime_end, self.ctx.now()) {
            return Err(ProtocolError::ExpiredTicket {
                ticket: purpose::RESPONSE_TO_CLIENT.to_string(),
                lifetime_end: lifetime::format(lifetime_end),
            });
        }
        Ok((response.session_key()?, lifetime_end))
    }

    /// Take a companion ticket that must arrive sealed.
    fn take_sealed(reply: &mut Envelope, name: &str) -> Result<Ticket, ProtocolError> {
        let ticket = reply.take(name)?;
        if !ticket.is_sealed() {
            return Err(ProtocolError::Malformed(format!("`{name}` arrived unsealed")));
        }
        Ok(ticket)
    }

    fn authenticator(&self, address: &str, key: &SymmetricKey) -> Result<Ticket, ProtocolError> {
        let mut authenticator = Ticket::authenticator(&self.ctx.identity, address, self.ctx.now());
        authenticator.seal(self.ctx.crypto.as_ref(), SealKey::Symmetric(key))?;
        Ok(authenticator)
    }

    /// Leg one: obtain a granting ticket from the AS.
    pub async fn authenticate(&self) -> Result<GrantingCredentials, ProtocolError> {
        let ctx = &self.ctx;
        let realm = &self.realm;
        let long_term = ctx.key_with(&realm.authentication).await?;

        let end = lifetime::after(ctx.now(), self.requested_lifetime);
        let request = Envelope::from_tickets([Ticket::request(&ctx.identity, &realm.ticket_granting, end)])?;
        let (mut reply, local_ip) = self.send(&realm.authentication_addr, request).await?;

        let (session_key, lifetime_end) = self.open_response(&mut reply, &long_term, &realm.ticket_granting)?;
        let granting_ticket = Self::take_sealed(&mut reply, purpose::GRANTING_TICKET)?;
        ctx.store
            .put_symmetric_key(&ctx.identity, &realm.ticket_granting, &session_key)
            .await?;

        let address = self.address_override.unwrap_or(local_ip).to_string();
        info!(client = %ctx.identity, lifetime_end = %lifetime::format(lifetime_end), "authenticated");
        Ok(GrantingCredentials { granting_ticket, session_key, lifetime_end, address })
    }

    /// Leg two: trade the granting ticket for a ticket to `service`.
    pub async fn request_service(
        &self,
        granting: &GrantingCredentials,
        service: &str,
    ) -> Result<ServiceCredentials, ProtocolError> {
        let ctx = &self.ctx;
        let request = Envelope::from_tickets([
            granting.granting_ticket.clone(),
            Ticket::next_hop_request(service),
            self.authenticator(&granting.address, &granting.session_key)?,
        ])?;
        let (mut reply, _) = self.send(&self.realm.ticket_granting_addr, request).await?;

        let (session_key, lifetime_end) = self.open_response(&mut reply, &granting.session_key, service)?;
        let service_ticket = Self::take_sealed(&mut reply, purpose::SERVICE_TICKET)?;
        ctx.store.put_symmetric_key(&ctx.identity, service, &session_key).await?;

        info!(client = %ctx.identity, service, "service ticket obtained");
        Ok(ServiceCredentials {
            service: service.to_string(),
            service_ticket,
            session_key,
            lifetime_end,
            address: granting.address.clone(),
        })
    }

    /// Leg three: present the service ticket at `service_addr`.
    pub async fn access(&self, credentials: &ServiceCredentials, service_addr: &str) -> Result<Approval, ProtocolError> {
        let request = Envelope::from_tickets([
            credentials.service_ticket.clone(),
            self.authenticator(&credentials.address, &credentials.session_key)?,
        ])?;
        let (mut reply, _) = self.send(service_addr, request).await?;

        let approval = self.ctx.open(&mut reply, purpose::AUTHENTICATOR, &credentials.session_key)?;
        same("address", &credentials.service, approval.require(Field::Address)?)?;
        let approval = Approval {
            service: credentials.service.clone(),
            marker: approval.require(Field::SubjectId)?.to_string(),
            issued_at: approval.require_time(Field::IssuedAt)?,
        };
        info!(client = %self.ctx.identity, service = %approval.service, "access approved");
        Ok(approval)
    }

    /// All three legs; the first failure ends the run.
    pub async fn run(&self, service: &str, service_addr: &str) -> Result<Approval, ProtocolError> {
        let granting = self.authenticate().await?;
        debug!(ticket = %granting.granting_ticket, "holding granting ticket");
        let credentials = self.request_service(&granting, service).await?;
        debug!(ticket = %credentials.service_ticket, "holding service ticket");
        self.access(&credentials, service_addr).await
    }
}
