//! Service role: third leg, validates a service ticket and approves access.

use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::ticket::{purpose, SealKey, Ticket};
use crate::transport::Handler;

use super::{redeem, AuthenticatorPolicy, RoleContext};

pub struct ServiceEndpoint {
    ctx: RoleContext,
    ticket_granting: String,
    approval_marker: String,
    policy: AuthenticatorPolicy,
}

impl ServiceEndpoint {
    pub fn new(
        ctx: RoleContext,
        ticket_granting: impl Into<String>,
        approval_marker: impl Into<String>,
        skew: Duration,
    ) -> Self {
        Self {
            ctx,
            ticket_granting: ticket_granting.into(),
            approval_marker: approval_marker.into(),
            policy: AuthenticatorPolicy::new(skew),
        }
    }

    /// Approve `{serviceTicket, authenticator}` with a single sealed
    /// `authenticator` naming this service.
    pub async fn approve(&self, mut request: Envelope) -> Result<Envelope, ProtocolError> {
        let ctx = &self.ctx;
        let ticket = redeem(ctx, &self.policy, &mut request, purpose::SERVICE_TICKET, &self.ticket_granting).await?;

        let mut approval = Ticket::authenticator(&self.approval_marker, &ctx.identity, ctx.now());
        approval.seal(ctx.crypto.as_ref(), SealKey::Symmetric(&ticket.session_key))?;

        info!(role = %ctx.identity, client = %ticket.subject, "access approved");
        Ok(Envelope::from_tickets([approval])?)
    }
}

#[async_trait]
impl Handler for ServiceEndpoint {
    fn role(&self) -> &str {
        &self.ctx.identity
    }

    async fn handle(&self, _peer: SocketAddr, request: Envelope) -> Result<Envelope, ProtocolError> {
        self.approve(request).await
    }
}
