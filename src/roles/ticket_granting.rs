//! Ticket-granting role: second leg, trades a granting ticket for a service
//! ticket.

use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::lifetime;
use crate::ticket::{purpose, Field, SealKey, Ticket};
use crate::transport::Handler;

use super::{redeem, AuthenticatorPolicy, RoleContext};

pub struct TicketGrantingService {
    ctx: RoleContext,
    authentication: String,
    service_window: Duration,
    policy: AuthenticatorPolicy,
}

impl TicketGrantingService {
    /// `authentication` names the role whose granting tickets are accepted.
    pub fn new(ctx: RoleContext, authentication: impl Into<String>, service_window: Duration, skew: Duration) -> Self {
        Self {
            ctx,
            authentication: authentication.into(),
            service_window,
            policy: AuthenticatorPolicy::new(skew),
        }
    }

    pub async fn grant(&self, mut request: Envelope) -> Result<Envelope, ProtocolError> {
        let ctx = &self.ctx;
        let service = request
            .get(purpose::REQUEST_NEXT_HOP)?
            .require(Field::TargetId)?
            .to_string();

        let granting = redeem(ctx, &self.policy, &mut request, purpose::GRANTING_TICKET, &self.authentication).await?;
        let service_key = ctx.key_with(&service).await?;

        let session_key = ctx.crypto.generate_symmetric_key();
        ctx.store.put_symmetric_key(&granting.subject, &service, &session_key).await?;

        let now = ctx.now();
        // Never outlive the granting ticket.
        let lifetime_end = granting.lifetime_end.min(lifetime::after(now, self.service_window));

        let mut response = Ticket::response_to_client(&service, now, lifetime_end, &session_key);
        let mut service_ticket = Ticket::credential(
            purpose::SERVICE_TICKET,
            &granting.subject,
            &service,
            &granting.address,
            now,
            lifetime_end,
            &session_key,
        );
        response.seal(ctx.crypto.as_ref(), SealKey::Symmetric(&granting.session_key))?;
        service_ticket.seal(ctx.crypto.as_ref(), SealKey::Symmetric(&service_key))?;

        info!(role = %ctx.identity, client = %granting.subject, service = %service, "service ticket issued");
        Ok(Envelope::from_tickets([response, service_ticket])?)
    }
}

#[async_trait]
impl Handler for TicketGrantingService {
    fn role(&self) -> &str {
        &self.ctx.identity
    }

    async fn handle(&self, _peer: SocketAddr, request: Envelope) -> Result<Envelope, ProtocolError> {
        self.grant(request).await
    }
}
