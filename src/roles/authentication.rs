//! Authentication role: first leg, issues the granting ticket.

use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::lifetime;
use crate::ticket::{purpose, Field, SealKey, Ticket};
use crate::transport::Handler;

use super::{same, RoleContext};

pub struct AuthenticationService {
    ctx: RoleContext,
    ticket_granting: String,
    grant_window: Duration,
}

impl AuthenticationService {
    pub fn new(ctx: RoleContext, ticket_granting: impl Into<String>, grant_window: Duration) -> Self {
        Self { ctx, ticket_granting: ticket_granting.into(), grant_window }
    }

    /// Issue `{responseToClient, grantingTicket}` for one request.
    ///
    /// `peer` is the address the request arrived from; it is bound into the
    /// granting ticket.
    pub async fn issue(&self, peer: SocketAddr, request: &Envelope) -> Result<Envelope, ProtocolError> {
        let ctx = &self.ctx;
        let ticket = request.get(purpose::REQUEST)?;
        let client = ticket.require(Field::SubjectId)?;
        same("targetId", &self.ticket_granting, ticket.require(Field::TargetId)?)?;
        let requested = match ticket.raw(Field::LifetimeEnd) {
            Some(_) => Some(ticket.require_time(Field::LifetimeEnd)?),
            None => None,
        };

        // Both long-term keys must exist before anything is generated.
        let client_key = ctx.key_with(client).await?;
        let tgs_key = ctx.key_with(&self.ticket_granting).await?;

        let session_key = ctx.crypto.generate_symmetric_key();
        let now = ctx.now();
        let lifetime_end = lifetime::clamp(requested, now, self.grant_window);

        let mut response = Ticket::response_to_client(&self.ticket_granting, now, lifetime_end, &session_key);
        let mut granting = Ticket::credential(
            purpose::GRANTING_TICKET,
            client,
            &self.ticket_granting,
            &peer.ip().to_string(),
            now,
            lifetime_end,
            &session_key,
        );
        response.seal(ctx.crypto.as_ref(), SealKey::Symmetric(&client_key))?;
        granting.seal(ctx.crypto.as_ref(), SealKey::Symmetric(&tgs_key))?;
        ctx.store.put_symmetric_key(client, &self.ticket_granting, &session_key).await?;

        info!(
            role = %ctx.identity,
            client,
            lifetime_end = %lifetime::format(lifetime_end),
            "granting ticket issued"
        );
        Ok(Envelope::from_tickets([response, granting])?)
    }
}

#[async_trait]
impl Handler for AuthenticationService {
    fn role(&self) -> &str {
        &self.ctx.identity
    }

    async fn handle(&self, peer: SocketAddr, request: Envelope) -> Result<Envelope, ProtocolError> {
        self.issue(peer, &request).await
    }
}
