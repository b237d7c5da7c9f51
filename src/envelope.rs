//! Envelope: the ordered set of tickets carried by one request or response.

use serde::{Deserialize, Serialize};

use crate::crypto::CryptoProvider;
use crate::ticket::{OpenKey, SealKey, Ticket, TicketError};

/// Tickets unique by purpose; lookup by name, insertion order kept for the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    tickets: Vec<Ticket>,
}

#[derive(Deserialize)]
struct WireEnvelope {
    tickets: Vec<Ticket>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = TicketError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        Envelope::from_tickets(wire.tickets)
    }
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from tickets, rejecting a repeated purpose.
    pub fn from_tickets(tickets: impl IntoIterator<Item = Ticket>) -> Result<Self, TicketError> {
        let mut envelope = Self::new();
        for ticket in tickets {
            envelope.insert(ticket)?;
        }
        Ok(envelope)
    }

    pub fn insert(&mut self, ticket: Ticket) -> Result<(), TicketError> {
        if self.contains(ticket.purpose()) {
            return Err(TicketError::Duplicate(ticket.purpose().to_string()));
        }
        self.tickets.push(ticket);
        Ok(())
    }

    pub fn contains(&self, purpose: &str) -> bool {
        self.tickets.iter().any(|t| t.purpose() == purpose)
    }

    pub fn get(&self, purpose: &str) -> Result<&Ticket, TicketError> {
        self.tickets
            .iter()
            .find(|t| t.purpose() == purpose)
            .ok_or_else(|| TicketError::Missing(purpose.to_string()))
    }

    pub fn get_mut(&mut self, purpose: &str) -> Result<&mut Ticket, TicketError> {
        self.tickets
            .iter_mut()
            .find(|t| t.purpose() == purpose)
            .ok_or_else(|| TicketError::Missing(purpose.to_string()))
    }

    /// Remove and return a ticket, e.g. to forward it unopened.
    pub fn take(&mut self, purpose: &str) -> Result<Ticket, TicketError> {
        let index = self
            .tickets
            .iter()
            .position(|t| t.purpose() == purpose)
            .ok_or_else(|| TicketError::Missing(purpose.to_string()))?;
        Ok(self.tickets.remove(index))
    }

    pub fn seal(
        &mut self,
        purpose: &str,
        crypto: &dyn CryptoProvider,
        key: SealKey<'_>,
    ) -> Result<(), TicketError> {
        self.get_mut(purpose)?.seal(crypto, key)
    }

    pub fn open(
        &mut self,
        purpose: &str,
        crypto: &dyn CryptoProvider,
        key: OpenKey<'_>,
    ) -> Result<(), TicketError> {
        self.get_mut(purpose)?.open(crypto, key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.iter()
    }

    pub fn purposes(&self) -> Vec<&str> {
        self.tickets.iter().map(|t| t.purpose()).collect()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
