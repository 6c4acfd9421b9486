//! Breakout order pair and lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{OrderKind, OrderSide, Ticket};

/// Lifecycle state of the engine's order pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Nothing placed yet today
    Idle,
    /// Opposing entries working, neither filled
    PendingBothSides,
    /// One entry filled, position open
    OneSideTriggered,
    /// Position gone and no orders outstanding
    Closed,
}

impl LifecycleState {
    /// Whether a new pair may be placed from this state
    pub fn can_place(&self) -> bool {
        matches!(self, Self::Idle | Self::Closed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::PendingBothSides => write!(f, "PENDING"),
            Self::OneSideTriggered => write!(f, "TRIGGERED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// One side of the pair as placed at the venue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub ticket: Ticket,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Buy-side and sell-side breakout entries. Either side may be absent when
/// the directional filter suppressed it or the venue rejected it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPair {
    pub id: Uuid,
    pub buy: Option<OrderLeg>,
    pub sell: Option<OrderLeg>,
    pub size: f64,
    pub placed_at: DateTime<Utc>,
}

impl OrderPair {
    pub fn new(size: f64, placed_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            buy: None,
            sell: None,
            size,
            placed_at,
        }
    }

    pub fn leg(&self, side: OrderSide) -> Option<&OrderLeg> {
        match side {
            OrderSide::Buy => self.buy.as_ref(),
            OrderSide::Sell => self.sell.as_ref(),
        }
    }

    pub fn set_leg(&mut self, leg: OrderLeg) {
        match leg.side {
            OrderSide::Buy => self.buy = Some(leg),
            OrderSide::Sell => self.sell = Some(leg),
        }
    }

    /// Tickets of both legs that were placed
    pub fn tickets(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.buy.iter().chain(self.sell.iter()).map(|leg| leg.ticket)
    }

    pub fn is_empty(&self) -> bool {
        self.buy.is_none() && self.sell.is_none()
    }

    /// Which side a ticket belongs to
    pub fn side_of(&self, ticket: Ticket) -> Option<OrderSide> {
        [self.buy, self.sell]
            .into_iter()
            .flatten()
            .find(|leg| leg.ticket == ticket)
            .map(|leg| leg.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(ticket: Ticket, side: OrderSide) -> OrderLeg {
        OrderLeg {
            ticket,
            side,
            kind: OrderKind::Stop,
            entry_price: 1.1,
            stop_loss: 1.0,
            take_profit: 1.2,
        }
    }

    #[test]
    fn test_pair_legs() {
        let mut pair = OrderPair::new(0.5, Utc::now());
        assert!(pair.is_empty());

        pair.set_leg(leg(11, OrderSide::Buy));
        pair.set_leg(leg(12, OrderSide::Sell));

        assert_eq!(pair.tickets().collect::<Vec<_>>(), vec![11, 12]);
        assert_eq!(pair.side_of(11), Some(OrderSide::Buy));
        assert_eq!(pair.side_of(12), Some(OrderSide::Sell));
        assert_eq!(pair.side_of(13), None);
        assert_eq!(pair.leg(OrderSide::Sell).map(|l| l.ticket), Some(12));
    }

    #[test]
    fn test_can_place() {
        assert!(LifecycleState::Idle.can_place());
        assert!(LifecycleState::Closed.can_place());
        assert!(!LifecycleState::PendingBothSides.can_place());
        assert!(!LifecycleState::OneSideTriggered.can_place());
    }
}
