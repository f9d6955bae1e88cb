//! Order-state reconciliation
//!
//! Neither broker pushes events to us, so adapters keep an
//! [`OrderTracker`]: a map of order id to last-seen status, populated on
//! submission and on every listing. Each reconciliation tick diffs the
//! latest listing against the map and turns transitions into fill and
//! status events.
//!
//! Delivery is at-least-once relative to polling; the store's idempotent
//! fill insert (keyed on exec id) absorbs duplicates downstream.

use std::collections::HashMap;
use tracing::debug;

use crate::broker::{BrokerEvent, BrokerOrder, FillEvent};
use crate::types::{is_open_status, is_terminal_status};

#[derive(Debug, Default)]
pub struct OrderTracker {
    tracked: HashMap<String, String>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an order the bot just submitted.
    pub fn track(&mut self, order: &BrokerOrder) {
        self.tracked
            .insert(order.id.clone(), order.status.to_lowercase());
    }

    /// Diff a fresh order listing against the tracked map and emit one
    /// status event per transition, plus a fill event when an order
    /// reaches `filled` / `partially_filled`. Terminal orders leave the
    /// map; open orders seen for the first time (e.g. after a restart)
    /// start being tracked.
    pub fn observe(&mut self, orders: &[BrokerOrder]) -> Vec<BrokerEvent> {
        let mut events = Vec::new();

        for order in orders {
            let status = order.status.to_lowercase();
            match self.tracked.get(&order.id) {
                None => {
                    if is_open_status(&status) {
                        debug!(order_id = %order.id, %status, "tracking_existing_order");
                        self.tracked.insert(order.id.clone(), status);
                    }
                }
                Some(prev) if *prev != status => {
                    debug!(order_id = %order.id, from = %prev, to = %status, "order_status_transition");
                    events.push(BrokerEvent::OrderStatus(order.clone()));

                    if matches!(status.as_str(), "filled" | "partially_filled")
                        && order.filled_qty > 0.0
                    {
                        events.push(BrokerEvent::Fill {
                            fill: FillEvent::from_order(order),
                            order: order.clone(),
                        });
                    }

                    if is_terminal_status(&status) {
                        self.tracked.remove(&order.id);
                    } else {
                        self.tracked.insert(order.id.clone(), status);
                    }
                }
                Some(_) => {}
            }
        }

        events
    }

    /// Drop an order from tracking (after an explicit cancel).
    pub fn untrack(&mut self, order_id: &str) {
        self.tracked.remove(order_id);
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}
