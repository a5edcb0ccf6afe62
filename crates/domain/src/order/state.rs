//! Order lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Status of an order.
///
/// ```text
/// Created ──► Paid ──► Submitted ──► Delivering ──► Delivered
///    │          │          │
///    └──────────┴──────────┴──► Canceled
/// ```
///
/// Shop items may be replaced while Created or Paid; the delivery address may
/// change until the order is out for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    #[default]
    Created,
    Paid,
    Submitted,
    Delivering,
    /// Terminal.
    Delivered,
    /// Terminal.
    Canceled,
}

impl OrderStatus {
    pub fn can_pay(&self) -> bool {
        matches!(self, OrderStatus::Created)
    }

    pub fn can_submit(&self) -> bool {
        matches!(self, OrderStatus::Paid)
    }

    pub fn can_start_delivery(&self) -> bool {
        matches!(self, OrderStatus::Submitted)
    }

    pub fn can_complete_delivery(&self) -> bool {
        matches!(self, OrderStatus::Delivering)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OrderStatus::Created | OrderStatus::Paid | OrderStatus::Submitted
        )
    }

    pub fn can_update_items(&self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::Paid)
    }

    pub fn can_change_delivery_address(&self) -> bool {
        matches!(
            self,
            OrderStatus::Created | OrderStatus::Paid | OrderStatus::Submitted
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "Created",
            OrderStatus::Paid => "Paid",
            OrderStatus::Submitted => "Submitted",
            OrderStatus::Delivering => "Delivering",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Canceled => "Canceled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 6] = [
        OrderStatus::Created,
        OrderStatus::Paid,
        OrderStatus::Submitted,
        OrderStatus::Delivering,
        OrderStatus::Delivered,
        OrderStatus::Canceled,
    ];

    fn allowed(check: fn(&OrderStatus) -> bool) -> Vec<OrderStatus> {
        ALL.into_iter().filter(|s| check(s)).collect()
    }

    #[test]
    fn forward_transitions_follow_the_lifecycle() {
        assert_eq!(allowed(OrderStatus::can_pay), vec![OrderStatus::Created]);
        assert_eq!(allowed(OrderStatus::can_submit), vec![OrderStatus::Paid]);
        assert_eq!(
            allowed(OrderStatus::can_start_delivery),
            vec![OrderStatus::Submitted]
        );
        assert_eq!(
            allowed(OrderStatus::can_complete_delivery),
            vec![OrderStatus::Delivering]
        );
    }

    #[test]
    fn cancel_is_allowed_until_delivery_starts() {
        assert_eq!(
            allowed(OrderStatus::can_cancel),
            vec![
                OrderStatus::Created,
                OrderStatus::Paid,
                OrderStatus::Submitted
            ]
        );
    }

    #[test]
    fn item_and_address_edits() {
        assert_eq!(
            allowed(OrderStatus::can_update_items),
            vec![OrderStatus::Created, OrderStatus::Paid]
        );
        assert_eq!(
            allowed(OrderStatus::can_change_delivery_address),
            vec![
                OrderStatus::Created,
                OrderStatus::Paid,
                OrderStatus::Submitted
            ]
        );
    }

    #[test]
    fn terminal_states_allow_nothing() {
        for status in [OrderStatus::Delivered, OrderStatus::Canceled] {
            assert!(status.is_terminal());
            assert!(!status.can_pay());
            assert!(!status.can_cancel());
            assert!(!status.can_update_items());
            assert!(!status.can_change_delivery_address());
        }
    }

    #[test]
    fn display_and_serde_use_variant_names() {
        assert_eq!(OrderStatus::Delivering.to_string(), "Delivering");
        let json = serde_json::to_string(&OrderStatus::Canceled).unwrap();
        assert_eq!(json, "\"Canceled\"");
    }
}
