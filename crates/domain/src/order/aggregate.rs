//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;

use crate::aggregate::Aggregate;

use super::{
    AccountEmail, Money, OrderError, OrderEvent, OrderStatus, ShopItem, ValidationError,
    events::OrderCreatedData,
    value_objects::{total_price, validate_items},
};

/// Order aggregate root.
///
/// Covers the lifecycle from creation through payment, submission and
/// delivery, or cancellation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Order {
    id: Option<AggregateId>,
    version: Version,
    shop_items: Vec<ShopItem>,
    account_email: Option<AccountEmail>,
    delivery_address: Option<String>,
    total_price: Money,
    status: OrderStatus,
    cancel_reason: Option<String>,
    delivery_timestamp: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderCreated(data) => self.apply_order_created(data),
            OrderEvent::OrderPaid(_) => self.status = OrderStatus::Paid,
            OrderEvent::OrderSubmitted(_) => self.status = OrderStatus::Submitted,
            OrderEvent::OrderDelivering(_) => self.status = OrderStatus::Delivering,
            OrderEvent::OrderDelivered(data) => {
                self.status = OrderStatus::Delivered;
                self.delivery_timestamp = Some(data.delivery_timestamp);
            }
            OrderEvent::OrderCanceled(data) => {
                self.status = OrderStatus::Canceled;
                self.cancel_reason = Some(data.cancel_reason);
            }
            OrderEvent::OrderUpdated(data) => {
                self.total_price = total_price(&data.shop_items);
                self.shop_items = data.shop_items;
            }
            OrderEvent::DeliveryAddressChanged(data) => {
                self.delivery_address = Some(data.delivery_address);
            }
        }
    }
}

// Query methods
impl Order {
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn shop_items(&self) -> &[ShopItem] {
        &self.shop_items
    }

    pub fn account_email(&self) -> Option<&AccountEmail> {
        self.account_email.as_ref()
    }

    pub fn delivery_address(&self) -> Option<&str> {
        self.delivery_address.as_deref()
    }

    /// Sum of price × quantity over all shop items.
    pub fn total_price(&self) -> Money {
        self.total_price
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn delivery_timestamp(&self) -> Option<DateTime<Utc>> {
        self.delivery_timestamp
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

// Command methods (return events)
impl Order {
    pub fn create(
        &self,
        order_id: AggregateId,
        shop_items: Vec<ShopItem>,
        account_email: &str,
        delivery_address: Option<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        validate_items(&shop_items)?;
        let account_email = AccountEmail::parse(account_email)?;
        let delivery_address = delivery_address
            .map(|address| non_blank(address, "delivery address"))
            .transpose()?;

        Ok(vec![OrderEvent::order_created(
            order_id,
            shop_items,
            account_email,
            delivery_address,
        )])
    }

    pub fn pay(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure(self.status.can_pay(), "pay")?;
        Ok(vec![OrderEvent::order_paid()])
    }

    pub fn submit(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure(self.status.can_submit(), "submit")?;
        Ok(vec![OrderEvent::order_submitted()])
    }

    /// Replaces the shop items.
    pub fn update_items(&self, shop_items: Vec<ShopItem>) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure(self.status.can_update_items(), "update items of")?;
        validate_items(&shop_items)?;
        Ok(vec![OrderEvent::order_updated(shop_items)])
    }

    pub fn change_delivery_address(
        &self,
        delivery_address: String,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure(
            self.status.can_change_delivery_address(),
            "change the delivery address of",
        )?;
        let delivery_address = non_blank(delivery_address, "delivery address")?;
        Ok(vec![OrderEvent::delivery_address_changed(delivery_address)])
    }

    pub fn start_delivery(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure(self.status.can_start_delivery(), "start delivery of")?;
        Ok(vec![OrderEvent::order_delivering()])
    }

    /// Marks the order delivered, at `delivered_at` or now.
    pub fn complete_delivery(
        &self,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure(self.status.can_complete_delivery(), "complete delivery of")?;
        Ok(vec![OrderEvent::order_delivered(
            delivered_at.unwrap_or_else(Utc::now),
        )])
    }

    pub fn cancel(&self, cancel_reason: String) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure(self.status.can_cancel(), "cancel")?;
        let cancel_reason = non_blank(cancel_reason, "cancel reason")?;
        Ok(vec![OrderEvent::order_canceled(cancel_reason)])
    }
}

// Event application helpers
impl Order {
    fn ensure(&self, allowed: bool, action: &'static str) -> Result<(), OrderError> {
        if allowed {
            Ok(())
        } else {
            Err(OrderError::InvalidTransition {
                status: self.status,
                action,
            })
        }
    }

    fn apply_order_created(&mut self, data: OrderCreatedData) {
        self.id = Some(data.order_id);
        self.total_price = total_price(&data.shop_items);
        self.shop_items = data.shop_items;
        self.account_email = Some(data.account_email);
        self.delivery_address = data.delivery_address;
        self.status = OrderStatus::Created;
        self.created_at = Some(data.created_at);
    }
}

fn non_blank(value: String, field: &'static str) -> Result<String, ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank(field));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Step = fn(&Order) -> Result<Vec<OrderEvent>, OrderError>;

    fn mug(quantity: u64) -> ShopItem {
        ShopItem::new("sku-mug", "Mug", "Blue mug", quantity, Money::from_cents(750))
    }

    /// Runs a command against the order and applies what it produced.
    fn run(order: &mut Order, step: impl FnOnce(&Order) -> Result<Vec<OrderEvent>, OrderError>) {
        let events = step(order).unwrap();
        order.apply_events(events);
    }

    fn created_order() -> (Order, AggregateId) {
        let mut order = Order::default();
        let order_id = AggregateId::new();
        run(&mut order, |o| {
            o.create(order_id, vec![mug(2)], "buyer@example.com", None)
        });
        (order, order_id)
    }

    fn order_in(status: OrderStatus) -> Order {
        let (mut order, _) = created_order();
        if status == OrderStatus::Canceled {
            run(&mut order, |o| o.cancel("no longer needed".to_string()));
            return order;
        }

        let path: [Step; 4] = [
            Order::pay,
            Order::submit,
            Order::start_delivery,
            |o| o.complete_delivery(None),
        ];
        for step in path {
            if order.status() == status {
                break;
            }
            run(&mut order, step);
        }
        assert_eq!(order.status(), status);
        order
    }

    #[test]
    fn test_create_order() {
        let (order, order_id) = created_order();
        assert_eq!(order.id(), Some(order_id));
        assert_eq!(order.version(), Version::first());
        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.total_price(), Money::from_cents(1500));
        assert_eq!(order.account_email().unwrap().as_str(), "buyer@example.com");
        assert!(order.created_at().is_some());
    }

    #[test]
    fn test_create_validates_payload() {
        let order = Order::default();
        let id = AggregateId::new();

        let cases = [
            order.create(id, vec![], "buyer@example.com", None),
            order.create(id, vec![mug(0)], "buyer@example.com", None),
            order.create(id, vec![mug(1)], "not-an-email", None),
            order.create(id, vec![mug(1)], "buyer@example.com", Some("  ".into())),
        ];
        for result in cases {
            assert!(matches!(result, Err(OrderError::ValidationFailed(_))));
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let delivered = order_in(OrderStatus::Delivered);
        assert_eq!(delivered.version(), Version::new(5));
        assert!(delivered.delivery_timestamp().is_some());
    }

    #[test]
    fn test_pay_twice_leaves_state_unchanged() {
        let paid = order_in(OrderStatus::Paid);
        let before = paid.clone();

        let result = paid.pay();
        assert!(matches!(
            result,
            Err(OrderError::InvalidTransition {
                status: OrderStatus::Paid,
                action: "pay"
            })
        ));
        assert_eq!(paid, before);
        assert_eq!(paid.version(), Version::new(2));
    }

    #[test]
    fn test_illegal_transitions() {
        let created = order_in(OrderStatus::Created);
        assert!(created.submit().is_err());
        assert!(created.start_delivery().is_err());
        assert!(created.complete_delivery(None).is_err());

        let delivering = order_in(OrderStatus::Delivering);
        assert!(delivering.cancel("late".into()).is_err());
        assert!(delivering.update_items(vec![mug(1)]).is_err());
        assert!(delivering.change_delivery_address("x".into()).is_err());

        for terminal in [OrderStatus::Delivered, OrderStatus::Canceled] {
            let order = order_in(terminal);
            assert!(order.pay().is_err());
            assert!(order.cancel("again".into()).is_err());
        }
    }

    #[test]
    fn test_update_items_recomputes_total() {
        let mut order = order_in(OrderStatus::Paid);
        let bowl = ShopItem::new("sku-bowl", "Bowl", "", 3, Money::from_cents(400));
        run(&mut order, |o| o.update_items(vec![mug(1), bowl]));

        assert_eq!(order.status(), OrderStatus::Paid);
        assert_eq!(order.shop_items().len(), 2);
        assert_eq!(order.total_price(), Money::from_cents(750 + 1200));
    }

    #[test]
    fn test_update_items_after_submit() {
        let order = order_in(OrderStatus::Submitted);
        assert!(matches!(
            order.update_items(vec![mug(1)]),
            Err(OrderError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_change_delivery_address() {
        let mut order = order_in(OrderStatus::Submitted);
        run(&mut order, |o| {
            o.change_delivery_address("42 Harbour Rd".into())
        });
        assert_eq!(order.delivery_address(), Some("42 Harbour Rd"));
        assert_eq!(order.status(), OrderStatus::Submitted);

        assert!(matches!(
            order.change_delivery_address(" ".into()),
            Err(OrderError::ValidationFailed(ValidationError::Blank(_)))
        ));
    }

    #[test]
    fn test_cancel_records_reason() {
        let order = order_in(OrderStatus::Canceled);
        assert_eq!(order.cancel_reason(), Some("no longer needed"));

        let created = order_in(OrderStatus::Created);
        assert!(matches!(
            created.cancel(String::new()),
            Err(OrderError::ValidationFailed(ValidationError::Blank(
                "cancel reason"
            )))
        ));
    }

    #[test]
    fn test_complete_delivery_keeps_given_timestamp() {
        let mut order = order_in(OrderStatus::Delivering);
        let at = Utc::now() - chrono::Duration::hours(1);
        run(&mut order, |o| o.complete_delivery(Some(at)));
        assert_eq!(order.delivery_timestamp(), Some(at));
    }

    #[test]
    fn test_replay_matches_live_state() {
        let mut live = Order::default();
        let mut history = Vec::new();

        let steps: [Step; 4] = [
            |o| o.create(AggregateId::new(), vec![mug(1)], "a@b.io", Some("1 Main St".into())),
            Order::pay,
            |o| o.change_delivery_address("2 Side St".into()),
            Order::submit,
        ];
        for step in steps {
            let events = step(&live).unwrap();
            history.extend(events.clone());
            live.apply_events(events);
        }

        let mut replayed = Order::default();
        for (i, event) in history.into_iter().enumerate() {
            assert!(replayed.apply_versioned(event, Version::new(i as i64 + 1)));
        }

        assert_eq!(replayed, live);
        assert_eq!(replayed.delivery_address(), Some("2 Side St"));
        assert_eq!(replayed.version(), Version::new(4));
    }

    #[test]
    fn test_duplicate_application_is_ignored() {
        let mut order = order_in(OrderStatus::Created);
        let paid = order.pay().unwrap().remove(0);

        assert!(order.apply_versioned(paid.clone(), Version::new(2)));
        let before = order.clone();
        assert!(!order.apply_versioned(paid, Version::new(2)));
        assert_eq!(order, before);
    }
}
