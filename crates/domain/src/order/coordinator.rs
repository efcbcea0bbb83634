//! Order transaction coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{CartId, CartStatus, Money, OrderId, OrderItemId, OrderStatus, ProductId, UserId};
use serde::Serialize;
use store::{Customer, Order, OrderItem, PaymentSession, Store, Transaction};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::request::{OrderLine, PlaceOrder, PlacedOrder, merge_lines, validate_terms};
use crate::error::{OrderError, Result};
use crate::ledger;
use crate::mailer::{MailJob, MailQueue};
use crate::payment::{PaymentGateway, SessionRequest};
use crate::unit_of_work::finish;

/// Who pays and how, shared by direct orders and cart checkouts.
#[derive(Debug, Clone)]
pub(crate) struct Terms {
    pub user_id: UserId,
    pub payment_method: String,
    pub paid_amount: Money,
}

/// Counts from one pass of [`OrderCoordinator::retry_missing_sessions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub attached: usize,
    pub failed: usize,
    /// Failures the processor called final. These orders are not retried.
    pub abandoned: usize,
}

/// Places orders against the inventory ledger and opens their payment
/// sessions.
///
/// Stock check, decrement and order write happen in one transaction. The
/// payment gateway is only called after that transaction committed and all
/// row locks are released, so a slow processor never holds up other orders.
pub struct OrderCoordinator<S: Store> {
    store: Arc<S>,
    gateway: Arc<dyn PaymentGateway>,
    mail: Option<MailQueue>,
}

impl<S: Store> Clone for OrderCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            gateway: Arc::clone(&self.gateway),
            mail: self.mail.clone(),
        }
    }
}

impl<S: Store> OrderCoordinator<S> {
    pub fn new(store: Arc<S>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            store,
            gateway,
            mail: None,
        }
    }

    /// Sends an "order placed" mail through `queue` for every committed order.
    pub fn with_mail_queue(mut self, queue: MailQueue) -> Self {
        self.mail = Some(queue);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Places an order.
    ///
    /// Products are locked in ascending id order regardless of request order.
    /// Any failure before commit leaves no trace. A gateway failure after
    /// commit is reported in [`PlacedOrder::payment_error`]; the order stays
    /// committed and pending.
    #[tracing::instrument(skip(self, cmd), fields(user_id = %cmd.user_id, lines = cmd.items.len()))]
    pub async fn create_order(&self, cmd: PlaceOrder) -> Result<PlacedOrder> {
        validate_terms(&cmd.payment_method, cmd.paid_amount)?;
        let lines = merge_lines(&cmd.items)?;
        let customer = self.customer(cmd.user_id).await?;
        let terms = Terms {
            user_id: cmd.user_id,
            payment_method: cmd.payment_method,
            paid_amount: cmd.paid_amount,
        };

        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let outcome = write_order(&mut tx, &terms, &lines).await;
        let order = self.settle(tx, outcome, started).await?;

        Ok(self.after_commit(order, &customer).await)
    }

    /// Turns a cart into an order. The cart is closed in the same transaction,
    /// so it is checked out iff the order commits.
    pub(crate) async fn checkout_cart(&self, cart_id: CartId, terms: Terms) -> Result<PlacedOrder> {
        validate_terms(&terms.payment_method, terms.paid_amount)?;
        let customer = self.customer(terms.user_id).await?;

        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let outcome = checkout_in(&mut tx, cart_id, &terms).await;
        let order = self.settle(tx, outcome, started).await?;

        Ok(self.after_commit(order, &customer).await)
    }

    /// Administrative status change, subject to the order status machine.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, order_id: OrderId, status: OrderStatus) -> Result<Order> {
        let mut tx = self.store.begin().await?;
        let outcome = transition(&mut tx, order_id, status).await;
        let order = finish(tx, outcome).await?;

        tracing::info!(%order_id, %status, "order status updated");
        Ok(order)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))
    }

    /// Orders of a user, most recent first.
    #[tracing::instrument(skip(self))]
    pub async fn order_history(&self, user_id: UserId) -> Result<Vec<Order>> {
        Ok(self.store.orders_for_user(user_id).await?)
    }

    /// Asks the gateway again for up to `limit` pending orders that never got
    /// a payment session.
    ///
    /// Orders that failed fewer times go first, so a batch of orders that keep
    /// failing cannot starve newer ones. An order the processor refused is
    /// never picked again.
    #[tracing::instrument(skip(self))]
    pub async fn retry_missing_sessions(&self, limit: usize) -> Result<SweepReport> {
        let orders = self.store.orders_missing_session(limit).await?;
        let mut report = SweepReport::default();

        for order in orders {
            report.attempted += 1;

            let Some(customer) = self.store.get_customer(order.user_id).await? else {
                report.failed += 1;
                self.store.record_session_failure(order.id, false).await?;
                tracing::warn!(order_id = %order.id, user_id = %order.user_id, "customer missing, cannot open session");
                continue;
            };

            match self.open_session(&order, &customer).await {
                Ok(_) => {
                    report.attached += 1;
                    metrics::counter!("payment_sessions_retried_total", "outcome" => "attached")
                        .increment(1);
                }
                Err(e) => {
                    let permanent = self.note_session_failure(order.id, &e).await;
                    let outcome = if permanent {
                        report.abandoned += 1;
                        "abandoned"
                    } else {
                        report.failed += 1;
                        "failed"
                    };
                    metrics::counter!("payment_sessions_retried_total", "outcome" => outcome)
                        .increment(1);
                    tracing::warn!(order_id = %order.id, error = %e, "session retry failed");
                }
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                attached = report.attached,
                failed = report.failed,
                abandoned = report.abandoned,
                "payment session sweep finished"
            );
        }
        Ok(report)
    }

    /// Runs [`Self::retry_missing_sessions`] every `every` until the task is
    /// aborted.
    pub fn spawn_session_sweep(&self, every: Duration, batch: usize) -> JoinHandle<()>
    where
        S: 'static,
    {
        let coordinator = self.clone();
        let every = every.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.retry_missing_sessions(batch).await {
                    tracing::warn!(error = %e, "payment session sweep failed");
                }
            }
        })
    }

    async fn customer(&self, user_id: UserId) -> Result<Customer> {
        self.store
            .get_customer(user_id)
            .await?
            .ok_or(OrderError::CustomerNotFound(user_id))
    }

    async fn settle(&self, tx: S::Tx, outcome: Result<Order>, started: Instant) -> Result<Order> {
        let result = finish(tx, outcome).await;
        metrics::histogram!("order_transaction_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(order) => {
                metrics::counter!("orders_created_total").increment(1);
                tracing::info!(order_id = %order.id, total = %order.total, items = order.item_count(), "order committed");
            }
            Err(e) => {
                metrics::counter!("orders_rejected_total", "kind" => e.kind().as_str()).increment(1);
                tracing::debug!(error = %e, "order rolled back");
            }
        }
        result
    }

    async fn after_commit(&self, mut order: Order, customer: &Customer) -> PlacedOrder {
        self.notify_placed(&order, customer);

        match self.open_session(&order, customer).await {
            Ok(session) => {
                order.payment_session = Some(session);
                PlacedOrder {
                    order,
                    payment_error: None,
                }
            }
            Err(e) => {
                metrics::counter!("payment_sessions_failed_total").increment(1);
                self.note_session_failure(order.id, &e).await;
                tracing::warn!(order_id = %order.id, error = %e, "order committed without payment session");
                PlacedOrder {
                    order,
                    payment_error: Some(e),
                }
            }
        }
    }

    async fn open_session(&self, order: &Order, customer: &Customer) -> Result<PaymentSession> {
        let request = SessionRequest::for_order(order, customer);
        let session = self.gateway.create_session(&request).await?;

        if self.store.attach_payment_session(order.id, &session).await? {
            return Ok(session);
        }

        // Another caller attached first; keep what is stored.
        let stored = self
            .store
            .get_order(order.id)
            .await?
            .and_then(|o| o.payment_session);
        Ok(stored.unwrap_or(session))
    }

    /// Records a failed session attempt. Returns true if the processor refused
    /// the order for good.
    async fn note_session_failure(&self, order_id: OrderId, err: &OrderError) -> bool {
        let permanent = matches!(err, OrderError::Upstream(e) if e.is_permanent());
        if let Err(e) = self.store.record_session_failure(order_id, permanent).await {
            tracing::warn!(%order_id, error = %e, "could not record payment session failure");
        }
        if permanent {
            tracing::warn!(%order_id, "payment processor refused the order, no further session attempts");
        }
        permanent
    }

    fn notify_placed(&self, order: &Order, customer: &Customer) {
        if let Some(queue) = &self.mail {
            queue.submit(MailJob::OrderPlaced {
                order_id: order.id,
                to: customer.email.clone(),
                name: customer.full_name.clone(),
                total: order.total,
            });
        }
    }
}

/// Reserves every line and writes the order. `lines` must already be merged.
async fn write_order<T: Transaction>(
    tx: &mut T,
    terms: &Terms,
    lines: &[(ProductId, u32)],
) -> Result<Order> {
    // Lock in ascending product id so orders over the same products never
    // wait on each other in a cycle.
    let mut by_id: Vec<(usize, ProductId, u32)> = lines
        .iter()
        .enumerate()
        .map(|(position, (product_id, quantity))| (position, *product_id, *quantity))
        .collect();
    by_id.sort_by_key(|(_, product_id, _)| *product_id);

    let mut reservations = Vec::with_capacity(by_id.len());
    for (position, product_id, quantity) in by_id {
        let reservation = ledger::reserve(tx, product_id, quantity).await?;
        reservations.push((position, reservation));
    }
    reservations.sort_by_key(|(position, _)| *position);

    let mut total = Money::zero();
    let mut items = Vec::with_capacity(reservations.len());
    for (_, reservation) in reservations {
        let subtotal = reservation.subtotal()?;
        total = total
            .checked_add(subtotal)
            .ok_or(OrderError::TotalOverflow)?;
        items.push(OrderItem {
            id: OrderItemId::new(),
            product_id: reservation.product_id,
            product_name: reservation.product_name,
            quantity: reservation.quantity,
            unit_price: reservation.unit_price,
            subtotal,
        });
    }

    let now = Utc::now();
    let order = Order {
        id: OrderId::new(),
        user_id: terms.user_id,
        items,
        total,
        payment_method: terms.payment_method.clone(),
        paid_amount: terms.paid_amount,
        status: OrderStatus::Pending,
        payment_session: None,
        created_at: now,
        updated_at: now,
    };
    tx.insert_order(&order).await?;
    Ok(order)
}

async fn checkout_in<T: Transaction>(tx: &mut T, cart_id: CartId, terms: &Terms) -> Result<Order> {
    let cart = tx
        .lock_cart(cart_id)
        .await?
        .ok_or(OrderError::CartNotFound(cart_id))?;

    if !cart.status.is_open() {
        return Err(OrderError::CartClosed(cart_id));
    }
    if cart.user_id != terms.user_id {
        return Err(OrderError::CartNotFound(cart_id));
    }
    if cart.is_empty() {
        return Err(OrderError::EmptyCart(cart_id));
    }

    let lines: Vec<OrderLine> = cart
        .items
        .iter()
        .map(|item| OrderLine::new(item.product_id, i64::from(item.quantity)))
        .collect();
    let lines = merge_lines(&lines)?;

    let order = write_order(tx, terms, &lines).await?;
    tx.set_cart_status(cart_id, CartStatus::CheckedOut).await?;
    Ok(order)
}

async fn transition<T: Transaction>(
    tx: &mut T,
    order_id: OrderId,
    next: OrderStatus,
) -> Result<Order> {
    let mut order = tx
        .lock_order(order_id)
        .await?
        .ok_or(OrderError::OrderNotFound(order_id))?;

    if !order.status.can_transition_to(next) {
        return Err(OrderError::InvalidTransition {
            order_id,
            from: order.status,
            to: next,
        });
    }

    tx.set_order_status(order_id, next).await?;
    order.status = next;
    order.updated_at = Utc::now();
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::InMemoryPaymentGateway;
    use store::{InMemoryStore, Product};

    struct Fixture {
        store: Arc<InMemoryStore>,
        gateway: InMemoryPaymentGateway,
        coordinator: OrderCoordinator<InMemoryStore>,
        customer: Customer,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let customer = Customer::new("Ada Lovelace", "ada@example.com", "+62 811");
        store.insert_customer(customer.clone()).await;
        let gateway = InMemoryPaymentGateway::new();
        let coordinator = OrderCoordinator::new(store.clone(), Arc::new(gateway.clone()));
        Fixture {
            store,
            gateway,
            coordinator,
            customer,
        }
    }

    async fn product(store: &InMemoryStore, cents: i64, stock: u32) -> Product {
        let product = Product::new("Widget", Money::from_cents(cents), stock);
        store.insert_product(product.clone()).await;
        product
    }

    #[tokio::test]
    async fn total_is_computed_from_locked_prices() {
        let f = fixture().await;
        let a = product(&f.store, 1_250, 10).await;
        let b = product(&f.store, 300, 10).await;

        let placed = f
            .coordinator
            .create_order(
                PlaceOrder::new(f.customer.id, "bank_transfer")
                    .with_item(a.id, 2)
                    .with_item(b.id, 3),
            )
            .await
            .unwrap();

        let order = &placed.order;
        assert_eq!(order.total, Money::from_cents(2 * 1_250 + 3 * 300));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.items[0].product_id, a.id);
        assert_eq!(order.items[1].product_id, b.id);
        assert_eq!(order.items[1].subtotal, Money::from_cents(900));
        assert!(placed.is_payable());
        assert_eq!(f.gateway.charged_amount(order.id).await, Some(order.total));
    }

    #[tokio::test]
    async fn duplicate_lines_lock_the_product_once() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;

        let placed = f
            .coordinator
            .create_order(
                PlaceOrder::new(f.customer.id, "gopay")
                    .with_item(a.id, 2)
                    .with_item(a.id, 3),
            )
            .await
            .unwrap();

        assert_eq!(placed.order.item_count(), 1);
        assert_eq!(placed.order.items[0].quantity, 5);
        assert_eq!(f.store.get_product(a.id).await.unwrap().unwrap().stock, 0);
    }

    #[tokio::test]
    async fn insufficient_stock_rolls_back_every_line() {
        let f = fixture().await;
        let plenty = product(&f.store, 100, 50).await;
        let scarce = product(&f.store, 100, 1).await;

        let err = f
            .coordinator
            .create_order(
                PlaceOrder::new(f.customer.id, "gopay")
                    .with_item(plenty.id, 5)
                    .with_item(scarce.id, 2),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::InsufficientStock { product_id, .. } if product_id == scarce.id));
        assert_eq!(f.store.get_product(plenty.id).await.unwrap().unwrap().stock, 50);
        assert_eq!(f.store.order_count().await, 0);
        assert_eq!(f.gateway.call_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_customer_is_rejected_before_the_ledger() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;

        let err = f
            .coordinator
            .create_order(PlaceOrder::new(UserId::new(), "gopay").with_item(a.id, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::CustomerNotFound(_)));
        assert_eq!(f.store.get_product(a.id).await.unwrap().unwrap().stock, 5);
    }

    #[tokio::test]
    async fn commit_failure_writes_nothing() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;
        f.store.set_fail_on_commit(true);

        let err = f
            .coordinator
            .create_order(PlaceOrder::new(f.customer.id, "gopay").with_item(a.id, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::Store(_)));
        assert_eq!(f.store.get_product(a.id).await.unwrap().unwrap().stock, 5);
        assert_eq!(f.gateway.call_count().await, 0);
    }

    #[tokio::test]
    async fn status_updates_follow_the_state_machine() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;
        let order = f
            .coordinator
            .create_order(PlaceOrder::new(f.customer.id, "gopay").with_item(a.id, 1))
            .await
            .unwrap()
            .order;

        let paid = f
            .coordinator
            .update_status(order.id, OrderStatus::Paid)
            .await
            .unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);

        let err = f
            .coordinator
            .update_status(order.id, OrderStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrderError::InvalidTransition {
                from: OrderStatus::Paid,
                to: OrderStatus::Cancelled,
                ..
            }
        ));

        let missing = OrderId::new();
        assert!(matches!(
            f.coordinator.update_status(missing, OrderStatus::Paid).await,
            Err(OrderError::OrderNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn committed_order_survives_gateway_failure() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;
        f.gateway.set_fail_on_create(true).await;

        let placed = f
            .coordinator
            .create_order(PlaceOrder::new(f.customer.id, "gopay").with_item(a.id, 2))
            .await
            .unwrap();

        assert!(matches!(placed.payment_error, Some(OrderError::Upstream(_))));
        assert!(!placed.is_payable());
        let stored = f.coordinator.get_order(placed.order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(stored.payment_session.is_none());
        assert_eq!(f.store.get_product(a.id).await.unwrap().unwrap().stock, 3);

        // Still failing: the sweep reports it and leaves the order alone.
        let report = f.coordinator.retry_missing_sessions(10).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                attempted: 1,
                attached: 0,
                failed: 1,
                abandoned: 0,
            }
        );

        f.gateway.set_fail_on_create(false).await;
        let report = f.coordinator.retry_missing_sessions(10).await.unwrap();
        assert_eq!(report.attached, 1);

        let stored = f.coordinator.get_order(placed.order.id).await.unwrap();
        assert!(stored.payment_session.is_some());
        assert_eq!(
            f.coordinator.retry_missing_sessions(10).await.unwrap(),
            SweepReport::default()
        );
    }

    #[tokio::test]
    async fn refused_order_does_not_block_later_sessions() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;
        f.gateway.set_fail_on_create(true).await;

        let mut ids = Vec::new();
        for _ in 0..2 {
            let placed = f
                .coordinator
                .create_order(PlaceOrder::new(f.customer.id, "gopay").with_item(a.id, 1))
                .await
                .unwrap();
            ids.push(placed.order.id);
        }
        let (refused, later) = (ids[0], ids[1]);

        f.gateway.set_fail_on_create(false).await;
        f.gateway.refuse_order(refused).await;

        let first = f.coordinator.retry_missing_sessions(1).await.unwrap();
        assert_eq!(first.abandoned, 1);
        let second = f.coordinator.retry_missing_sessions(1).await.unwrap();
        assert_eq!(second.attached, 1);

        let later = f.coordinator.get_order(later).await.unwrap();
        assert!(later.payment_session.is_some());
        let refused = f.coordinator.get_order(refused).await.unwrap();
        assert!(refused.payment_session.is_none());
        assert_eq!(refused.status, OrderStatus::Pending);
        assert_eq!(
            f.coordinator.retry_missing_sessions(10).await.unwrap(),
            SweepReport::default()
        );
    }

    #[tokio::test]
    async fn failing_orders_rotate_behind_fresh_ones() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;
        f.gateway.set_fail_on_create(true).await;

        let stale = f
            .coordinator
            .create_order(PlaceOrder::new(f.customer.id, "gopay").with_item(a.id, 1))
            .await
            .unwrap()
            .order
            .id;
        f.coordinator.retry_missing_sessions(1).await.unwrap();
        let fresh = f
            .coordinator
            .create_order(PlaceOrder::new(f.customer.id, "gopay").with_item(a.id, 1))
            .await
            .unwrap()
            .order
            .id;

        f.gateway.set_fail_on_create(false).await;
        assert_eq!(f.coordinator.retry_missing_sessions(1).await.unwrap().attached, 1);

        assert!(f.coordinator.get_order(fresh).await.unwrap().payment_session.is_some());
        assert!(f.coordinator.get_order(stale).await.unwrap().payment_session.is_none());
    }

    #[tokio::test]
    async fn placed_orders_enqueue_a_mail() {
        let f = fixture().await;
        let a = product(&f.store, 100, 5).await;
        let (queue, mut receiver) = MailQueue::channel(4);
        let coordinator = f.coordinator.clone().with_mail_queue(queue);

        let placed = coordinator
            .create_order(PlaceOrder::new(f.customer.id, "gopay").with_item(a.id, 1))
            .await
            .unwrap();

        let job = receiver.try_recv().unwrap();
        assert_eq!(
            job,
            MailJob::OrderPlaced {
                order_id: placed.order.id,
                to: f.customer.email.clone(),
                name: f.customer.full_name.clone(),
                total: placed.order.total,
            }
        );
    }
}
