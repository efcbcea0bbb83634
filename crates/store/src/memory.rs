use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use common::{CartId, CartItemId, CartStatus, OrderId, OrderStatus, ProductId, UserId};
use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::{
    Cart, CartItem, Customer, Order, PaymentSession, Product, Result, StoreError,
    store::{CartItemWrite, Store, Transaction},
};

/// A lockable row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Product(ProductId),
    Order(OrderId),
    Cart(CartId),
}

/// One async mutex per row, created on first use.
///
/// Nothing acquires a row lock while holding the table lock, so the two can
/// never deadlock against each other.
#[derive(Default)]
struct RowLocks {
    rows: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl RowLocks {
    async fn acquire(&self, key: RowKey) -> Result<OwnedMutexGuard<()>> {
        let row = {
            let mut rows = self
                .rows
                .lock()
                .map_err(|_| StoreError::Unavailable("row lock table poisoned".to_string()))?;
            rows.entry(key).or_default().clone()
        };

        let started = std::time::Instant::now();
        let guard = row.lock_owned().await;
        metrics::histogram!("store_row_lock_wait_seconds").record(started.elapsed().as_secs_f64());
        Ok(guard)
    }
}

#[derive(Default)]
struct Tables {
    products: HashMap<ProductId, Product>,
    customers: HashMap<UserId, Customer>,
    orders: HashMap<OrderId, Order>,
    /// Order ids in commit order.
    order_log: Vec<OrderId>,
    carts: HashMap<CartId, Cart>,
    session_failures: HashMap<OrderId, SessionFailures>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionFailures {
    attempts: u32,
    permanent: bool,
}

/// In-memory store implementation for testing and demo mode.
///
/// Provides the same locking semantics as the PostgreSQL implementation: row
/// locks are held by a transaction until it finishes, and writes only become
/// visible to other readers on commit.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    locks: Arc<RowLocks>,
    fail_on_commit: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a product row.
    pub async fn insert_product(&self, product: Product) {
        self.tables
            .write()
            .await
            .products
            .insert(product.id, product);
    }

    /// Inserts or replaces a customer row.
    pub async fn insert_customer(&self, customer: Customer) {
        self.tables
            .write()
            .await
            .customers
            .insert(customer.id, customer);
    }

    /// Returns the total number of committed orders.
    pub async fn order_count(&self) -> usize {
        self.tables.read().await.orders.len()
    }

    /// Makes every subsequent commit fail until switched off again.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    async fn cart_of_item(&self, id: CartItemId) -> Option<CartId> {
        let tables = self.tables.read().await;
        tables
            .carts
            .values()
            .find(|c| c.items.iter().any(|i| i.id == id))
            .map(|c| c.id)
    }
}

/// Transaction over an [`InMemoryStore`].
///
/// Writes are staged locally and applied in one step on commit.
pub struct InMemoryTransaction {
    store: InMemoryStore,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    stock: HashMap<ProductId, u32>,
    new_orders: Vec<Order>,
    order_status: HashMap<OrderId, OrderStatus>,
    cart_status: HashMap<CartId, CartStatus>,
}

impl InMemoryTransaction {
    fn new(store: InMemoryStore) -> Self {
        Self {
            store,
            held: HashMap::new(),
            stock: HashMap::new(),
            new_orders: Vec::new(),
            order_status: HashMap::new(),
            cart_status: HashMap::new(),
        }
    }

    async fn hold(&mut self, key: RowKey) -> Result<()> {
        if !self.held.contains_key(&key) {
            let guard = self.store.locks.acquire(key).await?;
            self.held.insert(key, guard);
        }
        Ok(())
    }

    async fn order_exists(&self, id: OrderId) -> bool {
        self.new_orders.iter().any(|o| o.id == id)
            || self.store.tables.read().await.orders.contains_key(&id)
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>> {
        self.hold(RowKey::Product(id)).await?;

        let tables = self.store.tables.read().await;
        Ok(tables.products.get(&id).cloned().map(|mut product| {
            if let Some(stock) = self.stock.get(&id) {
                product.stock = *stock;
            }
            product
        }))
    }

    async fn set_stock(&mut self, id: ProductId, stock: u32) -> Result<()> {
        self.hold(RowKey::Product(id)).await?;

        if !self.store.tables.read().await.products.contains_key(&id) {
            return Err(StoreError::RowNotFound {
                table: "products",
                id: id.to_string(),
            });
        }
        self.stock.insert(id, stock);
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        if self.order_exists(order.id).await {
            return Err(StoreError::DuplicateKey {
                table: "orders",
                id: order.id.to_string(),
            });
        }
        self.hold(RowKey::Order(order.id)).await?;
        self.new_orders.push(order.clone());
        Ok(())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        self.hold(RowKey::Order(id)).await?;

        let staged = self.new_orders.iter().find(|o| o.id == id).cloned();
        let order = match staged {
            Some(order) => Some(order),
            None => self.store.tables.read().await.orders.get(&id).cloned(),
        };

        Ok(order.map(|mut order| {
            if let Some(status) = self.order_status.get(&id) {
                order.status = *status;
            }
            order
        }))
    }

    async fn set_order_status(&mut self, id: OrderId, status: OrderStatus) -> Result<()> {
        self.hold(RowKey::Order(id)).await?;

        if !self.order_exists(id).await {
            return Err(StoreError::RowNotFound {
                table: "orders",
                id: id.to_string(),
            });
        }
        self.order_status.insert(id, status);
        Ok(())
    }

    async fn lock_cart(&mut self, id: CartId) -> Result<Option<Cart>> {
        self.hold(RowKey::Cart(id)).await?;

        let tables = self.store.tables.read().await;
        Ok(tables.carts.get(&id).cloned().map(|mut cart| {
            if let Some(status) = self.cart_status.get(&id) {
                cart.status = *status;
            }
            cart
        }))
    }

    async fn set_cart_status(&mut self, id: CartId, status: CartStatus) -> Result<()> {
        self.hold(RowKey::Cart(id)).await?;

        if !self.store.tables.read().await.carts.contains_key(&id) {
            return Err(StoreError::RowNotFound {
                table: "carts",
                id: id.to_string(),
            });
        }
        self.cart_status.insert(id, status);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        if self.store.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }

        let now = Utc::now();
        let mut tables = self.store.tables.write().await;

        for (id, stock) in &self.stock {
            if let Some(product) = tables.products.get_mut(id) {
                product.stock = *stock;
            }
        }
        for order in &self.new_orders {
            tables.order_log.push(order.id);
            tables.orders.insert(order.id, order.clone());
        }
        for (id, status) in &self.order_status {
            if let Some(order) = tables.orders.get_mut(id) {
                order.status = *status;
                order.updated_at = now;
            }
        }
        for (id, status) in &self.cart_status {
            if let Some(cart) = tables.carts.get_mut(id) {
                cart.status = *status;
                cart.updated_at = now;
            }
        }
        drop(tables);

        // Row locks are released when `self.held` drops here.
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        tracing::debug!(locked_rows = self.held.len(), "transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction::new(self.clone()))
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.tables.read().await.products.get(&id).cloned())
    }

    async fn get_customer(&self, id: UserId) -> Result<Option<Customer>> {
        Ok(self.tables.read().await.customers.get(&id).cloned())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .order_log
            .iter()
            .rev()
            .filter_map(|id| tables.orders.get(id))
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn orders_missing_session(&self, limit: usize) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut candidates: Vec<(u32, usize, &Order)> = tables
            .order_log
            .iter()
            .enumerate()
            .filter_map(|(position, id)| {
                let order = tables.orders.get(id)?;
                let failures = tables.session_failures.get(id).copied().unwrap_or_default();
                let retryable = order.status == OrderStatus::Pending
                    && order.payment_session.is_none()
                    && !failures.permanent;
                retryable.then_some((failures.attempts, position, order))
            })
            .collect();
        candidates.sort_by_key(|(attempts, position, _)| (*attempts, *position));

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, _, order)| order.clone())
            .collect())
    }

    async fn record_session_failure(&self, id: OrderId, permanent: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.orders.contains_key(&id) {
            return Err(StoreError::RowNotFound {
                table: "orders",
                id: id.to_string(),
            });
        }
        let failures = tables.session_failures.entry(id).or_default();
        failures.attempts = failures.attempts.saturating_add(1);
        failures.permanent |= permanent;
        Ok(())
    }

    async fn attach_payment_session(&self, id: OrderId, session: &PaymentSession) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(&id) {
            Some(order) if order.payment_session.is_none() => {
                order.payment_session = Some(session.clone());
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_cart(&self, user_id: UserId) -> Result<Cart> {
        let mut tables = self.tables.write().await;
        if let Some(cart) = tables
            .carts
            .values()
            .find(|c| c.user_id == user_id && c.status == CartStatus::Active)
        {
            return Ok(cart.clone());
        }

        let cart = Cart::open(user_id);
        tables.carts.insert(cart.id, cart.clone());
        Ok(cart)
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>> {
        Ok(self.tables.read().await.carts.get(&id).cloned())
    }

    async fn add_cart_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<CartItemWrite> {
        let _row = self.locks.acquire(RowKey::Cart(cart_id)).await?;
        let mut tables = self.tables.write().await;

        let Some(cart) = tables.carts.get_mut(&cart_id) else {
            return Ok(CartItemWrite::NotFound);
        };
        if !cart.status.is_open() {
            return Ok(CartItemWrite::CartClosed(cart_id));
        }
        cart.updated_at = Utc::now();

        if let Some(item) = cart.items.iter_mut().find(|i| i.product_id == product_id) {
            item.quantity = item.quantity.saturating_add(quantity);
            return Ok(CartItemWrite::Applied(item.clone()));
        }

        let item = CartItem {
            id: CartItemId::new(),
            cart_id,
            product_id,
            quantity,
        };
        cart.items.push(item.clone());
        Ok(CartItemWrite::Applied(item))
    }

    async fn set_cart_item_quantity(
        &self,
        id: CartItemId,
        quantity: u32,
    ) -> Result<CartItemWrite> {
        let Some(cart_id) = self.cart_of_item(id).await else {
            return Ok(CartItemWrite::NotFound);
        };
        let _row = self.locks.acquire(RowKey::Cart(cart_id)).await?;
        let mut tables = self.tables.write().await;

        let Some(cart) = tables.carts.get_mut(&cart_id) else {
            return Ok(CartItemWrite::NotFound);
        };
        if !cart.status.is_open() {
            return Ok(CartItemWrite::CartClosed(cart_id));
        }
        let Some(item) = cart.items.iter_mut().find(|i| i.id == id) else {
            return Ok(CartItemWrite::NotFound);
        };
        item.quantity = quantity;
        let updated = item.clone();
        cart.updated_at = Utc::now();
        Ok(CartItemWrite::Applied(updated))
    }

    async fn remove_cart_item(&self, id: CartItemId) -> Result<CartItemWrite> {
        let Some(cart_id) = self.cart_of_item(id).await else {
            return Ok(CartItemWrite::NotFound);
        };
        let _row = self.locks.acquire(RowKey::Cart(cart_id)).await?;
        let mut tables = self.tables.write().await;

        let Some(cart) = tables.carts.get_mut(&cart_id) else {
            return Ok(CartItemWrite::NotFound);
        };
        if !cart.status.is_open() {
            return Ok(CartItemWrite::CartClosed(cart_id));
        }
        let Some(index) = cart.items.iter().position(|i| i.id == id) else {
            return Ok(CartItemWrite::NotFound);
        };
        let removed = cart.items.remove(index);
        cart.updated_at = Utc::now();
        Ok(CartItemWrite::Applied(removed))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use common::Money;

    async fn store_with_product(stock: u32) -> (InMemoryStore, Product) {
        let store = InMemoryStore::new();
        let product = Product::new("Widget", Money::from_cents(1000), stock);
        store.insert_product(product.clone()).await;
        (store, product)
    }

    fn test_order(user_id: UserId) -> Order {
        let now = Utc::now();
        Order {
            id: OrderId::new(),
            user_id,
            items: vec![],
            total: Money::zero(),
            payment_method: "bank_transfer".to_string(),
            paid_amount: Money::zero(),
            status: OrderStatus::Pending,
            payment_session: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn uncommitted_stock_is_invisible_to_other_readers() {
        let (store, product) = store_with_product(10).await;

        let mut tx = store.begin().await.unwrap();
        tx.set_stock(product.id, 4).await.unwrap();

        // The transaction reads its own write.
        let locked = tx.lock_product(product.id).await.unwrap().unwrap();
        assert_eq!(locked.stock, 4);

        // Everyone else still sees the committed value.
        let outside = store.get_product(product.id).await.unwrap().unwrap();
        assert_eq!(outside.stock, 10);

        tx.commit().await.unwrap();
        let after = store.get_product(product.id).await.unwrap().unwrap();
        assert_eq!(after.stock, 4);
    }

    #[tokio::test]
    async fn dropping_a_transaction_rolls_it_back() {
        let (store, product) = store_with_product(10).await;

        {
            let mut tx = store.begin().await.unwrap();
            tx.set_stock(product.id, 0).await.unwrap();
            tx.insert_order(&test_order(UserId::new())).await.unwrap();
        }

        assert_eq!(store.get_product(product.id).await.unwrap().unwrap().stock, 10);
        assert_eq!(store.order_count().await, 0);

        // The row lock was released with the transaction.
        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_product(product.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn row_lock_blocks_until_holder_commits() {
        let (store, product) = store_with_product(10).await;

        let mut first = store.begin().await.unwrap();
        first.lock_product(product.id).await.unwrap();
        first.set_stock(product.id, 3).await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut second = store.begin().await.unwrap();
                second.lock_product(product.id).await.unwrap().unwrap().stock
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        first.commit().await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn failed_commit_discards_writes() {
        let (store, product) = store_with_product(10).await;
        store.set_fail_on_commit(true);

        let mut tx = store.begin().await.unwrap();
        tx.set_stock(product.id, 1).await.unwrap();
        assert!(matches!(
            tx.commit().await,
            Err(StoreError::Unavailable(_))
        ));

        assert_eq!(store.get_product(product.id).await.unwrap().unwrap().stock, 10);
    }

    #[tokio::test]
    async fn set_stock_on_missing_product_fails() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let result = tx.set_stock(ProductId::new(), 1).await;
        assert!(matches!(result, Err(StoreError::RowNotFound { .. })));
    }

    #[tokio::test]
    async fn duplicate_order_id_is_rejected() {
        let store = InMemoryStore::new();
        let order = test_order(UserId::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.insert_order(&order).await,
            Err(StoreError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn status_change_on_order_inserted_in_same_transaction() {
        let store = InMemoryStore::new();
        let order = test_order(UserId::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.set_order_status(order.id, OrderStatus::Paid).await.unwrap();
        let locked = tx.lock_order(order.id).await.unwrap().unwrap();
        assert_eq!(locked.status, OrderStatus::Paid);
        tx.commit().await.unwrap();

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn orders_for_user_are_most_recent_first() {
        let store = InMemoryStore::new();
        let user = UserId::new();
        let first = test_order(user);
        let second = test_order(user);

        for order in [&first, &second, &test_order(UserId::new())] {
            let mut tx = store.begin().await.unwrap();
            tx.insert_order(order).await.unwrap();
            tx.commit().await.unwrap();
        }

        let ids: Vec<_> = store
            .orders_for_user(user)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn payment_session_is_attached_once() {
        let store = InMemoryStore::new();
        let order = test_order(UserId::new());
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.orders_missing_session(10).await.unwrap().len(), 1);

        let session = PaymentSession {
            token: "tok-1".to_string(),
            redirect_url: "https://pay.example/tok-1".to_string(),
        };
        assert!(store.attach_payment_session(order.id, &session).await.unwrap());
        assert!(!store.attach_payment_session(order.id, &session).await.unwrap());
        assert!(store.orders_missing_session(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_session_attempts_go_to_the_back_of_the_sweep() {
        let store = InMemoryStore::new();
        let user = UserId::new();
        let (first, second, third) = (test_order(user), test_order(user), test_order(user));
        for order in [&first, &second, &third] {
            let mut tx = store.begin().await.unwrap();
            tx.insert_order(order).await.unwrap();
            tx.commit().await.unwrap();
        }

        store.record_session_failure(first.id, true).await.unwrap();
        store.record_session_failure(second.id, false).await.unwrap();

        let ids: Vec<_> = store
            .orders_missing_session(10)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec![third.id, second.id]);

        assert!(matches!(
            store.record_session_failure(OrderId::new(), false).await,
            Err(StoreError::RowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn one_active_cart_per_user() {
        let store = InMemoryStore::new();
        let user = UserId::new();

        let cart = store.active_cart(user).await.unwrap();
        assert_eq!(store.active_cart(user).await.unwrap().id, cart.id);

        let mut tx = store.begin().await.unwrap();
        tx.set_cart_status(cart.id, CartStatus::CheckedOut)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let next = store.active_cart(user).await.unwrap();
        assert_ne!(next.id, cart.id);
        assert_eq!(next.status, CartStatus::Active);
    }

    #[tokio::test]
    async fn add_cart_item_merges_lines_for_same_product() {
        let store = InMemoryStore::new();
        let cart = store.active_cart(UserId::new()).await.unwrap();
        let product_id = ProductId::new();

        store.add_cart_item(cart.id, product_id, 2).await.unwrap();
        let merged = store.add_cart_item(cart.id, product_id, 3).await.unwrap();

        let CartItemWrite::Applied(item) = merged else {
            panic!("expected applied write, got {merged:?}");
        };
        assert_eq!(item.quantity, 5);
        assert_eq!(store.get_cart(cart.id).await.unwrap().unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn closed_cart_rejects_line_changes() {
        let store = InMemoryStore::new();
        let cart = store.active_cart(UserId::new()).await.unwrap();
        let CartItemWrite::Applied(item) = store
            .add_cart_item(cart.id, ProductId::new(), 1)
            .await
            .unwrap()
        else {
            panic!("expected applied write");
        };

        let mut tx = store.begin().await.unwrap();
        tx.set_cart_status(cart.id, CartStatus::CheckedOut)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.set_cart_item_quantity(item.id, 9).await.unwrap(),
            CartItemWrite::CartClosed(cart.id)
        );
        assert_eq!(
            store.remove_cart_item(item.id).await.unwrap(),
            CartItemWrite::CartClosed(cart.id)
        );
        assert_eq!(
            store.add_cart_item(cart.id, ProductId::new(), 1).await.unwrap(),
            CartItemWrite::CartClosed(cart.id)
        );
    }

    #[tokio::test]
    async fn unknown_cart_item_is_not_found() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.remove_cart_item(CartItemId::new()).await.unwrap(),
            CartItemWrite::NotFound
        );
    }
}
