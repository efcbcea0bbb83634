use std::collections::HashMap;

use async_trait::async_trait;
use common::{
    CartId, CartItemId, CartStatus, Money, OrderId, OrderItemId, OrderStatus, ProductId, UserId,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use uuid::Uuid;

use crate::{
    Cart, CartItem, Customer, Order, OrderItem, PaymentSession, Product, Result, StoreError,
    store::{CartItemWrite, Store, Transaction},
};

const ORDER_COLUMNS: &str = "id, user_id, total_cents, payment_method, paid_amount_cents, status, \
     session_token, session_redirect_url, created_at, updated_at";

/// Attempts at finding or creating an active cart before giving up.
const ACTIVE_CART_ATTEMPTS: usize = 3;

/// PostgreSQL-backed store implementation.
///
/// Row locks are PostgreSQL row locks (`SELECT ... FOR UPDATE`), so they hold
/// across every process sharing the database.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of at most `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or replaces a product row.
    pub async fn insert_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, price_cents, stock)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, price_cents = EXCLUDED.price_cents, stock = EXCLUDED.stock
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.name)
        .bind(product.price.cents())
        .bind(to_db_count("products", product.stock)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts or replaces a customer row.
    pub async fn insert_customer(&self, customer: &Customer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, full_name, email, phone)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name, email = EXCLUDED.email, phone = EXCLUDED.phone
            "#,
        )
        .bind(customer.id.as_uuid())
        .bind(&customer.full_name)
        .bind(&customer.email)
        .bind(&customer.phone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_active_cart(&self, user_id: UserId) -> Result<Option<Cart>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT id, user_id, status, created_at, updated_at FROM carts \
             WHERE user_id = $1 AND status = 'active'",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Some(load_cart(&mut conn, &row).await?)),
            None => Ok(None),
        }
    }
}

/// Transaction over a [`PostgresStore`].
///
/// Dropping it without committing rolls back, as with [`sqlx::Transaction`].
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(
            "SELECT id, name, price_cents, stock FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(product_from_row).transpose()
    }

    async fn set_stock(&mut self, id: ProductId, stock: u32) -> Result<()> {
        let result = sqlx::query("UPDATE products SET stock = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(to_db_count("products", stock)?)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: "products",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        let (token, redirect_url) = match &order.payment_session {
            Some(session) => (Some(&session.token), Some(&session.redirect_url)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, total_cents, payment_method, paid_amount_cents, status,
                                session_token, session_redirect_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(order.total.cents())
        .bind(&order.payment_method)
        .bind(order.paid_amount.cents())
        .bind(order.status.as_str())
        .bind(token)
        .bind(redirect_url)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("orders_pkey")
            {
                return StoreError::DuplicateKey {
                    table: "orders",
                    id: order.id.to_string(),
                };
            }
            StoreError::Database(e)
        })?;

        for (position, item) in order.items.iter().enumerate() {
            let position = i32::try_from(position).map_err(|e| StoreError::corrupt("order_items", e))?;
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, position, product_id, product_name, quantity,
                                         unit_price_cents, subtotal_cents)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(order.id.as_uuid())
            .bind(position)
            .bind(item.product_id.as_uuid())
            .bind(&item.product_name)
            .bind(to_db_count("order_items", item.quantity)?)
            .bind(item.unit_price.cents())
            .bind(item.subtotal.cents())
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut orders = attach_items(&mut self.tx, vec![row]).await?;
        Ok(orders.pop())
    }

    async fn set_order_status(&mut self, id: OrderId, status: OrderStatus) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: "orders",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn lock_cart(&mut self, id: CartId) -> Result<Option<Cart>> {
        let row = sqlx::query(
            "SELECT id, user_id, status, created_at, updated_at FROM carts WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(Some(load_cart(&mut self.tx, &row).await?)),
            None => Ok(None),
        }
    }

    async fn set_cart_status(&mut self, id: CartId, status: CartStatus) -> Result<()> {
        let result = sqlx::query("UPDATE carts SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: "carts",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        Ok(PostgresTransaction {
            tx: self.pool.begin().await?,
        })
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query("SELECT id, name, price_cents, stock FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(product_from_row).transpose()
    }

    async fn get_customer(&self, id: UserId) -> Result<Option<Customer>> {
        let row = sqlx::query("SELECT id, full_name, email, phone FROM users WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Customer {
                id: UserId::from_uuid(row.try_get("id")?),
                full_name: row.try_get("full_name")?,
                email: row.try_get("email")?,
                phone: row.try_get("phone")?,
            })
        })
        .transpose()
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut orders = attach_items(&mut conn, vec![row]).await?;
        Ok(orders.pop())
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?;

        attach_items(&mut conn, rows).await
    }

    async fn orders_missing_session(&self, limit: usize) -> Result<Vec<Order>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = 'pending' AND session_token IS NULL \
               AND session_rejected_at IS NULL \
             ORDER BY session_attempts ASC, created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        attach_items(&mut conn, rows).await
    }

    async fn record_session_failure(&self, id: OrderId, permanent: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET session_attempts = session_attempts + 1,
                session_rejected_at = CASE
                    WHEN $2 THEN COALESCE(session_rejected_at, NOW())
                    ELSE session_rejected_at
                END
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(permanent)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: "orders",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn attach_payment_session(&self, id: OrderId, session: &PaymentSession) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET session_token = $2, session_redirect_url = $3, updated_at = NOW()
            WHERE id = $1 AND session_token IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(&session.token)
        .bind(&session.redirect_url)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn active_cart(&self, user_id: UserId) -> Result<Cart> {
        for _ in 0..ACTIVE_CART_ATTEMPTS {
            if let Some(cart) = self.find_active_cart(user_id).await? {
                return Ok(cart);
            }

            // Losing the race against a concurrent creator is fine; the next
            // lookup finds the winner's cart.
            let fresh = Cart::open(user_id);
            sqlx::query(
                r#"
                INSERT INTO carts (id, user_id, status, created_at, updated_at)
                VALUES ($1, $2, 'active', $3, $4)
                ON CONFLICT (user_id) WHERE status = 'active' DO NOTHING
                "#,
            )
            .bind(fresh.id.as_uuid())
            .bind(user_id.as_uuid())
            .bind(fresh.created_at)
            .bind(fresh.updated_at)
            .execute(&self.pool)
            .await?;
        }

        Err(StoreError::Unavailable(format!(
            "could not settle an active cart for user {user_id}"
        )))
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT id, user_id, status, created_at, updated_at FROM carts WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Some(load_cart(&mut conn, &row).await?)),
            None => Ok(None),
        }
    }

    async fn add_cart_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<CartItemWrite> {
        let mut tx = self.pool.begin().await?;
        match lock_cart_status(&mut tx, cart_id).await? {
            None => return Ok(CartItemWrite::NotFound),
            Some(status) if !status.is_open() => return Ok(CartItemWrite::CartClosed(cart_id)),
            Some(_) => {}
        }

        let row = sqlx::query(
            r#"
            INSERT INTO cart_items (id, cart_id, product_id, quantity)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cart_id, product_id) DO UPDATE
            SET quantity = cart_items.quantity + EXCLUDED.quantity
            RETURNING id, cart_id, product_id, quantity
            "#,
        )
        .bind(CartItemId::new().as_uuid())
        .bind(cart_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(to_db_count("cart_items", quantity)?)
        .fetch_one(&mut *tx)
        .await?;
        let item = cart_item_from_row(&row)?;

        touch_cart(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(CartItemWrite::Applied(item))
    }

    async fn set_cart_item_quantity(
        &self,
        id: CartItemId,
        quantity: u32,
    ) -> Result<CartItemWrite> {
        let mut tx = self.pool.begin().await?;
        let Some(cart_id) = cart_of_item(&mut tx, id).await? else {
            return Ok(CartItemWrite::NotFound);
        };
        match lock_cart_status(&mut tx, cart_id).await? {
            None => return Ok(CartItemWrite::NotFound),
            Some(status) if !status.is_open() => return Ok(CartItemWrite::CartClosed(cart_id)),
            Some(_) => {}
        }

        let row = sqlx::query(
            "UPDATE cart_items SET quantity = $2 WHERE id = $1 \
             RETURNING id, cart_id, product_id, quantity",
        )
        .bind(id.as_uuid())
        .bind(to_db_count("cart_items", quantity)?)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(CartItemWrite::NotFound);
        };
        let item = cart_item_from_row(&row)?;

        touch_cart(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(CartItemWrite::Applied(item))
    }

    async fn remove_cart_item(&self, id: CartItemId) -> Result<CartItemWrite> {
        let mut tx = self.pool.begin().await?;
        let Some(cart_id) = cart_of_item(&mut tx, id).await? else {
            return Ok(CartItemWrite::NotFound);
        };
        match lock_cart_status(&mut tx, cart_id).await? {
            None => return Ok(CartItemWrite::NotFound),
            Some(status) if !status.is_open() => return Ok(CartItemWrite::CartClosed(cart_id)),
            Some(_) => {}
        }

        let row = sqlx::query(
            "DELETE FROM cart_items WHERE id = $1 RETURNING id, cart_id, product_id, quantity",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(CartItemWrite::NotFound);
        };
        let item = cart_item_from_row(&row)?;

        touch_cart(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(CartItemWrite::Applied(item))
    }
}

/// Locks a cart row and returns its status.
async fn lock_cart_status(conn: &mut PgConnection, id: CartId) -> Result<Option<CartStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM carts WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;

    status
        .map(|s| s.parse().map_err(|e| StoreError::corrupt("carts", e)))
        .transpose()
}

async fn cart_of_item(conn: &mut PgConnection, id: CartItemId) -> Result<Option<CartId>> {
    let cart_id: Option<Uuid> = sqlx::query_scalar("SELECT cart_id FROM cart_items WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(cart_id.map(CartId::from_uuid))
}

async fn touch_cart(conn: &mut PgConnection, id: CartId) -> Result<()> {
    sqlx::query("UPDATE carts SET updated_at = NOW() WHERE id = $1")
        .bind(id.as_uuid())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_cart(conn: &mut PgConnection, row: &PgRow) -> Result<Cart> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;

    let items = sqlx::query(
        "SELECT id, cart_id, product_id, quantity FROM cart_items \
         WHERE cart_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(cart_item_from_row)
    .collect::<Result<Vec<_>>>()?;

    Ok(Cart {
        id: CartId::from_uuid(id),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        status: status.parse().map_err(|e| StoreError::corrupt("carts", e))?,
        items,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Builds orders from header rows, fetching every item in one query.
/// Preserves the order of `rows`.
async fn attach_items(conn: &mut PgConnection, rows: Vec<PgRow>) -> Result<Vec<Order>> {
    let mut orders = rows
        .iter()
        .map(order_from_row)
        .collect::<Result<Vec<_>>>()?;
    if orders.is_empty() {
        return Ok(orders);
    }

    let ids: Vec<Uuid> = orders.iter().map(|o| o.id.as_uuid()).collect();
    let item_rows = sqlx::query(
        r#"
        SELECT id, order_id, product_id, product_name, quantity, unit_price_cents, subtotal_cents
        FROM order_items
        WHERE order_id = ANY($1)
        ORDER BY order_id, position ASC
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut items: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
    for row in &item_rows {
        let quantity: i32 = row.try_get("quantity")?;
        items
            .entry(row.try_get("order_id")?)
            .or_default()
            .push(OrderItem {
                id: OrderItemId::from_uuid(row.try_get("id")?),
                product_id: ProductId::from_uuid(row.try_get("product_id")?),
                product_name: row.try_get("product_name")?,
                quantity: from_db_count("order_items", quantity)?,
                unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
                subtotal: Money::from_cents(row.try_get("subtotal_cents")?),
            });
    }

    for order in &mut orders {
        order.items = items.remove(&order.id.as_uuid()).unwrap_or_default();
    }
    Ok(orders)
}

/// Maps an order header row. Items are filled in by [`attach_items`].
fn order_from_row(row: &PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    let token: Option<String> = row.try_get("session_token")?;
    let redirect_url: Option<String> = row.try_get("session_redirect_url")?;

    Ok(Order {
        id: OrderId::from_uuid(row.try_get("id")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        items: Vec::new(),
        total: Money::from_cents(row.try_get("total_cents")?),
        payment_method: row.try_get("payment_method")?,
        paid_amount: Money::from_cents(row.try_get("paid_amount_cents")?),
        status: status.parse().map_err(|e| StoreError::corrupt("orders", e))?,
        payment_session: token
            .zip(redirect_url)
            .map(|(token, redirect_url)| PaymentSession {
                token,
                redirect_url,
            }),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product> {
    let stock: i32 = row.try_get("stock")?;
    Ok(Product {
        id: ProductId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        price: Money::from_cents(row.try_get("price_cents")?),
        stock: from_db_count("products", stock)?,
    })
}

fn cart_item_from_row(row: &PgRow) -> Result<CartItem> {
    let quantity: i32 = row.try_get("quantity")?;
    Ok(CartItem {
        id: CartItemId::from_uuid(row.try_get("id")?),
        cart_id: CartId::from_uuid(row.try_get("cart_id")?),
        product_id: ProductId::from_uuid(row.try_get("product_id")?),
        quantity: from_db_count("cart_items", quantity)?,
    })
}

fn to_db_count(table: &'static str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|e| StoreError::corrupt(table, e))
}

fn from_db_count(table: &'static str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|e| StoreError::corrupt(table, e))
}
