//! Demo catalog for running without a database.

use common::Money;
use store::{Customer, InMemoryStore, Product};

/// What [`demo`] put into the store.
#[derive(Debug, Clone)]
pub struct DemoCatalog {
    pub customers: Vec<Customer>,
    pub products: Vec<Product>,
}

/// Seeds two customers and three products.
pub async fn demo(store: &InMemoryStore) -> DemoCatalog {
    let customers = vec![
        Customer::new("Admin", "admin@example.com", "-"),
        Customer::new("Demo User", "user@example.com", "08123456789"),
    ];
    let products = vec![
        Product::new("Kemeja Lengan Panjang", Money::from_units(150_000), 20),
        Product::new("Celana Jeans Slim Fit", Money::from_units(200_000), 15),
        Product::new("Sepatu Sneakers", Money::from_units(300_000), 10),
    ];

    for customer in &customers {
        store.insert_customer(customer.clone()).await;
        tracing::info!(user_id = %customer.id, email = %customer.email, "seeded customer");
    }
    for product in &products {
        store.insert_product(product.clone()).await;
        tracing::info!(
            product_id = %product.id,
            name = %product.name,
            stock = product.stock,
            "seeded product"
        );
    }

    DemoCatalog {
        customers,
        products,
    }
}
