//! Product catalog persistence

use crate::models::Product;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use taxloop_common::Result;

pub async fn upsert_all(pool: &SqlitePool, store_id: &str, products: &[Product]) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    for product in products {
        sqlx::query(
            r#"
            INSERT INTO products (store_id, sku, title, description, brand, attributes, label, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(store_id, sku) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                brand = excluded.brand,
                attributes = excluded.attributes,
                label = COALESCE(excluded.label, products.label),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(store_id)
        .bind(&product.sku)
        .bind(&product.title)
        .bind(&product.description)
        .bind(&product.brand)
        .bind(serde_json::to_string(&product.attributes)?)
        .bind(&product.label)
        .bind(&now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Product> {
    let attributes_raw: String = row.get("attributes");
    let attributes: HashMap<String, String> = serde_json::from_str(&attributes_raw)?;
    Ok(Product {
        sku: row.get("sku"),
        title: row.get("title"),
        description: row.get("description"),
        brand: row.get("brand"),
        attributes,
        label: row.get("label"),
    })
}

/// All products for one store, ordered by SKU for stable iteration.
pub async fn list_for_store(pool: &SqlitePool, store_id: &str) -> Result<Vec<Product>> {
    let rows = sqlx::query("SELECT * FROM products WHERE store_id = ? ORDER BY sku ASC")
        .bind(store_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Labeled products only (benchmark candidates).
pub async fn list_labeled(pool: &SqlitePool, store_id: &str) -> Result<Vec<Product>> {
    let rows = sqlx::query(
        "SELECT * FROM products WHERE store_id = ? AND label IS NOT NULL ORDER BY sku ASC",
    )
    .bind(store_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn get_many(
    pool: &SqlitePool,
    store_id: &str,
    skus: &[String],
) -> Result<Vec<Product>> {
    let mut products = Vec::with_capacity(skus.len());
    for sku in skus {
        let row = sqlx::query("SELECT * FROM products WHERE store_id = ? AND sku = ?")
            .bind(store_id)
            .bind(sku)
            .fetch_optional(pool)
            .await?;
        if let Some(row) = row {
            products.push(from_row(&row)?);
        }
    }
    Ok(products)
}
