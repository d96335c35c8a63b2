//! Demo data for a fresh install.
//!
//! Everything goes through the same validated inserts as real data, inside
//! one transaction.

use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::cash_boxes;
use crate::clients::{self, ClientInput};
use crate::db::{self, DbState};
use crate::error::PosResult;
use crate::inventory::{self, MovementInput, MovementType, ProductInput};
use crate::tables::{self, TableInput};

/// (sku, name, category, unit, cost, price, tax, min stock, opening stock)
const DEMO_PRODUCTS: &[(&str, &str, &str, &str, f64, f64, f64, f64, f64)] = &[
    ("ESP", "Espresso", "drinks", "cup", 0.30, 1.50, 10.0, 50.0, 200.0),
    ("CAFL", "Cafe con leche", "drinks", "cup", 0.45, 1.90, 10.0, 50.0, 200.0),
    ("AGUA", "Mineral water", "drinks", "bottle", 0.25, 2.00, 10.0, 24.0, 48.0),
    ("CERV", "Draft beer", "drinks", "glass", 0.60, 3.00, 10.0, 40.0, 120.0),
    ("VINT", "House red wine", "drinks", "glass", 0.90, 3.50, 10.0, 20.0, 60.0),
    ("BRAV", "Patatas bravas", "starters", "portion", 1.10, 5.50, 10.0, 10.0, 30.0),
    ("CROQ", "Ham croquettes", "starters", "portion", 1.60, 7.00, 10.0, 10.0, 25.0),
    ("ENSA", "Mixed salad", "starters", "portion", 1.40, 6.50, 10.0, 8.0, 20.0),
    ("PAEL", "Seafood paella", "mains", "portion", 4.80, 15.50, 10.0, 6.0, 15.0),
    ("SECR", "Iberian pork secreto", "mains", "portion", 5.20, 17.00, 10.0, 6.0, 12.0),
    ("MERL", "Grilled hake", "mains", "portion", 4.50, 16.00, 10.0, 6.0, 4.0),
    ("TART", "Cheesecake", "desserts", "slice", 1.20, 5.00, 10.0, 8.0, 16.0),
];

/// (number, area, capacity)
const DEMO_TABLES: &[(&str, &str, i64)] = &[
    ("1", "main", 2),
    ("2", "main", 4),
    ("3", "main", 4),
    ("4", "main", 6),
    ("5", "main", 2),
    ("6", "main", 8),
    ("T1", "terrace", 2),
    ("T2", "terrace", 4),
    ("T3", "terrace", 4),
    ("T4", "terrace", 6),
];

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub seeded: bool,
    pub products: usize,
    pub tables: usize,
    pub clients: usize,
    pub cash_boxes: usize,
}

fn has_products(conn: &Connection) -> PosResult<bool> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
    Ok(n > 0)
}

/// Insert demo data when the store has no products yet. All or nothing.
pub fn seed_demo_data(db: &DbState) -> PosResult<SeedReport> {
    let conn = db.conn.lock()?;
    if has_products(&conn)? {
        info!("Store already has products, skipping demo data");
        return Ok(SeedReport::default());
    }

    db::transaction(&conn, || {
        let warehouse_id =
            inventory::insert_warehouse(&conn, "Main store", Some("Back kitchen"), true)?;

        for &(sku, name, category, unit, cost, price, tax, min_stock, opening) in DEMO_PRODUCTS {
            let product_id = inventory::insert_product(
                &conn,
                &ProductInput {
                    sku: sku.into(),
                    name: name.into(),
                    category: Some(category.into()),
                    unit: Some(unit.into()),
                    unit_cost: cost,
                    sale_price: price,
                    tax_rate: Some(tax),
                    min_stock,
                },
            )?;
            inventory::record_movement_tx(
                &conn,
                &MovementInput {
                    product_id,
                    movement_type: Some(MovementType::In),
                    quantity: opening,
                    to_warehouse_id: Some(warehouse_id.clone()),
                    reason: Some("Opening stock".into()),
                    ..Default::default()
                },
            )?;
        }

        for &(number, area, capacity) in DEMO_TABLES {
            tables::insert_table(
                &conn,
                &TableInput {
                    number: number.into(),
                    area: Some(area.into()),
                    capacity: Some(capacity),
                },
            )?;
        }

        cash_boxes::insert_cash_box(&conn, "Main till", Some("Bar counter"))?;

        for client in demo_clients() {
            clients::insert_client(&conn, &client)?;
        }
        Ok(())
    })?;

    let report = SeedReport {
        seeded: true,
        products: DEMO_PRODUCTS.len(),
        tables: DEMO_TABLES.len(),
        clients: demo_clients().len(),
        cash_boxes: 1,
    };
    info!(
        products = report.products,
        tables = report.tables,
        clients = report.clients,
        "Demo data seeded"
    );
    Ok(report)
}

fn demo_clients() -> [ClientInput; 2] {
    [
        ClientInput {
            name: "Lucia Fernandez".into(),
            email: Some("lucia.fernandez@example.com".into()),
            phone: Some("+34 612 345 678".into()),
            ..Default::default()
        },
        ClientInput {
            name: "Eventos Mediterraneo S.L.".into(),
            tax_id: Some("B12345674".into()),
            email: Some("facturas@eventos-med.example".into()),
            phone: Some("+34 961 234 567".into()),
            address: Some("Calle de la Paz 12, Valencia".into()),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ProductFilter;

    #[test]
    fn seeds_once() {
        let db = db::test_state();
        let first = seed_demo_data(&db).unwrap();
        assert!(first.seeded);
        assert_eq!(first.products, DEMO_PRODUCTS.len());

        let second = seed_demo_data(&db).unwrap();
        assert!(!second.seeded);

        let all_tables = tables::list_tables(&db, None).unwrap();
        assert_eq!(all_tables.len(), DEMO_TABLES.len());
        assert_eq!(tables::list_tables(&db, Some("terrace")).unwrap().len(), 4);
        assert_eq!(cash_boxes::list_cash_boxes(&db).unwrap().len(), 1);
    }

    #[test]
    fn demo_stock_includes_a_low_stock_item() {
        let db = db::test_state();
        seed_demo_data(&db).unwrap();
        let alerts = inventory::low_stock_alerts(&db).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].sku, "MERL");
    }

    #[test]
    fn failed_seed_leaves_nothing_behind() {
        let db = db::test_state();
        tables::create_table(
            &db,
            &TableInput {
                number: "1".into(),
                ..Default::default()
            },
        )
        .unwrap();

        let err = seed_demo_data(&db).unwrap_err();
        assert_eq!(err.code(), "conflict");

        let all_products = ProductFilter {
            include_inactive: true,
            ..Default::default()
        };
        assert!(inventory::list_products(&db, &all_products).unwrap().is_empty());
        assert!(inventory::list_warehouses(&db).unwrap().is_empty());
        assert_eq!(tables::list_tables(&db, None).unwrap().len(), 1);
    }
}
