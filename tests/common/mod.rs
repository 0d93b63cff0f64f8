#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;
use tallydb::model::orders::{company_schema, order_schema, Address, Company, CompanyOrdersTotal, Order, OrderLine};
use tallydb::{Database, Decimal, IndexQuery, QueryResults};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn database_with_schemas() -> Database {
    let db = Database::in_memory();
    db.register_schema(company_schema());
    db.register_schema(order_schema());
    db
}

pub fn company(n: usize) -> Company {
    Company {
        id: format!("company/{}", n),
        address: Address {
            street: format!("{} Main St", n),
            city: "Springfield".to_string(),
            zip_code: format!("{:05}", n),
            country: "US".to_string(),
        },
    }
}

pub fn line(quantity: i64, price: i32, discount: i32) -> OrderLine {
    OrderLine {
        quantity,
        price_per_unit: Decimal::from(price),
        discount: Decimal::from(discount),
    }
}

pub fn order(id: &str, company: &str, lines: Vec<OrderLine>) -> Order {
    Order {
        id: id.to_string(),
        company: company.to_string(),
        lines,
    }
}

/// Totals per company computed directly from the orders, without the index.
pub fn expected_totals<'a>(orders: impl IntoIterator<Item = &'a Order>) -> BTreeMap<String, Decimal> {
    let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
    for order in orders {
        for line in &order.lines {
            let entry = totals.entry(order.company.clone()).or_insert(Decimal::ZERO);
            *entry = entry.checked_add(line.total().unwrap()).unwrap();
        }
    }
    totals
}

pub fn totals(results: &QueryResults) -> BTreeMap<String, Decimal> {
    results
        .rows
        .iter()
        .map(|row| {
            let typed = CompanyOrdersTotal::from_row(row).unwrap();
            (typed.company_id, typed.total)
        })
        .collect()
}

pub fn query_all(db: &Database, index: &str) -> QueryResults {
    db.query(&IndexQuery::new(index).wait_for_non_stale_results_within(WAIT)).unwrap()
}
