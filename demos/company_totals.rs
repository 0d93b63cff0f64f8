/// Company order totals demo
///
/// Seeds 10 companies and a random set of orders per company, registers the
/// CompanyOrderTotal map-reduce index and prints the three companies with the
/// highest order total once the index has caught up.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tallydb::model::orders::{
    company_schema, order_schema, Address, Company, CompanyOrderTotalIndex, CompanyOrdersTotal, Order, OrderLine,
};
use tallydb::{Database, Decimal, IndexQuery};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::in_memory();
    db.register_schema(company_schema());
    db.register_schema(order_schema());

    generate_test_data(&db)?;

    db.register_index(CompanyOrderTotalIndex)?;

    let query = IndexQuery::new(CompanyOrderTotalIndex::NAME)
        .order_by_descending("Total")
        .take(3)
        .include("CompanyId")
        .wait_for_non_stale_results();

    let results = db.query(&query)?;
    for row in &results.rows {
        let total = CompanyOrdersTotal::from_row(row)?;
        let company: Company = results.included(&total.company_id)?;
        println!("CompanyId : {}, Total: {}", company.id, total.total);
    }

    Ok(())
}

fn generate_test_data(db: &Database) -> tallydb::Result<()> {
    let companies: Vec<Company> = (1..=10)
        .map(|n| Company {
            id: format!("company/{}", n),
            address: Address {
                street: format!("Street{}", n),
                city: format!("City{}", n),
                zip_code: format!("ZipCode{}", n),
                country: format!("Country{}", n),
            },
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(234);
    let mut orders = Vec::new();
    let mut next_order = 1;
    for company in &companies {
        // Every order of a company shares the same lines.
        let lines: Vec<OrderLine> = (0..rng.gen_range(1..15))
            .map(|_| OrderLine {
                quantity: rng.gen_range(1..25),
                price_per_unit: Decimal::from(rng.gen_range(10..100)),
                discount: Decimal::from(rng.gen_range(5..50)),
            })
            .collect();

        for _ in 0..rng.gen_range(1..20) {
            orders.push(Order {
                id: format!("order/{}", next_order),
                company: company.id.clone(),
                lines: lines.clone(),
            });
            next_order += 1;
        }
    }

    for company in &companies {
        db.put_entity(company)?;
    }
    for order in &orders {
        db.put_entity(order)?;
    }
    Ok(())
}
