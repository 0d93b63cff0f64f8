use serde::{Deserialize, Serialize};
use crate::core::decimal::Decimal;
use crate::core::error::{Error, Result};
use crate::core::types::{Document, Entity, FieldValue, Row};
use crate::index::definition::{MapReduceDefinition, MappedRow};
use crate::index::table::ReducedRow;
use crate::schema::schema::{CollectionSchema, FieldDefinition, FieldType};

pub const COMPANIES: &str = "Companies";
pub const ORDERS: &str = "Orders";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Address {
    pub street: String,
    pub city: String,
    pub zip_code: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Company {
    pub id: String,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderLine {
    pub quantity: i64,
    pub price_per_unit: Decimal,
    pub discount: Decimal,
}

impl OrderLine {
    /// `quantity × (price_per_unit − discount)`, checked.
    pub fn total(&self) -> Result<Decimal> {
        self.price_per_unit.checked_sub(self.discount)?.checked_mul_int(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Order {
    pub id: String,
    pub company: String,   // Company id
    pub lines: Vec<OrderLine>,
}

impl Entity for Company {
    const COLLECTION: &'static str = COMPANIES;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Order {
    const COLLECTION: &'static str = ORDERS;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<()> {
        if self.company.is_empty() {
            return Err(Error::validation(format!("order '{}' has no company", self.id)));
        }
        for (i, line) in self.lines.iter().enumerate() {
            if line.quantity < 0 {
                return Err(Error::validation(format!(
                    "order '{}' line {} has negative quantity {}",
                    self.id, i, line.quantity
                )));
            }
        }
        Ok(())
    }
}

pub fn company_schema() -> CollectionSchema {
    CollectionSchema::new(COMPANIES)
        .field(FieldDefinition::required("Id", FieldType::Text))
        .field(FieldDefinition::optional("Address", FieldType::Object))
}

pub fn order_schema() -> CollectionSchema {
    CollectionSchema::new(ORDERS)
        .field(FieldDefinition::required("Id", FieldType::Text))
        .field(FieldDefinition::required("Company", FieldType::Text))
        .field(FieldDefinition::required("Lines", FieldType::Array))
        .field(FieldDefinition::required("Lines[].Quantity", FieldType::Integer).with_min(Decimal::ZERO))
        .field(FieldDefinition::required("Lines[].PricePerUnit", FieldType::Decimal))
        .field(FieldDefinition::required("Lines[].Discount", FieldType::Decimal))
}

/// Total order value per company.
///
/// Map emits one `{ CompanyId, Total }` row per order line, grouped by the
/// order's company; reduce sums `Total`.
pub struct CompanyOrderTotalIndex;

impl CompanyOrderTotalIndex {
    pub const NAME: &'static str = "CompanyOrderTotal";
}

fn total_row(company_id: &str, total: Decimal) -> Row {
    let mut row = Row::new();
    row.insert("CompanyId".to_string(), FieldValue::Text(company_id.to_string()));
    row.insert("Total".to_string(), FieldValue::Decimal(total));
    row
}

impl MapReduceDefinition for CompanyOrderTotalIndex {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn map(&self, doc: &Document) -> Result<Vec<MappedRow>> {
        if !doc.is_in(ORDERS) {
            return Ok(Vec::new());
        }
        let order: Order = doc.to_entity()?;
        order
            .lines
            .iter()
            .map(|line| Ok(MappedRow::new(order.company.clone(), total_row(&order.company, line.total()?))))
            .collect()
    }

    fn reduce(&self, key: &str, values: &[Row]) -> Result<Row> {
        let totals = values
            .iter()
            .map(|row| {
                row.get("Total")
                    .and_then(FieldValue::as_decimal)
                    .ok_or_else(|| Error::map_reduce(format!("row for '{}' has no decimal Total", key)))
            })
            .collect::<Result<Vec<Decimal>>>()?;
        Ok(total_row(key, Decimal::checked_sum(totals)?))
    }
}

/// Typed view of a `CompanyOrderTotal` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompanyOrdersTotal {
    pub company_id: String,
    pub total: Decimal,
}

impl CompanyOrdersTotal {
    pub fn from_row(row: &ReducedRow) -> Result<Self> {
        let company_id = row
            .get("CompanyId")
            .and_then(FieldValue::as_text)
            .unwrap_or(&row.key)
            .to_string();
        let total = row
            .get("Total")
            .and_then(FieldValue::as_decimal)
            .ok_or_else(|| Error::not_found(format!("Total in row '{}'", row.key)))?;
        Ok(CompanyOrdersTotal { company_id, total })
    }
}
