//! CSV order import.
//!
//! Parses the spreadsheet format the admin dashboard hands out to
//! customers: one row per line item, Indonesian column headers, comma or
//! semicolon separated. Rows sharing the same (customer, order date) pair
//! merge into a single draft order with multiple items.
//!
//! Missing required columns fail the whole file; broken individual rows
//! are skipped so one typo never blocks an import.

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::debug;
use uuid::Uuid;

use crate::error::ImportError;
use crate::model::{NewOrder, OrderItem, PricingMode};
use crate::store::parse_wire_date;

/// Required column headers (case-insensitive). `tanggal_pesanan` may stand
/// in for `tanggal` and wins when both are present.
pub const REQUIRED_COLUMNS: [&str; 6] =
    ["pelanggan", "tanggal", "nama", "kuantitas", "satuan", "harga"];

struct Columns {
    customer: usize,
    date: usize,
    name: usize,
    quantity: usize,
    unit: usize,
    price: usize,
    completed_date: Option<usize>,
    pricing_mode: Option<usize>,
    price_per_portion: Option<usize>,
    price_per_piece: Option<usize>,
}

fn detect_delimiter(header_line: &str) -> char {
    if header_line.contains(';') {
        ';'
    } else {
        ','
    }
}

fn resolve_columns(headers: &[String]) -> Result<Columns, ImportError> {
    let find = |name: &str| headers.iter().position(|h| h == name);

    let mut missing = Vec::new();
    let customer = find("pelanggan");
    let date = find("tanggal_pesanan").or_else(|| find("tanggal"));
    let name = find("nama");
    let quantity = find("kuantitas");
    let unit = find("satuan");
    let price = find("harga");

    if customer.is_none() {
        missing.push("pelanggan".to_string());
    }
    if date.is_none() {
        missing.push("tanggal".to_string());
    }
    if name.is_none() {
        missing.push("nama".to_string());
    }
    if quantity.is_none() {
        missing.push("kuantitas".to_string());
    }
    if unit.is_none() {
        missing.push("satuan".to_string());
    }
    if price.is_none() {
        missing.push("harga".to_string());
    }
    match (customer, date, name, quantity, unit, price) {
        (Some(customer), Some(date), Some(name), Some(quantity), Some(unit), Some(price)) => {
            Ok(Columns {
                customer,
                date,
                name,
                quantity,
                unit,
                price,
                completed_date: find("tanggal_selesai"),
                pricing_mode: find("pricing_mode"),
                price_per_portion: find("price_per_portion"),
                price_per_piece: find("price_per_piece"),
            })
        }
        _ => Err(ImportError::MissingColumns(missing)),
    }
}

fn field<'a>(values: &'a [&'a str], index: usize) -> &'a str {
    values.get(index).copied().unwrap_or("").trim()
}

fn parse_quantity(raw: &str) -> Option<u32> {
    let value: f64 = raw.parse().ok()?;
    if value <= 0.0 || value.fract() != 0.0 {
        return None;
    }
    Some(value as u32)
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|p| *p > 0.0)
}

/// Per-row pricing resolution: an explicit pricing mode requires its price
/// column, otherwise the legacy `harga` column applies.
fn resolve_pricing(
    columns: &Columns,
    values: &[&str],
) -> Option<(f64, Option<PricingMode>, Option<f64>, Option<f64>)> {
    let per_portion = columns
        .price_per_portion
        .and_then(|i| parse_price(field(values, i)));
    let per_piece = columns
        .price_per_piece
        .and_then(|i| parse_price(field(values, i)));
    let mode = columns
        .pricing_mode
        .map(|i| field(values, i).to_ascii_lowercase());

    match mode.as_deref() {
        Some("per_portion") => {
            let price = per_portion?;
            Some((price, Some(PricingMode::PerPortion), per_portion, per_piece))
        }
        Some("per_piece") => {
            let price = per_piece?;
            Some((price, Some(PricingMode::PerPiece), per_portion, per_piece))
        }
        _ => {
            let price = parse_price(field(values, columns.price))?;
            Some((price, None, per_portion, per_piece))
        }
    }
}

/// Parse CSV text into draft orders.
///
/// Returns an empty list for a file with no data rows. Drafts come out
/// with `pending` status, zero tax and totals derived from their items,
/// newest rows in first-seen customer/date order.
pub fn parse_orders_csv(text: &str) -> Result<Vec<NewOrder>, ImportError> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 2 {
        return Ok(Vec::new());
    }

    let delimiter = detect_delimiter(lines[0]);
    let headers: Vec<String> = lines[0]
        .split(delimiter)
        .map(|h| h.trim().to_lowercase())
        .collect();
    let columns = resolve_columns(&headers)?;

    let mut drafts: Vec<NewOrder> = Vec::new();
    let mut index_by_key: HashMap<(String, NaiveDate), usize> = HashMap::new();

    for (line_number, line) in lines.iter().enumerate().skip(1) {
        let values: Vec<&str> = line.split(delimiter).map(str::trim).collect();

        let customer = field(&values, columns.customer);
        let raw_date = field(&values, columns.date);
        let item_name = field(&values, columns.name);
        if customer.is_empty() || raw_date.is_empty() || item_name.is_empty() {
            continue;
        }

        let Some(order_date) = parse_wire_date(raw_date) else {
            debug!(line = line_number + 1, raw = raw_date, "skipping row with unreadable date");
            continue;
        };
        let Some(quantity) = parse_quantity(field(&values, columns.quantity)) else {
            debug!(line = line_number + 1, "skipping row with non-positive quantity");
            continue;
        };
        let Some((unit_price, pricing_mode, per_portion, per_piece)) =
            resolve_pricing(&columns, &values)
        else {
            debug!(line = line_number + 1, "skipping row with no usable price");
            continue;
        };

        let unit = field(&values, columns.unit);
        let mut item = OrderItem {
            id: Uuid::new_v4().to_string(),
            name: item_name.to_string(),
            quantity,
            unit: (!unit.is_empty()).then(|| unit.to_string()),
            unit_price,
            total: 0.0,
            recipe_id: None,
            recipe_category: None,
            is_from_recipe: false,
            pricing_mode,
            price_per_portion: per_portion,
            price_per_piece: per_piece,
        };
        item.recompute_total();

        let key = (customer.to_string(), order_date);
        let draft_index = *index_by_key.entry(key).or_insert_with(|| {
            let mut draft = NewOrder::new(customer, order_date);
            draft.completed_date = columns
                .completed_date
                .map(|i| field(&values, i))
                .filter(|v| !v.is_empty())
                .and_then(parse_wire_date);
            drafts.push(draft);
            drafts.len() - 1
        });
        drafts[draft_index].items.push(item);
    }

    for draft in &mut drafts {
        draft.tax = 0.0;
        draft.recompute_totals();
    }

    Ok(drafts)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;

    #[test]
    fn test_rows_sharing_customer_and_date_merge_into_one_draft() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan,harga\n\
                   Acme,2025-01-01,Widget,2,pcs,100\n\
                   Acme,2025-01-01,Gadget,1,pcs,50\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.customer_name, "Acme");
        assert_eq!(draft.items.len(), 2);
        assert_eq!(draft.total_amount, 250.0);
        assert_eq!(draft.subtotal, 250.0);
        assert_eq!(draft.tax, 0.0);
        assert_eq!(draft.status, OrderStatus::Pending);
    }

    #[test]
    fn test_different_dates_produce_separate_drafts() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan,harga\n\
                   Acme,2025-01-01,Widget,2,pcs,100\n\
                   Acme,2025-01-02,Widget,1,pcs,100\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(drafts.len(), 2);
    }

    #[test]
    fn test_missing_price_column_fails_whole_file() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan\n\
                   Acme,2025-01-01,Widget,2,pcs\n";
        let err = parse_orders_csv(csv).unwrap_err();
        match err {
            ImportError::MissingColumns(missing) => {
                assert_eq!(missing, vec!["harga".to_string()]);
            }
        }
    }

    #[test]
    fn test_semicolon_delimiter_detected_from_header() {
        let csv = "pelanggan;tanggal;nama;kuantitas;satuan;harga\n\
                   Toko Jaya;2025-02-01;Brownies;3;box;60000\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].items[0].quantity, 3);
        assert_eq!(drafts[0].total_amount, 180_000.0);
    }

    #[test]
    fn test_rows_missing_customer_date_or_name_are_skipped() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan,harga\n\
                   ,2025-01-01,Widget,2,pcs,100\n\
                   Acme,,Widget,2,pcs,100\n\
                   Acme,2025-01-01,,2,pcs,100\n\
                   Acme,2025-01-01,Widget,2,pcs,100\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].items.len(), 1);
    }

    #[test]
    fn test_non_positive_quantity_or_price_drops_row() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan,harga\n\
                   Acme,2025-01-01,Widget,0,pcs,100\n\
                   Acme,2025-01-01,Gadget,2,pcs,0\n\
                   Acme,2025-01-01,Sprocket,1,pcs,25\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].items.len(), 1);
        assert_eq!(drafts[0].items[0].name, "Sprocket");
    }

    #[test]
    fn test_pricing_mode_uses_mode_price_over_harga() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan,harga,pricing_mode,price_per_portion,price_per_piece\n\
                   Acme,2025-01-01,Nastar,2,porsi,1,per_portion,85000,\n\
                   Acme,2025-01-01,Kue,4,pcs,1,per_piece,,5000\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(drafts.len(), 1);
        let items = &drafts[0].items;
        assert_eq!(items[0].unit_price, 85_000.0);
        assert_eq!(items[0].pricing_mode, Some(PricingMode::PerPortion));
        assert_eq!(items[1].unit_price, 5_000.0);
        assert_eq!(items[1].pricing_mode, Some(PricingMode::PerPiece));
        assert_eq!(drafts[0].total_amount, 190_000.0);
    }

    #[test]
    fn test_pricing_mode_without_its_price_drops_row() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan,harga,pricing_mode,price_per_portion\n\
                   Acme,2025-01-01,Nastar,2,porsi,50000,per_portion,\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn test_tanggal_pesanan_preferred_over_tanggal() {
        let csv = "pelanggan,tanggal,tanggal_pesanan,nama,kuantitas,satuan,harga\n\
                   Acme,2025-01-01,2025-03-05,Widget,1,pcs,100\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(
            drafts[0].order_date,
            NaiveDate::from_ymd_opt(2025, 3, 5).unwrap()
        );
    }

    #[test]
    fn test_header_only_file_yields_no_drafts() {
        let csv = "pelanggan,tanggal,nama,kuantitas,satuan,harga\n";
        assert!(parse_orders_csv(csv).unwrap().is_empty());
        assert!(parse_orders_csv("").unwrap().is_empty());
    }

    #[test]
    fn test_completion_date_column_is_carried() {
        let csv = "pelanggan,tanggal,tanggal_selesai,nama,kuantitas,satuan,harga\n\
                   Acme,2025-01-01,2025-01-03,Widget,1,pcs,100\n";
        let drafts = parse_orders_csv(csv).unwrap();
        assert_eq!(
            drafts[0].completed_date,
            Some(NaiveDate::from_ymd_opt(2025, 1, 3).unwrap())
        );
    }
}
