use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::money::round2;

/// One invoice artifact from one vendor, as extracted by the vision stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// Vendor name as printed on the receipt
    pub vendor_name: String,

    /// Transaction date
    pub transaction_date: NaiveDate,

    /// 3-letter currency code
    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub subtotal: Decimal,

    #[serde(default)]
    pub tax_amount: Decimal,

    #[serde(default)]
    pub tip_amount: Decimal,

    pub total_amount: Decimal,

    /// Ordered line items; line numbers are 1-based and gap-free
    pub line_items: Vec<LineItem>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

fn default_currency() -> String {
    "CAD".to_string()
}

/// One chargeable entry on a receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    /// 1-based position within the receipt
    pub line_number: u32,

    pub description: String,

    #[serde(default = "default_quantity")]
    pub quantity: Decimal,

    #[serde(default)]
    pub unit_price: Decimal,

    pub total_price: Decimal,
}

fn default_quantity() -> Decimal {
    Decimal::ONE
}

impl Receipt {
    /// Validate structural invariants, returning hard errors for malformed
    /// receipts and warning strings for tolerated arithmetic drift.
    ///
    /// The total-vs-components invariant (`total >= subtotal + tax + tip - 1
    /// cent`) and per-line `quantity * unit_price` drift beyond one cent are
    /// warnings, never failures.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        if self.vendor_name.trim().is_empty() {
            return Err("vendor_name must be non-empty".to_string());
        }
        if self.currency.len() != 3 {
            return Err(format!("currency '{}' is not a 3-letter code", self.currency));
        }
        if self.total_amount < Decimal::ZERO {
            return Err("total_amount must be non-negative".to_string());
        }

        let mut expected = 1u32;
        for item in &self.line_items {
            if item.description.trim().is_empty() {
                return Err(format!("line {} has an empty description", item.line_number));
            }
            if item.quantity <= Decimal::ZERO {
                return Err(format!("line {} has non-positive quantity", item.line_number));
            }
            if item.line_number != expected {
                return Err(format!(
                    "line numbers must be 1-based and gap-free (expected {}, found {})",
                    expected, item.line_number
                ));
            }
            expected += 1;
        }

        let mut warnings = Vec::new();
        let one_cent = Decimal::new(1, 2);

        let components = self.subtotal + self.tax_amount + self.tip_amount;
        if components > Decimal::ZERO && self.total_amount < components - one_cent {
            warnings.push(format!(
                "total {} is less than subtotal+tax+tip {}",
                self.total_amount, components
            ));
        }

        for item in &self.line_items {
            if item.unit_price > Decimal::ZERO {
                let computed = item.quantity * item.unit_price;
                if (item.total_price - computed).abs() > one_cent {
                    warnings.push(format!(
                        "line {}: total_price {} differs from quantity*unit_price {}",
                        item.line_number,
                        item.total_price,
                        round2(computed)
                    ));
                }
            }
        }

        Ok(warnings)
    }

    /// Sum of line totals, rounded
    pub fn line_total(&self) -> Decimal {
        round2(self.line_items.iter().map(|i| i.total_price).sum())
    }

    /// Look up a line item by its 1-based number
    pub fn line(&self, line_number: u32) -> Option<&LineItem> {
        self.line_items.iter().find(|i| i.line_number == line_number)
    }

    /// Highest assigned line number, 0 when empty
    pub fn max_line_number(&self) -> u32 {
        self.line_items.iter().map(|i| i.line_number).max().unwrap_or(0)
    }
}

impl LineItem {
    pub fn new(line_number: u32, description: impl Into<String>, total_price: Decimal) -> Self {
        Self {
            line_number,
            description: description.into(),
            quantity: Decimal::ONE,
            unit_price: total_price,
            total_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn receipt_with_lines(lines: Vec<LineItem>) -> Receipt {
        Receipt {
            vendor_name: "Test Vendor".to_string(),
            transaction_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            currency: "CAD".to_string(),
            subtotal: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            tip_amount: Decimal::ZERO,
            total_amount: dec("10.00"),
            line_items: lines,
            payment_method: None,
        }
    }

    #[test]
    fn test_valid_receipt_no_warnings() {
        let r = receipt_with_lines(vec![LineItem::new(1, "Coffee", dec("10.00"))]);
        assert!(r.validate().unwrap().is_empty());
    }

    #[test]
    fn test_gap_in_line_numbers_rejected() {
        let r = receipt_with_lines(vec![
            LineItem::new(1, "Coffee", dec("5.00")),
            LineItem::new(3, "Muffin", dec("5.00")),
        ]);
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_total_shortfall_is_warning_not_error() {
        let mut r = receipt_with_lines(vec![LineItem::new(1, "Meal", dec("34.73"))]);
        r.subtotal = dec("34.73");
        r.tax_amount = dec("1.50");
        r.total_amount = dec("34.73"); // short by the tax amount
        let warnings = r.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_quantity_price_drift_warning() {
        let mut item = LineItem::new(1, "Widgets", dec("10.00"));
        item.quantity = dec("3");
        item.unit_price = dec("3.00"); // 9.00 expected, 10.00 recorded
        let r = receipt_with_lines(vec![item]);
        let warnings = r.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_empty_vendor_rejected() {
        let mut r = receipt_with_lines(vec![LineItem::new(1, "Coffee", dec("10.00"))]);
        r.vendor_name = "  ".to_string();
        assert!(r.validate().is_err());
    }
}
