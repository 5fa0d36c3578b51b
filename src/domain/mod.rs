//! Core domain types for receipt processing.

pub mod category;
pub mod categorized;
pub mod error;
pub mod money;
pub mod receipt;

pub use category::Category;
pub use categorized::{CategorizedReceipt, ProcessedItem, StageConfidences};
pub use error::{ExpenseOpsError, Result};
pub use money::{deductible_amount, deductibility_rate, round2};
pub use receipt::{LineItem, Receipt};
