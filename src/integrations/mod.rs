//! External accounting system integration.

pub mod quickbooks;

pub use quickbooks::{AccountRef, PurchaseRef, QuickBooksClient, VendorRef};
