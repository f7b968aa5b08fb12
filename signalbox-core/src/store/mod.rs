pub mod error;
pub mod paths;
pub mod sanitize;

pub use error::{Result, StoreError};
pub use sanitize::{strip_nulls, to_store_fields, to_store_value};
