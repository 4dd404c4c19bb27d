pub mod error;
pub mod item;

pub use error::{CacheError, Result};
pub use item::{unix_seconds, CacheItem, WireItem, HEADER_LEN, ITEM_HEADER, MAX_RELATIVE_EXPIRATION};
