#![deny(clippy::all)]

pub mod error_codes;
mod sync;

pub use error_codes::ErrorCategory;
pub use error_codes::UnknownCategory;
pub use sync::mutex_lock_or_recover;
pub use sync::poison_recovery_count;
pub use sync::rwlock_read_or_recover;
pub use sync::rwlock_write_or_recover;
