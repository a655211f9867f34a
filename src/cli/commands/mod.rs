//! CLI command implementations.

mod password;
mod pki;
mod start;

pub use password::run_hash_password;
pub use pki::run_pki;
pub use start::run_start;
