pub mod admin;
pub mod general;
pub mod verification;

pub use admin::bulkverify;
pub use general::{help, ping};
pub use verification::{orgstatus, verify};
