//! Request extractors for tenant-billing.

mod caller;

pub use caller::{CallerContext, ORG_ID_HEADER, ROLE_HEADER, USER_ID_HEADER};
