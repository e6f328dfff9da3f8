pub mod tenant;

pub use tenant::{tenant_from_headers, TenantHeader, TENANT_HEADER};
