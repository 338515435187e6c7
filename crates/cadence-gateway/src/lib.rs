//! HTTP surface for the scheduler: the axum router, request identity, and
//! the boot pieces `main` strings together.

pub mod app;
pub mod http;
pub mod identity;

pub use app::{build_router, AppState};
pub use http::error::{ApiError, ApiResult};
pub use identity::{Actor, HeaderIdentity, IdentityProvider};
