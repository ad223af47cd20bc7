pub mod handlers;
pub mod middleware;
pub mod requests;
pub mod responses;
pub mod routes;

pub use middleware::idempotency_middleware;
pub use routes::{create_router, with_idempotency, AppState};
