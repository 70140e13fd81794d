pub mod auth;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod interceptors;
pub mod ordering;
pub mod providers;
pub mod rate_limiter;
pub mod session_store;
