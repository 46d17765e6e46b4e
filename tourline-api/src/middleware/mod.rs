pub mod auth;
pub mod client;

pub use auth::{auth_middleware, issue_token, Claims};
pub use client::{client_ip_middleware, rate_limit_middleware, ClientIp};
