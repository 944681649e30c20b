pub mod capture;
pub mod config;
pub mod error;
pub mod proxy;
pub mod tls;
