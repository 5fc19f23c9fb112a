// Session Transport - authenticated request pipeline

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
