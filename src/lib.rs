pub mod app;
pub mod cli;
pub mod compose;
pub mod config;
pub mod detail;
pub mod errors;
pub mod gmail;
pub mod mime;
pub mod oauth;
pub mod onboarding;
pub mod sync;
pub mod types;
