pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod filter;
pub mod logging;
pub mod naming;
pub mod runtime;
pub mod sink;
pub mod types;
pub mod webdriver;

pub use runtime::run;
