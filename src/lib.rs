pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{agent, memory, repl, tooling};
pub use domain::types;
pub use infrastructure::{archive, model, sandbox, server};
