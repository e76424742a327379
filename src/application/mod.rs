pub mod agent;
pub mod memory;
pub mod repl;
pub mod tooling;
