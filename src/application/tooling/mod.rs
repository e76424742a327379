mod store;

pub use store::{ToolStore, ToolStoreError};
