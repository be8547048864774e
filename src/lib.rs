pub mod buffer;
pub mod config;
pub mod error;
pub mod storage;

pub use config::TreeConfig;
pub use error::{LatchTreeError, LatchTreeResult};
pub use storage::{Cursor, Tree, View};
