pub mod cursor;
pub mod frame;
pub mod node;
pub mod ops;
pub mod tree;

pub use cursor::Cursor;
pub use frame::{CursorFrame, FrameRef};
pub use node::{InsertResult, Node, SiblingDirection, Split};
pub use tree::{Tree, View};
