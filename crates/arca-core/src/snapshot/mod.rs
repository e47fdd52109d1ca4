pub mod codec;
pub mod commit;
pub mod node;
pub mod tree;
pub mod xattr;

pub use commit::{Commit, CommitFailedFile, CURRENT_COMMIT_VERSION};
pub use node::{FileAttributes, Node};
pub use tree::{Tree, CURRENT_TREE_VERSION};
pub use xattr::XAttrSet;
