//! A hierarchical node store, with embedded and remote backends, change
//! events and drive-prefixed paths.

pub mod appdata;
pub mod archive;
pub mod backend;
pub mod errors;
pub mod events;
pub mod handle;
pub mod listenable;
pub mod node;
pub mod protocol;
pub mod pseudoclass;
pub mod server;

#[cfg(test)]
use rstest_reuse;

pub use self::appdata::{AfsPath, AppData, MountConfig};
pub use self::errors::Error;
pub use self::handle::NodeHandle;
pub use self::listenable::ListenableStore;
pub use self::node::NodeId;
