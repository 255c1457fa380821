pub mod memory;
pub mod traits;
pub mod unix;

pub use memory::{MemoryFile, MemoryVfs};
pub use traits::{OpenFlags, Vfs, VfsFile};
pub use unix::{UnixFile, UnixVfs};
