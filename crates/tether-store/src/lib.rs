pub mod disk;
pub mod memory;
mod pending;
pub mod types;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use types::{Store, StoreError};
