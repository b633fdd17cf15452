//! Local adapters for single-host deployment and tests.

pub mod fs;
pub mod memory;
pub mod repository;

pub use fs::FsStorage;
pub use memory::MemoryStorage;
pub use repository::MemoryJobRepository;
