//! Session store implementations for termagent.

mod log;

pub mod file;
pub mod in_memory;

pub use file::FileSessionStore;
pub use in_memory::InMemorySessionStore;
