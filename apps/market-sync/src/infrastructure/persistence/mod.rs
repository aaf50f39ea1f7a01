//! Token Persistence Adapters
//!
//! Client-local storage for the credential.

mod file;
mod in_memory;

pub use file::FileTokenStore;
pub use in_memory::InMemoryTokenStore;
