pub mod identity;
pub mod loader;

pub use identity::{IdentityEntry, IdentityMatcher, IdentitySnapshot, DEFAULT_MATCH_THRESHOLD};
pub use loader::{HttpIdentitySource, IdentitySource};
