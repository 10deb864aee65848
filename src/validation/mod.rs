//! Validation functionality
//!
//! Provides validation logic for:
//! - Relative paths supplied by callers (traversal, forbidden characters, root containment)

pub mod path;

pub use path::{FORBIDDEN_PATH_CHARS, PathError, PathValidator, StorageRoot, normalize_relative};
