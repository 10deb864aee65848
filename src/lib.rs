//! File Manager SDK - Storage layer for user-uploaded files
//!
//! Provides unified interfaces for:
//! - Folder and file operations over local or S3 storage (via storage backends)
//! - Path validation against a storage root
//! - Collision-free file naming
//! - Storage quotas
//! - Image derivatives (compression, WebP, original copies) and cropping

pub mod config;
pub mod error;
pub mod imaging;
pub mod naming;
pub mod quota;
pub mod resolver;
pub mod service;
pub mod storage;
pub mod validation;

// Re-export commonly used types
pub use config::{ConfigError, FileManagerConfig, ImageProcessingConfig, StorageType};
pub use error::FileManagerError;
pub use service::FileManagerService;

pub use storage::{
    DirectoryTreeNode, FileEntry, FileKind, LocalStorageBackend, MemoryObjectStore,
    ObjectStorageBackend, ObjectStore, StorageBackend, StorageError, UploadedFile, build_backend,
};
#[cfg(feature = "s3")]
pub use storage::s3::S3ObjectStore;

pub use imaging::{ImageDerivativePipeline, ImageDerivativeSet, ImageOptions, ImageProcessingError};
pub use naming::{NamingError, UniqueNameResolver, sanitize_file_name};
pub use quota::{DefaultQuotaResolver, QuotaGuard, QuotaResolver, format_bytes};
pub use resolver::{DefaultUploadPathResolver, UploadPathResolver};
pub use validation::{PathError, PathValidator, StorageRoot};
