//! Sandboxed path resolution and file access.
//!
//! Untrusted names are mapped onto canonical paths strictly inside one base
//! directory by [`PathResolver`]; [`SandboxGateway`] routes reads and fixture
//! seeding through it before touching the filesystem.

pub mod decode;
pub mod errors;
pub mod fs;
pub mod path;
pub mod seed;

pub use errors::{RejectionKind, Result, SandboxError};
pub use fs::{FileContent, SandboxConfig, SandboxGateway, SeedReport, BASE_DIR_ENV};
pub use path::{resolve, PathResolver, ResolvedPath, SymlinkPolicy};
pub use seed::SeedManifest;
