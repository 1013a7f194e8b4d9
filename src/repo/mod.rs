pub mod branchdb;
pub mod manifest;
pub mod types;

pub use branchdb::BranchDb;
pub use manifest::{Manifest, ManifestCache};
pub use types::{BuildProfile, RepoEntry};
