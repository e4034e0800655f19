//! Content-addressed identity for build products.
//!
//! Registering the same bytes (or the same clean commit) twice resolves to
//! the record created the first time.

mod compare;
mod git;
mod query;
mod register;
mod verify;

pub use compare::{compare, equal, Comparison, MetadataField, MetadataMismatch};
pub use git::git_provenance;
pub use query::{
    artifacts_by_name, artifacts_by_type, disk_images, kernels, load_artifact, simulator_binaries,
};
pub use register::{register, NewArtifact, Registration, MIN_DOCUMENTATION_LEN};
pub use verify::{check_fresh, current_verification_value};

pub const DISK_IMAGE_TYPE: &str = "disk image";
pub const KERNEL_TYPE: &str = "kernel";
pub const SIMULATOR_BINARY_TYPE: &str = "simulator binary";
pub const GIT_REPO_TYPE: &str = "git repo";
pub const DIRECTORY_TYPE: &str = "directory";
pub const BINARY_TYPE: &str = "binary";
