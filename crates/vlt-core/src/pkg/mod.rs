//! Package resolution and installation.
//!
//! - [`depid`]: compact, sortable ids for resolved packages
//! - [`graph`]: the dependency graph model
//! - [`ideal`]: resolve manifests into the graph an install should produce
//! - [`actual`]: read the installed graph back from `node_modules`
//! - [`diff`] and [`reify`]: apply the difference transactionally
//! - [`cache`]: content-addressed request cache with fetch coalescing
//! - [`lockfile`]: `vlt-lock.json` codec

pub mod actual;
pub mod bins;
pub mod cache;
pub mod context;
pub mod depid;
pub mod diff;
pub mod error;
pub mod git;
pub mod graph;
pub mod ideal;
pub mod integrity;
pub mod journal;
pub mod link;
pub mod lockfile;
pub mod manifest;
pub mod registry;
pub mod reify;
pub mod render;
pub mod retry;
pub mod source;
pub mod spec;
pub mod tarball;
pub mod version;
pub mod workspaces;

pub use actual::{load_actual, ActualLoader};
pub use bins::ShimStyle;
pub use cache::{Cache, CacheError, CacheOptions, CacheStats};
pub use context::{Context, ManifestCache};
pub use depid::{DepId, DepIdTuple, Origin};
pub use diff::{diff, Diff, LinkKey};
pub use error::{codes as pkg_codes, PkgError};
pub use git::{GitCli, GitClient, GitRef};
pub use graph::{DepType, Edge, Graph, Node};
pub use ideal::{build_ideal, AddRequest, IdealBuildOptions, IdealBuilder, RemoveRequest};
pub use integrity::Integrity;
pub use journal::Journal;
pub use lockfile::{codes as lockfile_codes, LockfileError, LOCKFILE_NAME};
pub use manifest::Manifest;
pub use registry::{Packument, RegistryClient};
pub use reify::{reify, ReifyOptions, ReifyReport};
pub use render::render_tree;
pub use retry::RetryPolicy;
pub use source::{PackageInfoClient, PackageSource, Resolution};
pub use spec::{Spec, SpecKind};
pub use version::{resolve_version, version_satisfies, Range};
pub use workspaces::{discover, find_workspace_root, WorkspaceMember};
