//! Package installation.
//!
//! Provides:
//! - Spec parsing and normalization (`name@range`, aliases, git, tarballs, paths)
//! - Concurrent dependency resolution with fetch-once deduplication
//! - Peer dependency resolution and placement
//! - Lockfile reconciliation (wanted and private lockfiles)
//! - Linking into `node_modules` from the content store
//! - Orphan removal and lifecycle scripts

pub mod bins;
pub mod context;
pub mod dep_path;
pub mod error;
pub mod fetch;
pub mod install;
pub mod installable;
pub mod link;
pub mod lockfile;
pub mod manifest;
pub mod modules;
pub mod npmrc;
pub mod orphans;
pub mod peers;
pub mod reconcile;
pub mod registry;
pub mod resolve;
pub mod scripts;
pub mod spec;
pub mod store;
pub mod tarball;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tree;
pub mod version;

pub use context::{ContextSettings, InstallContext, InstalledPackage, LocalPackage};
pub use error::{codes as pkg_codes, PkgError};
pub use fetch::{FetchGate, FetchHandles, PackageContentInfo, ResolveHints, ResolvedPackage};
pub use install::{install, install_named, InstallOutcome, InstalledRoot, SaveOptions};
pub use lockfile::{
    codes as lockfile_codes, DependencySnapshot, LockResolution, Lockfile, LockfileError,
    PRIVATE_LOCKFILE, WANTED_LOCKFILE,
};
pub use manifest::{Manifest, SaveType};
pub use modules::ModulesState;
pub use npmrc::NpmrcConfig;
pub use registry::RegistryClient;
pub use resolve::{resolve_dependencies, PackageRequest, ResolveOptions};
pub use scripts::{CommandScriptRunner, ScriptOptions, ScriptRunner};
pub use spec::{PackageSpec, SpecKind};
pub use store::StoreFetchGate;
pub use version::{resolve_version, version_satisfies};
