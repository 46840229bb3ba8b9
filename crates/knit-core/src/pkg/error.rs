//! Package manager error types.

use std::fmt;
use std::io;

/// Package manager error codes.
pub mod codes {
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_VERSION_NOT_FOUND: &str = "PKG_VERSION_NOT_FOUND";
    pub const PKG_REGISTRY_ERROR: &str = "PKG_REGISTRY_ERROR";
    pub const PKG_DOWNLOAD_FAILED: &str = "PKG_DOWNLOAD_FAILED";
    pub const PKG_EXTRACT_FAILED: &str = "PKG_EXTRACT_FAILED";
    pub const PKG_LINK_FAILED: &str = "PKG_LINK_FAILED";
    pub const NODE_MODULES_WRITE_FAILED: &str = "NODE_MODULES_WRITE_FAILED";
    pub const PKG_STORE_ERROR: &str = "PKG_STORE_ERROR";
    pub const PKG_PACKAGE_JSON_NOT_FOUND: &str = "PKG_PACKAGE_JSON_NOT_FOUND";
    pub const PKG_PACKAGE_JSON_INVALID: &str = "PKG_PACKAGE_JSON_INVALID";

    // install engine
    pub const PKG_RESOLUTION_FAILED: &str = "PKG_RESOLUTION_FAILED";
    pub const PKG_FETCH_FAILED: &str = "PKG_FETCH_FAILED";
    pub const PKG_UNSUPPORTED_PLATFORM: &str = "PKG_UNSUPPORTED_PLATFORM";
    pub const PKG_SCRIPT_FAILED: &str = "PKG_SCRIPT_FAILED";
    pub const PKG_LOCKFILE_INVALID: &str = "PKG_LOCKFILE_INVALID";
}

/// Package manager error.
///
/// Cloneable so one failure can be handed to every consumer of a shared
/// fetch future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Append the dependency chain that led to this error.
    #[must_use]
    pub fn with_ancestors(mut self, ancestors: &[String]) -> Self {
        if !ancestors.is_empty() {
            self.message = format!("{} (via >{})", self.message, ancestors.join(">"));
        }
        self
    }

    /// Create a spec invalid error.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    /// Create a package not found error.
    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::PKG_NOT_FOUND, format!("Package not found: {name}"))
    }

    /// Create a version not found error.
    #[must_use]
    pub fn version_not_found(name: &str, range: &str) -> Self {
        Self::new(
            codes::PKG_VERSION_NOT_FOUND,
            format!("No version of {name} satisfies range: {range}"),
        )
    }

    /// Create a registry error.
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, msg)
    }

    /// Create a download failed error.
    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_DOWNLOAD_FAILED, msg)
    }

    /// Create an extraction failed error.
    pub fn extract_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_EXTRACT_FAILED, msg)
    }

    /// Create a link failed error.
    pub fn link_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_LINK_FAILED, msg)
    }

    /// Create a `node_modules` write failed error.
    pub fn node_modules_write_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::NODE_MODULES_WRITE_FAILED, msg)
    }

    /// Create a store error.
    pub fn store_error(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_STORE_ERROR, msg)
    }

    /// Create a package.json not found error.
    #[must_use]
    pub fn package_json_not_found(path: &std::path::Path) -> Self {
        Self::new(
            codes::PKG_PACKAGE_JSON_NOT_FOUND,
            format!("package.json not found: {}", path.display()),
        )
    }

    /// Create a package.json invalid error.
    pub fn package_json_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PACKAGE_JSON_INVALID, msg)
    }

    pub fn resolution_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_RESOLUTION_FAILED, msg)
    }

    pub fn fetch_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_FETCH_FAILED, msg)
    }

    /// Create an unsupported platform error for a required package.
    #[must_use]
    pub fn unsupported_platform(id: &str, reason: &str) -> Self {
        Self::new(
            codes::PKG_UNSUPPORTED_PLATFORM,
            format!("{id} is not installable: {reason}"),
        )
    }

    pub fn script_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SCRIPT_FAILED, msg)
    }

    pub fn lockfile_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_LOCKFILE_INVALID, msg)
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        Self::new(codes::PKG_STORE_ERROR, e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Connection failed: {e}"))
        } else {
            Self::new(codes::PKG_REGISTRY_ERROR, e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, format!("Invalid JSON: {e}"))
    }
}
