//! Error Types
//!
//! The main error type [`CandelaError`] covers all failure modes of the
//! renderer: scene-description parsing, asset loading, device-resource
//! creation, and pipeline invariants. All public APIs return [`Result<T>`],
//! an alias for `std::result::Result<T, CandelaError>`.
//!
//! Fatal conditions surface as errors; recoverable conditions (out-of-shutter
//! samples, unknown AOV components, missing built-in IOR entries) are logged
//! through the warning sink and execution continues with a documented
//! fallback.

use std::path::PathBuf;

use thiserror::Error;

use crate::scene::desc::SourceLocation;

/// The main error type for the Candela renderer.
#[derive(Error, Debug)]
pub enum CandelaError {
    // ========================================================================
    // Scene description errors
    // ========================================================================
    /// A scene file could not be located.
    #[error("Scene file not found: {0}")]
    SceneFileNotFound(PathBuf),

    /// The scene source failed to parse.
    #[error("Scene parse error at {location}: {message}")]
    SceneParse {
        /// Where the parse failed
        location: SourceLocation,
        /// What went wrong
        message: String,
    },

    /// A node identifier was defined more than once with conflicting bodies.
    #[error("Redefinition of node '{0}'")]
    NodeRedefinition(String),

    /// A referenced node does not exist or carries the wrong tag.
    #[error("Unresolved reference to node '{identifier}' (expected {expected})")]
    UnresolvedReference {
        /// Identifier that failed to resolve
        identifier: String,
        /// Expected node tag
        expected: &'static str,
    },

    /// A required property is missing from a node.
    #[error("Property '{name}' is not defined in node '{node}' at {location}")]
    MissingProperty {
        /// Property name
        name: String,
        /// Node identifier
        node: String,
        /// Node source location
        location: SourceLocation,
    },

    /// A property exists but holds the wrong value kind.
    #[error("Property '{name}' in node '{node}' has type {actual}, expected {expected}")]
    PropertyType {
        /// Property name
        name: String,
        /// Node identifier
        node: String,
        /// Actual value kind
        actual: &'static str,
        /// Expected value kind
        expected: &'static str,
    },

    /// An invalid macro definition (`-D key=value` or in-file `define`).
    #[error("Invalid macro definition: {0}")]
    InvalidMacro(String),

    /// No factory registered for a `(tag, impl)` pair.
    #[error("No {tag} implementation named '{impl_type}' is registered")]
    UnknownPlugin {
        /// Node tag
        tag: &'static str,
        /// Implementation string
        impl_type: String,
    },

    // ========================================================================
    // Asset errors
    // ========================================================================
    /// An image failed to decode or has an unsupported layout.
    #[error("Failed to load image '{path}': {message}")]
    ImageLoad {
        /// Offending file
        path: PathBuf,
        /// Decoder message
        message: String,
    },

    /// An image failed to encode or write.
    #[error("Failed to save image '{path}': {message}")]
    ImageSave {
        /// Target file
        path: PathBuf,
        /// Encoder message
        message: String,
    },

    /// A mesh with no vertices or no triangles.
    #[error("Empty mesh in shape '{0}'")]
    EmptyMesh(String),

    /// Deformable meshes are not supported.
    #[error("Deformable meshes are not supported (shape '{0}')")]
    DeformableMesh(String),

    // ========================================================================
    // Runtime invariants
    // ========================================================================
    /// A runtime invariant did not hold.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// The differentiation engine was materialized twice.
    #[error("Differentiation already materialized")]
    AlreadyMaterialized,

    /// Backend selection failed.
    #[error("Unknown device backend '{0}'")]
    UnknownBackend(String),

    // ========================================================================
    // I/O
    // ========================================================================
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON scene parsing error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<image::ImageError> for CandelaError {
    fn from(err: image::ImageError) -> Self {
        CandelaError::ImageLoad {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

/// Alias for `Result<T, CandelaError>`.
pub type Result<T> = std::result::Result<T, CandelaError>;
