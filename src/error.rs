//! Unified error handling for AccelForge
//!
//! This module provides a centralized error type that consolidates the
//! failure modes of a bootstrap call. It implements error classification for:
//! - Invalid arguments (unknown, retired, or unregistered device identifiers)
//! - Plugin load failures (native library missing or incompatible)
//! - Plugin init failures (library loaded but its entry point failed)
//! - Coordination failures (rendezvous timeout, unreachable address, rank mismatch)
//! - Client construction failures (factory rejected the assembled options)
//!
//! Every error is terminal for the current initialization call; nothing at
//! this layer retries.

use std::fmt;

use crate::coordinator::RendezvousError;
use crate::loader::LoadError;

/// Unified error type for AccelForge
///
/// This enum consolidates the failure modes of every initialization path
/// into a single type. It supports classification via the `kind()` method.
#[derive(Debug, thiserror::Error)]
pub enum AccelForgeError {
    // ========== Argument Errors ==========
    /// Device identifier not in the built-in set and not in the registry
    #[error("Unknown ACCELFORGE_DEVICE: '{0}'")]
    UnknownDevice(String),

    /// Device identifier refers to a retired backend
    #[error("{0} client is no longer available.")]
    RetiredDevice(String),

    /// Dynamic-plugin path selected but no descriptor is registered
    #[error("plugin '{0}' is not registered; register it before initializing")]
    PluginNotRegistered(String),

    /// Caller-supplied value rejected before any side effect
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ========== Plugin Library Errors ==========
    /// Native plugin library could not be loaded
    #[error("failed to load plugin '{name}': {source}")]
    PluginLoad {
        name: String,
        #[source]
        source: LoadError,
    },

    /// Plugin library loaded but its initialization entry failed
    #[error("plugin '{name}' failed to initialize: {detail}")]
    PluginInit { name: String, detail: String },

    // ========== Coordination Errors ==========
    /// Distributed rendezvous or key-value store bootstrap failed
    #[error("coordination failed while {context}: {source}")]
    Coordination {
        context: String,
        #[source]
        source: RendezvousError,
    },

    // ========== Client Construction Errors ==========
    /// Client factory rejected the assembled options
    #[error("client construction failed for '{platform}': {detail}")]
    ClientConstruction { platform: String, detail: String },

    // ========== Ambient Errors ==========
    /// File or socket I/O error outside the rendezvous path
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Lock poisoned (indicates a bug or concurrent access issue)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AccelForgeError {
    /// Classify the error for handling decisions
    ///
    /// Returns the error kind, which callers use to decide whether the
    /// failure was their input, the plugin library, the coordination layer,
    /// or the client factory.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccelForgeError::UnknownDevice(_)
            | AccelForgeError::RetiredDevice(_)
            | AccelForgeError::PluginNotRegistered(_)
            | AccelForgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,

            AccelForgeError::PluginLoad { .. } => ErrorKind::PluginLoad,
            AccelForgeError::PluginInit { .. } => ErrorKind::PluginInit,
            AccelForgeError::Coordination { .. } => ErrorKind::Coordination,
            AccelForgeError::ClientConstruction { .. } => ErrorKind::ClientConstruction,

            AccelForgeError::IoError(_)
            | AccelForgeError::LockPoisoned(_)
            | AccelForgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is an invalid-argument rejection
    ///
    /// Invalid arguments are actionable by the caller: a different device
    /// identifier or an explicit registration fixes them.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidArgument)
    }

    /// Check if this error came from loading or initializing a native library
    pub fn is_plugin_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::PluginLoad | ErrorKind::PluginInit)
    }

    /// Check if this error came from the distributed rendezvous
    pub fn is_coordination_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Coordination)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Internal)
    }
}

/// Error kind for handling decisions
///
/// Kinds mirror where in the bootstrap the failure happened:
/// - InvalidArgument: caller passed a bad or unregistered identifier
/// - PluginLoad: the native library could not be opened
/// - PluginInit: the library opened but refused to initialize
/// - Coordination: the multi-process rendezvous failed
/// - ClientConstruction: the client factory rejected the options
/// - Internal: a bug or ambient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unrecognized, retired, or unregistered device identifier
    InvalidArgument,
    /// Native library missing or incompatible
    PluginLoad,
    /// Plugin loaded but initialization entry failed
    PluginInit,
    /// Rendezvous timeout, unreachable address, or rank mismatch
    Coordination,
    /// Client factory rejected the assembled options
    ClientConstruction,
    /// Bug or ambient failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "InvalidArgument"),
            ErrorKind::PluginLoad => write!(f, "PluginLoad"),
            ErrorKind::PluginInit => write!(f, "PluginInit"),
            ErrorKind::Coordination => write!(f, "Coordination"),
            ErrorKind::ClientConstruction => write!(f, "ClientConstruction"),
            ErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

// Note: From<std::io::Error> is auto-derived by #[from] on IoError variant
// Note: From<std::sync::PoisonError<T>> is implemented below since LockPoisoned takes String

impl<T> From<std::sync::PoisonError<T>> for AccelForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AccelForgeError::LockPoisoned(err.to_string())
    }
}

// Helper type alias for Results using AccelForgeError
pub type AccelResult<T> = std::result::Result<T, AccelForgeError>;

/// Create an invalid-argument error with context
///
/// # Examples
/// ```ignore
/// return Err(invalid_argument!("device count must be at least 1"));
/// ```
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::error::AccelForgeError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::AccelForgeError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("dispatch reached an impossible arm"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::AccelForgeError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::AccelForgeError::Internal(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AccelForgeError::UnknownDevice("FPGA".to_string()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            AccelForgeError::RetiredDevice("TPU_LEGACY".to_string()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            AccelForgeError::PluginNotRegistered("TT".to_string()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            AccelForgeError::PluginInit {
                name: "tpu".to_string(),
                detail: "entry returned 3".to_string(),
            }
            .kind(),
            ErrorKind::PluginInit
        );
        assert_eq!(
            AccelForgeError::ClientConstruction {
                platform: "gpu".to_string(),
                detail: "memory fraction out of range".to_string(),
            }
            .kind(),
            ErrorKind::ClientConstruction
        );
        assert_eq!(
            AccelForgeError::Internal("bug".to_string()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_kind_probes() {
        assert!(AccelForgeError::UnknownDevice("X".to_string()).is_invalid_argument());
        assert!(AccelForgeError::PluginInit {
            name: "x".to_string(),
            detail: "failed".to_string(),
        }
        .is_plugin_error());
        assert!(AccelForgeError::LockPoisoned("m".to_string()).is_internal_error());

        assert!(!AccelForgeError::Internal("bug".to_string()).is_invalid_argument());
        assert!(!AccelForgeError::UnknownDevice("X".to_string()).is_plugin_error());
    }

    #[test]
    fn test_error_display() {
        let err = AccelForgeError::UnknownDevice("QUANTUM".to_string());
        assert_eq!(err.to_string(), "Unknown ACCELFORGE_DEVICE: 'QUANTUM'");

        let err = AccelForgeError::RetiredDevice("TPU_LEGACY".to_string());
        assert_eq!(err.to_string(), "TPU_LEGACY client is no longer available.");

        let err = AccelForgeError::ClientConstruction {
            platform: "gpu".to_string(),
            detail: "node_id 4 >= num_nodes 4".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "client construction failed for 'gpu': node_id 4 >= num_nodes 4"
        );
    }

    #[test]
    fn test_macros() {
        let err = invalid_argument!("bad value");
        assert!(matches!(err, AccelForgeError::InvalidArgument(_)));

        let err = invalid_argument!("count: {}", 0);
        assert_eq!(err.to_string(), "invalid argument: count: 0");

        let err = internal_error!("bug");
        assert!(matches!(err, AccelForgeError::Internal(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AccelForgeError = io_err.into();
        assert!(matches!(err, AccelForgeError::IoError(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_poison_error_from_impl_exists() {
        use std::sync::PoisonError;

        fn convert_poison<T>(err: PoisonError<T>) -> AccelForgeError {
            AccelForgeError::from(err)
        }

        let _ = convert_poison::<i32> as fn(PoisonError<i32>) -> AccelForgeError;
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::InvalidArgument.to_string(), "InvalidArgument");
        assert_eq!(ErrorKind::PluginLoad.to_string(), "PluginLoad");
        assert_eq!(ErrorKind::PluginInit.to_string(), "PluginInit");
        assert_eq!(ErrorKind::Coordination.to_string(), "Coordination");
        assert_eq!(
            ErrorKind::ClientConstruction.to_string(),
            "ClientConstruction"
        );
        assert_eq!(ErrorKind::Internal.to_string(), "Internal");
    }
}
