use std::path::PathBuf;

use thiserror::Error;

/// Closed error taxonomy for the core components (gadget backends, worker,
/// mode registry, policy resolver). Process-boundary code (`main`, the
/// message-bus adapter's outward-facing glue) uses `anyhow::Result` instead.
#[derive(Error, Debug)]
pub enum UsbModedError {
    #[error("failed to write {path:?}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path:?}: {reason}")]
    ConfigMalformed { path: PathBuf, reason: String },

    #[error("no usable USB gadget backend found (neither android_usb nor configfs)")]
    BackendUnavailable,

    #[error("unknown mode: {0}")]
    UnknownMode(String),

    #[error("mode export denied: {0}")]
    PolicyDenied(&'static str),
}

pub type Result<T> = std::result::Result<T, UsbModedError>;

impl UsbModedError {
    pub fn transient_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UsbModedError::TransientIo {
            path: path.into(),
            source,
        }
    }
}
