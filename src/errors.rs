//! Error Types
//!
//! The main error type [`EmberError`] covers the failure modes of the device
//! backend and the streaming subsystem. All public APIs that can fail return
//! [`Result<T>`], an alias for `std::result::Result<T, EmberError>`.
//!
//! Note that the device worker and the command executor never propagate
//! errors out of a submission: per-opcode failures are localized to the
//! affected object or draw and logged. The variants here cover the
//! construction paths and the content pipeline.

use thiserror::Error;

use crate::device::handle::ObjectId;

/// The main error type for the Ember runtime.
#[derive(Error, Debug)]
pub enum EmberError {
    // ========================================================================
    // GPU & Device Errors
    // ========================================================================
    /// Failed to request a compatible GPU adapter.
    #[error("Failed to request WGPU adapter: {0}")]
    AdapterRequestFailed(String),

    /// Failed to create the GPU device.
    #[error("Failed to create WGPU device: {0}")]
    DeviceCreateFailed(#[from] wgpu::RequestDeviceError),

    /// The object registry is full.
    #[error("Object registry is out of slots (capacity {capacity})")]
    RegistryFull {
        /// Configured slot capacity
        capacity: u32,
    },

    /// A handle did not resolve to a live object of the expected kind.
    #[error("Stale or mismatched object handle: {0}")]
    StaleHandle(ObjectId),

    /// Output window could not be prepared for rendering.
    #[error("Output window prepare failed")]
    OutputPrepareFailed,

    // ========================================================================
    // Content & Streaming Errors
    // ========================================================================
    /// Compressed island payload could not be decompressed.
    #[error("Island decompression failed: {0}")]
    IslandDecompress(String),

    /// Island entity payload could not be deserialized.
    #[error("Island decode failed: {0}")]
    IslandDecode(String),

    /// A persisted scene/sector container had a bad magic tag or version.
    #[error("Bad container header: expected {expected}, found {found}")]
    BadContainerHeader {
        /// Expected fourCC tag
        expected: String,
        /// Tag found in the file
        found: String,
    },

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Base64 decoding error.
    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    /// File I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Alias for `Result<T, EmberError>`.
pub type Result<T> = std::result::Result<T, EmberError>;
