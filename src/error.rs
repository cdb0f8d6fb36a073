use alloc::string::String;
use thiserror::Error;

/// Errors raised while configuring or assembling a backbone.
#[derive(Error, Debug)]
pub enum MobileNetError {
    /// The width scale factor is not a positive finite number.
    #[error("Invalid width scale factor: {scale}")]
    InvalidScale { scale: f64 },

    /// A layer ends up with no channels after width scaling.
    #[error("Layer {layer} has zero channels at width scale {scale}")]
    ZeroChannels { layer: String, scale: f64 },

    /// The extra block channel list does not describe the extra stages.
    #[error("Invalid extra block filters: {reason}")]
    ExtraBlockFilters { reason: String },

    /// No factory is registered under the requested name.
    #[error("Unknown backbone: {name}")]
    UnknownBackbone { name: String },

    /// The component configuration could not be decoded.
    #[error("Invalid backbone configuration: {reason}")]
    Config { reason: String },
}

pub type Result<T> = core::result::Result<T, MobileNetError>;
