#![cfg_attr(not(feature = "std"), no_std)]
pub mod error;
pub mod model;
pub mod precision;
pub mod registry;

pub use error::{MobileNetError, Result};
pub use model::mobilenet::{MobileNet, MobileNetConfig, NormType};
pub use model::params::{ParamKind, ParamSpec};
pub use precision::{mixed_precision_enabled, set_mixed_precision, MixedPrecisionGuard};
pub use registry::{Backbone, BackboneRegistry, BackboneSpec};

extern crate alloc;
