pub mod conv_norm;
pub mod extra_block;
pub mod mobilenet;
pub mod params;
pub mod separable;
mod utils;
