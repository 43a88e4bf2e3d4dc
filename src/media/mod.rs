//! FLV tag conventions and codec parameter parsing

pub mod aac;
pub mod flv;
pub mod h264;

pub use aac::AudioSpecificConfig;
pub use h264::{AvcConfig, SpsInfo};
