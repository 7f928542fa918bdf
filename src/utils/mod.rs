pub mod constants;
pub mod yaml_utils;

pub use constants::*;
