mod platform_model;
mod platform_traits;

pub use platform_model::*;
pub use platform_traits::*;
