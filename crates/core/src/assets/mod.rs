mod asset_model;
mod asset_traits;

pub use asset_model::*;
pub use asset_traits::*;
