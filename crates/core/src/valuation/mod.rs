mod price_resolver;
mod replay;
mod valuation_model;
mod valuation_service;
mod valuation_service_tests;
mod valuation_traits;

pub use price_resolver::*;
pub use valuation_model::*;
pub use valuation_service::*;
pub use valuation_traits::*;
