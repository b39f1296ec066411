// Order execution and price resolution module
pub mod executor;
pub mod oracle;
pub mod sizing;

pub use executor::Executor;
pub use oracle::PriceOracle;
pub use sizing::{size_order, SizingError};
