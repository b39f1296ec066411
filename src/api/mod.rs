pub mod exchange;

pub use exchange::{ExchangeClient, ExchangeError};
