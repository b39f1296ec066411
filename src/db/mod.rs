pub mod postgres;

pub use postgres::PostgresLedger;
