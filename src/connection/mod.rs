pub mod config;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use config::ClientConfig;
#[cfg(feature = "postgres")]
pub use postgres::map_pg_error;
