pub mod error;
pub mod value;

pub use error::{DbError, Result, SqlState};
pub use value::{DataType, Value};

pub type Row = Vec<Value>;
