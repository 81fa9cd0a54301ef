// ============================================================================
// In-memory SQL backend
// ============================================================================
//
// A small serializable SQL store used by the demo binary and the tests.
// Statements are parsed with sqlparser into a compact AST, evaluated against
// versioned tables, and committed with optimistic validation: a transaction
// whose reads were invalidated by a concurrent commit fails with SQLSTATE
// 40001, exactly what the retry executor is built to absorb.
//
// ============================================================================

pub mod ast;
mod database;
mod eval;
mod exec;
pub mod parser;
mod storage;
mod transaction;

pub use database::{MemoryDatabase, MemorySession};
pub use parser::SqlParserAdapter;
