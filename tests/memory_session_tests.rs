/// In-memory backend tests
///
/// SQL surface and transaction semantics of `MemorySession`.
/// Run with: cargo test --test memory_session_tests

use tokio_test::{assert_err, assert_ok};
use txretry::{DbError, MemoryDatabase, MemorySession, Session, Value};

async fn session_with_products() -> (MemoryDatabase, MemorySession) {
    let db = MemoryDatabase::new();
    let mut session = db.session();
    assert_ok!(
        session
            .execute(
                "CREATE TABLE products (sku TEXT PRIMARY KEY, price FLOAT NOT NULL, stock INT, active BOOLEAN)",
                &[],
            )
            .await
    );
    assert_ok!(
        session
            .execute(
                "INSERT INTO products VALUES ('a-1', 9.5, 10, true), ('b-2', 20, 0, false), ('c-3', 3.25, NULL, true)",
                &[],
            )
            .await
    );
    (db, session)
}

#[tokio::test]
async fn test_select_where_order_limit() {
    let (_db, mut session) = session_with_products().await;

    let result = assert_ok!(
        session
            .execute(
                "SELECT sku, price FROM products WHERE active = true AND price > $1 ORDER BY price DESC LIMIT 1",
                &[Value::Float(1.0)],
            )
            .await
    );
    assert_eq!(result.columns, vec!["sku", "price"]);
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.get(0, "sku").unwrap(), &Value::Text("a-1".into()));

    // Integers stored in FLOAT columns come back as floats.
    let result = assert_ok!(
        session
            .execute("SELECT price FROM products WHERE sku = 'b-2'", &[])
            .await
    );
    assert_eq!(result.get(0, "price").unwrap(), &Value::Float(20.0));
}

#[tokio::test]
async fn test_null_handling() {
    let (_db, mut session) = session_with_products().await;

    let result = assert_ok!(
        session
            .execute("SELECT sku FROM products WHERE stock IS NULL", &[])
            .await
    );
    assert_eq!(result.row_count(), 1);

    // Comparisons with NULL are unknown and filter the row out.
    let result = assert_ok!(
        session
            .execute("SELECT sku FROM products WHERE stock > 5 OR stock < 5", &[])
            .await
    );
    assert_eq!(result.row_count(), 2);

    let err = assert_err!(
        session
            .execute("UPDATE products SET price = NULL WHERE sku = 'a-1'", &[])
            .await
    );
    assert!(matches!(err, DbError::ConstraintViolation(_)));
}

#[tokio::test]
async fn test_update_and_delete_report_affected_rows() {
    let (_db, mut session) = session_with_products().await;

    let updated = assert_ok!(
        session
            .execute("UPDATE products SET stock = stock + 1 WHERE active = true", &[])
            .await
    );
    assert_eq!(updated.affected_rows, 2);

    let result = assert_ok!(
        session
            .execute("SELECT stock FROM products WHERE sku = 'a-1'", &[])
            .await
    );
    assert_eq!(result.get_i64(0, "stock").unwrap(), Some(11));

    let deleted = assert_ok!(
        session
            .execute("DELETE FROM products WHERE stock IS NULL OR stock = 0", &[])
            .await
    );
    assert_eq!(deleted.affected_rows, 2);

    let none = assert_ok!(
        session
            .execute("UPDATE products SET stock = 0 WHERE sku = $1", &[Value::from("zzz")])
            .await
    );
    assert_eq!(none.affected_rows, 0);
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let (_db, mut session) = session_with_products().await;

    assert_ok!(session.begin().await);
    assert_ok!(session.execute("DELETE FROM products", &[]).await);
    let inside = assert_ok!(session.execute("SELECT * FROM products", &[]).await);
    assert!(inside.is_empty());
    assert_ok!(session.rollback().await);

    let after = assert_ok!(session.execute("SELECT * FROM products", &[]).await);
    assert_eq!(after.row_count(), 3);
    assert_eq!(after.columns, vec!["sku", "price", "stock", "active"]);
}

#[tokio::test]
async fn test_ddl_statements() {
    let db = MemoryDatabase::new();
    let mut session = db.session();

    assert_ok!(session.execute("CREATE TABLE t (id INT PRIMARY KEY)", &[]).await);
    assert_ok!(
        session
            .execute("CREATE TABLE IF NOT EXISTS t (id INT PRIMARY KEY)", &[])
            .await
    );
    let err = assert_err!(session.execute("CREATE TABLE t (id INT)", &[]).await);
    assert_eq!(err.sql_state().code(), "42P07");
    let err = assert_err!(session.execute("INSERT INTO missing VALUES (1)", &[]).await);
    assert_eq!(err.sql_state().code(), "42P01");
    assert_eq!(db.table_names().await, vec!["t"]);
}

#[tokio::test]
async fn test_tables_without_primary_key_allow_duplicates() {
    let db = MemoryDatabase::new();
    let mut session = db.session();

    assert_ok!(session.execute("CREATE TABLE events (kind TEXT)", &[]).await);
    assert_ok!(
        session
            .execute("INSERT INTO events VALUES ('x'), ('x'), ($1)", &[Value::from("y")])
            .await
    );
    let result = assert_ok!(
        session
            .execute("SELECT kind FROM events WHERE kind = 'x'", &[])
            .await
    );
    assert_eq!(result.row_count(), 2);
}

#[tokio::test]
async fn test_parse_and_bind_errors() {
    let (_db, mut session) = session_with_products().await;

    let err = assert_err!(session.execute("SELEKT * FROM products", &[]).await);
    assert_eq!(err.sql_state().code(), "42601");

    let err = assert_err!(
        session
            .execute("SELECT * FROM products WHERE sku = $2", &[Value::from("a-1")])
            .await
    );
    assert!(matches!(err, DbError::ExecutionError(_)));

    let err = assert_err!(
        session
            .execute("SELECT * FROM products WHERE price > 'cheap'", &[])
            .await
    );
    assert!(matches!(err, DbError::TypeMismatch(_)));
}

#[tokio::test]
async fn test_sessions_see_only_committed_data() {
    let (db, mut writer) = session_with_products().await;
    let mut reader = db.session();

    assert_ok!(writer.begin().await);
    assert_ok!(
        writer
            .execute("INSERT INTO products VALUES ('d-4', 1.0, 1, true)", &[])
            .await
    );

    let before = assert_ok!(reader.execute("SELECT * FROM products", &[]).await);
    assert_eq!(before.row_count(), 3);

    assert_ok!(writer.commit().await);
    let after = assert_ok!(reader.execute("SELECT * FROM products", &[]).await);
    assert_eq!(after.row_count(), 4);
}

#[tokio::test]
async fn test_concurrent_inserts_of_same_key_conflict() {
    let db = MemoryDatabase::new();
    let mut a = db.session();
    let mut b = db.session();
    assert_ok!(a.execute("CREATE TABLE t (id INT PRIMARY KEY, v INT)", &[]).await);

    assert_ok!(a.begin().await);
    assert_ok!(b.begin().await);
    assert_ok!(a.execute("INSERT INTO t VALUES (1, 1)", &[]).await);
    assert_ok!(b.execute("INSERT INTO t VALUES (1, 2)", &[]).await);

    assert_ok!(a.commit().await);
    let err = assert_err!(b.commit().await);
    assert!(err.is_serialization_failure());
    assert_eq!(err.sql_state().code(), "40001");
}
