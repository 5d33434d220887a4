//! End-to-end scenarios against a real database file: DDL, DML, plans
//! that should (or should not) touch indexes, transactions, and reopen
//! behavior.

use pretty_assertions::assert_eq;

use minisql::ast::{
    AnalyzeStmt, CmpOp, Condition, CreateIndexStmt, CreateTableStmt, DeleteStmt, DropTableStmt,
    InsertStmt, Join, JoinKind, OneOrMore, Operand, OrderBy, Projection, SelectStmt, Statement,
    UpdateStmt,
};
use minisql::catalog::ColumnDef;
use minisql::{Database, Error, Row, SqlType, SqlValue};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_db(dir: &tempfile::TempDir) -> Database {
    init_logging();
    let path = dir.path().join("test.db");
    Database::open(path.to_str().unwrap()).expect("Should have opened database.")
}

fn pk_autoinc(name: &str, sql_type: SqlType) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        sql_type,
        primary_key: true,
        autoincrement: true,
        unique: false,
        nullable: false,
    }
}

fn pk(name: &str, sql_type: SqlType) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        sql_type,
        primary_key: true,
        autoincrement: false,
        unique: false,
        nullable: false,
    }
}

fn unique(name: &str, sql_type: SqlType) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        sql_type,
        primary_key: false,
        autoincrement: false,
        unique: true,
        nullable: true,
    }
}

/// `users(id INT8 PK AUTOINC, email VARCHAR(255) UNIQUE, age INT4 NULL)`.
fn create_users(db: &Database) {
    db.execute(&Statement::CreateTable(CreateTableStmt {
        table: String::from("users"),
        columns: vec![
            pk_autoinc("id", SqlType::Int8),
            unique("email", SqlType::Varchar(255)),
            ColumnDef::new("age", SqlType::Int4),
        ],
    }))
    .expect("Should have created users.");
}

fn insert_users(db: &Database, n: i64) {
    let values: Vec<Vec<SqlValue>> = (1..=n)
        .map(|i| {
            vec![
                SqlValue::Null,
                SqlValue::Text(format!("u_{}@x", i)),
                SqlValue::Int4((i % 80) as i32),
            ]
        })
        .collect();
    let result = db
        .execute(&Statement::Insert(InsertStmt {
            table: String::from("users"),
            columns: vec![],
            values,
        }))
        .expect("Should have inserted rows.");
    assert_eq!(result.rows_affected, n as u64);
}

fn count(db: &Database, table: &str) -> i64 {
    let mut stmt = SelectStmt::on(table);
    stmt.projection = Projection::CountStar;
    let rows = rows_of(db, stmt);
    match rows[0].items[0] {
        SqlValue::Int8(n) => n,
        ref other => panic!("count returned {:?}", other),
    }
}

fn rows_of(db: &Database, stmt: SelectStmt) -> Vec<Row> {
    db.execute(&Statement::Select(stmt))
        .expect("Should have executed select.")
        .map(|r| r.unwrap())
        .collect()
}

#[test]
fn test_s1_autoincrement_count_and_point_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 100);

    assert_eq!(count(&db, "users"), 100);

    let mut stmt = SelectStmt::on("users");
    stmt.projection = Projection::Columns(vec![String::from("id")]);
    stmt.conditions = OneOrMore::single_group(vec![Condition::eq(
        "email",
        SqlValue::Text(String::from("u_37@x")),
    )]);
    let rows = rows_of(&db, stmt);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].items, vec![SqlValue::Int8(37)]);
}

#[test]
fn test_s2_order_by_pk_desc_limit() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 100);

    let mut stmt = SelectStmt::on("users");
    stmt.projection = Projection::Columns(vec![String::from("id")]);
    stmt.order_by = vec![OrderBy {
        field: String::from("id"),
        desc: true,
    }];
    stmt.limit = Some(SqlValue::Int4(5));
    let rows = rows_of(&db, stmt);
    let ids: Vec<SqlValue> = rows.into_iter().map(|r| r.items[0].clone()).collect();
    assert_eq!(
        ids,
        (96..=100).rev().map(SqlValue::Int8).collect::<Vec<_>>()
    );
}

#[test]
fn test_s3_composite_pk_analyze_and_prefix_scan() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    db.execute(&Statement::CreateTable(CreateTableStmt {
        table: String::from("addr"),
        columns: vec![
            pk("country", SqlType::Varchar(8)),
            pk("city", SqlType::Varchar(32)),
            pk("street", SqlType::Varchar(64)),
        ],
    }))
    .unwrap();

    // 100 rows; 2 distinct countries, 10 (country, city) pairs, 100
    // full keys.
    let values: Vec<Vec<SqlValue>> = (0..100)
        .map(|i| {
            vec![
                SqlValue::Text(format!("C{}", i % 2)),
                SqlValue::Text(format!("T{}", i % 10)),
                SqlValue::Text(format!("S{:03}", i)),
            ]
        })
        .collect();
    db.execute(&Statement::Insert(InsertStmt {
        table: String::from("addr"),
        columns: vec![],
        values,
    }))
    .unwrap();

    db.execute(&Statement::Analyze(AnalyzeStmt {
        table: String::from("addr"),
    }))
    .unwrap();

    let mut stats = SelectStmt::on("minisql_stat");
    stats.conditions = OneOrMore::single_group(vec![Condition::eq(
        "tbl",
        SqlValue::Text(String::from("addr")),
    )]);
    let rows = rows_of(&db, stats);
    let mut vals: Vec<String> = rows
        .iter()
        .map(|r| match &r.items[2] {
            SqlValue::Text(s) => s.clone(),
            other => panic!("stat value {:?}", other),
        })
        .collect();
    vals.sort();
    assert_eq!(vals, vec![String::from("100"), String::from("100 2 10 100")]);

    // The country prefix resolves through the composite index.
    let mut stmt = SelectStmt::on("addr");
    stmt.conditions = OneOrMore::single_group(vec![Condition::eq(
        "country",
        SqlValue::Text(String::from("C0")),
    )]);
    let rows = rows_of(&db, stmt);
    assert_eq!(rows.len(), 50);
    assert!(rows
        .iter()
        .all(|r| r.items[0] == SqlValue::Text(String::from("C0"))));
}

#[test]
fn test_s4_non_unique_index_stats_and_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    db.execute(&Statement::CreateTable(CreateTableStmt {
        table: String::from("events"),
        columns: vec![
            pk_autoinc("id", SqlType::Int8),
            ColumnDef::new("created", SqlType::Timestamp),
        ],
    }))
    .unwrap();
    db.execute(&Statement::CreateIndex(CreateIndexStmt {
        name: String::from("events_created"),
        table: String::from("events"),
        columns: vec![String::from("created")],
        unique: false,
    }))
    .unwrap();

    // 100 rows, every 10 share a timestamp.
    let values: Vec<Vec<SqlValue>> = (0..100)
        .map(|i| {
            vec![
                SqlValue::Null,
                SqlValue::Text(format!("2024-01-{:02} 00:00:00", (i / 10) + 1)),
            ]
        })
        .collect();
    db.execute(&Statement::Insert(InsertStmt {
        table: String::from("events"),
        columns: vec![],
        values,
    }))
    .unwrap();

    db.execute(&Statement::Analyze(AnalyzeStmt {
        table: String::from("events"),
    }))
    .unwrap();

    let mut stats = SelectStmt::on("minisql_stat");
    stats.conditions = OneOrMore::single_group(vec![Condition::eq(
        "idx",
        SqlValue::Text(String::from("events_created")),
    )]);
    let rows = rows_of(&db, stats);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].items[2], SqlValue::Text(String::from("100 10")));

    let mut stmt = SelectStmt::on("events");
    stmt.conditions = OneOrMore::single_group(vec![Condition::eq(
        "created",
        SqlValue::Text(String::from("2024-01-03 00:00:00")),
    )]);
    assert_eq!(rows_of(&db, stmt).len(), 10);
}

#[test]
fn test_s5_rollback_discards_and_journal_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 10);

    db.execute(&Statement::Begin).unwrap();
    insert_users(&db, 50);
    assert_eq!(count(&db, "users"), 60, "uncommitted rows visible inside");
    db.execute(&Statement::Rollback).unwrap();

    assert_eq!(count(&db, "users"), 10);
    let journal = dir.path().join("test.db.journal");
    if journal.exists() {
        assert_eq!(std::fs::metadata(&journal).unwrap().len(), 0);
    }
}

#[test]
fn test_s6_first_committer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 5);

    let mut t1 = db.begin();
    let mut t2 = db.begin();

    // t1 reads the table's pages...
    let mut read = SelectStmt::on("users");
    read.projection = Projection::CountStar;
    db.execute_in(&mut t1, &Statement::Select(read)).unwrap();

    // ...t2 rewrites them and commits first.
    db.execute_in(
        &mut t2,
        &Statement::Insert(InsertStmt {
            table: String::from("users"),
            columns: vec![],
            values: vec![vec![
                SqlValue::Null,
                SqlValue::Text(String::from("t2@x")),
                SqlValue::Null,
            ]],
        }),
    )
    .unwrap();
    db.commit(&mut t2).unwrap();

    // t1's own write now fails validation at commit.
    db.execute_in(
        &mut t1,
        &Statement::Insert(InsertStmt {
            table: String::from("users"),
            columns: vec![],
            values: vec![vec![
                SqlValue::Null,
                SqlValue::Text(String::from("t1@x")),
                SqlValue::Null,
            ]],
        }),
    )
    .unwrap();
    let err = db.commit(&mut t1).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {:?}", err);

    // Only t2's row landed.
    assert_eq!(count(&db, "users"), 6);
}

#[test]
fn test_committed_data_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.db");
    {
        let db = open_db(&dir);
        create_users(&db);
        insert_users(&db, 25);
        db.close()?;
    }
    let db = Database::open(path.to_str().unwrap())?;
    assert_eq!(count(&db, "users"), 25);

    // And the reopened file keeps serving index lookups.
    let mut stmt = SelectStmt::on("users");
    stmt.conditions = OneOrMore::single_group(vec![Condition::eq(
        "email",
        SqlValue::Text(String::from("u_7@x")),
    )]);
    assert_eq!(rows_of(&db, stmt).len(), 1);
    Ok(())
}

#[test]
fn test_update_and_delete_with_where() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 20);

    let updated = db
        .execute(&Statement::Update(UpdateStmt {
            table: String::from("users"),
            set: vec![(String::from("age"), SqlValue::Int4(99))],
            conditions: OneOrMore::single_group(vec![Condition::new(
                "id",
                CmpOp::Le,
                Operand::Literal(SqlValue::Int8(5)),
            )]),
        }))
        .unwrap();
    assert_eq!(updated.rows_affected, 5);

    let mut check = SelectStmt::on("users");
    check.conditions = OneOrMore::single_group(vec![Condition::eq(
        "age",
        SqlValue::Int4(99),
    )]);
    assert_eq!(rows_of(&db, check).len(), 5);

    let deleted = db
        .execute(&Statement::Delete(DeleteStmt {
            table: String::from("users"),
            conditions: OneOrMore::single_group(vec![Condition::eq(
                "age",
                SqlValue::Int4(99),
            )]),
        }))
        .unwrap();
    assert_eq!(deleted.rows_affected, 5);
    assert_eq!(count(&db, "users"), 15);
}

#[test]
fn test_or_groups_and_in_list() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 30);

    // id IN (1, 2, 3) OR email = 'u_10@x': point scans on two indexes.
    let mut stmt = SelectStmt::on("users");
    stmt.projection = Projection::Columns(vec![String::from("id")]);
    stmt.conditions = OneOrMore(vec![
        vec![Condition::new(
            "id",
            CmpOp::In,
            Operand::List(vec![
                SqlValue::Int8(1),
                SqlValue::Int8(2),
                SqlValue::Int8(3),
            ]),
        )],
        vec![Condition::eq(
            "email",
            SqlValue::Text(String::from("u_10@x")),
        )],
    ]);
    let mut ids: Vec<i64> = rows_of(&db, stmt)
        .into_iter()
        .map(|r| match r.items[0] {
            SqlValue::Int8(n) => n,
            ref other => panic!("{:?}", other),
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 10]);
}

#[test]
fn test_is_null_and_not_null() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    db.execute(&Statement::Insert(InsertStmt {
        table: String::from("users"),
        columns: vec![String::from("email")],
        values: vec![
            vec![SqlValue::Text(String::from("only-email@x"))],
        ],
    }))
    .unwrap();
    insert_users(&db, 3);

    let mut null_age = SelectStmt::on("users");
    null_age.conditions = OneOrMore::single_group(vec![Condition::new(
        "age",
        CmpOp::IsNull,
        Operand::Null,
    )]);
    assert_eq!(rows_of(&db, null_age).len(), 1);

    let mut with_age = SelectStmt::on("users");
    with_age.conditions = OneOrMore::single_group(vec![Condition::new(
        "age",
        CmpOp::IsNotNull,
        Operand::Null,
    )]);
    assert_eq!(rows_of(&db, with_age).len(), 3);
}

#[test]
fn test_text_overflow_round_trip_via_sql() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    db.execute(&Statement::CreateTable(CreateTableStmt {
        table: String::from("notes"),
        columns: vec![
            pk_autoinc("id", SqlType::Int8),
            ColumnDef::new("body", SqlType::Text),
        ],
    }))
    .unwrap();

    // Spans three overflow pages.
    let body = "lorem ipsum ".repeat(800);
    db.execute(&Statement::Insert(InsertStmt {
        table: String::from("notes"),
        columns: vec![],
        values: vec![vec![SqlValue::Null, SqlValue::Text(body.clone())]],
    }))
    .unwrap();

    let rows = rows_of(&db, SelectStmt::on("notes"));
    assert_eq!(rows[0].items[1], SqlValue::Text(body));
}

#[test]
fn test_inner_and_left_join() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 3);
    db.execute(&Statement::CreateTable(CreateTableStmt {
        table: String::from("orders"),
        columns: vec![
            pk_autoinc("id", SqlType::Int8),
            ColumnDef::new("user_id", SqlType::Int8),
            ColumnDef::new("amount", SqlType::Int4),
        ],
    }))
    .unwrap();
    db.execute(&Statement::Insert(InsertStmt {
        table: String::from("orders"),
        columns: vec![String::from("user_id"), String::from("amount")],
        values: vec![
            vec![SqlValue::Int8(1), SqlValue::Int4(10)],
            vec![SqlValue::Int8(1), SqlValue::Int4(20)],
            vec![SqlValue::Int8(2), SqlValue::Int4(30)],
        ],
    }))
    .unwrap();

    let join = |kind: JoinKind| {
        let mut stmt = SelectStmt::on("users");
        stmt.alias = Some(String::from("u"));
        stmt.projection = Projection::Columns(vec![
            String::from("u.id"),
            String::from("o.amount"),
        ]);
        stmt.joins = vec![Join {
            table: String::from("orders"),
            alias: Some(String::from("o")),
            kind,
            on: vec![Condition {
                operand1: Operand::Field(String::from("u.id")),
                op: CmpOp::Eq,
                operand2: Operand::Field(String::from("o.user_id")),
            }],
        }];
        stmt
    };

    let inner = rows_of(&db, join(JoinKind::Inner));
    assert_eq!(inner.len(), 3);

    let left = rows_of(&db, join(JoinKind::Left));
    assert_eq!(left.len(), 4);
    let unmatched: Vec<&Row> = left
        .iter()
        .filter(|r| r.items[1] == SqlValue::Null)
        .collect();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].items[0], SqlValue::Int8(3));
}

#[test]
fn test_sorted_limit_equals_full_sort_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 50);

    let order = vec![OrderBy {
        field: String::from("age"),
        desc: false,
    }];
    let mut full = SelectStmt::on("users");
    full.projection = Projection::Columns(vec![String::from("age"), String::from("id")]);
    full.order_by = order.clone();
    let all = rows_of(&db, full);

    // The top-N heap path must agree with the full sort.
    let mut limited = SelectStmt::on("users");
    limited.projection = Projection::Columns(vec![String::from("age"), String::from("id")]);
    limited.order_by = order;
    limited.limit = Some(SqlValue::Int4(7));
    limited.offset = Some(SqlValue::Int4(3));
    let top = rows_of(&db, limited);

    assert_eq!(top.len(), 7);
    for (i, row) in top.iter().enumerate() {
        assert_eq!(row.items[0], all[i + 3].items[0]);
    }
}

#[test]
fn test_drop_table_removes_catalog_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 10);
    db.execute(&Statement::Analyze(AnalyzeStmt {
        table: String::from("users"),
    }))
    .unwrap();

    db.execute(&Statement::DropTable(DropTableStmt {
        table: String::from("users"),
    }))
    .unwrap();

    let err = db
        .execute(&Statement::Select(SelectStmt::on("users")))
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // Its statistics went with it.
    let mut stats = SelectStmt::on("minisql_stat");
    stats.conditions = OneOrMore::single_group(vec![Condition::eq(
        "tbl",
        SqlValue::Text(String::from("users")),
    )]);
    assert_eq!(rows_of(&db, stats).len(), 0);

    // The name is reusable.
    create_users(&db);
    assert_eq!(count(&db, "users"), 0);
}

#[test]
fn test_range_scan_between_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    create_users(&db);
    insert_users(&db, 40);

    let mut stmt = SelectStmt::on("users");
    stmt.projection = Projection::Columns(vec![String::from("id")]);
    stmt.conditions = OneOrMore::single_group(vec![
        Condition::new("id", CmpOp::Gt, Operand::Literal(SqlValue::Int8(10))),
        Condition::new("id", CmpOp::Le, Operand::Literal(SqlValue::Int8(15))),
    ]);
    let mut ids: Vec<i64> = rows_of(&db, stmt)
        .into_iter()
        .map(|r| match r.items[0] {
            SqlValue::Int8(n) => n,
            ref other => panic!("{:?}", other),
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![11, 12, 13, 14, 15]);
}
