//! Generated Postgres-dialect SQL executed against an in-memory SQLite
//! database. The subset emitted here (double-quoted identifiers, CTEs,
//! CREATE VIEW/TABLE AS) is understood by both.

use std::sync::Arc;

use proptest::prelude::*;
use rusqlite::Connection;
use sm_dialect::Dialect;
use sm_generator::{to_sql, to_sql_materialized_nodes};
use sm_model::{Materialization, SqlModel, SqlModelBuilder};

fn value_model(key: &str, value: i64) -> Arc<SqlModel> {
    SqlModelBuilder::new("ValueModel", "select {key} as key, {val} as value")
        .placeholder("key", format!("'{key}'"))
        .placeholder("val", value)
        .build()
        .unwrap()
}

fn add_value(input: Arc<SqlModel>, value: i64) -> Arc<SqlModel> {
    SqlModelBuilder::new("RefValueModel", "select key, value + {val} as value from {{ref}}")
        .placeholder("val", value)
        .reference("ref", input)
        .build()
        .unwrap()
}

fn query_value(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get::<_, i64>("value"))
        .unwrap()
}

#[test]
fn chained_models_add_up() {
    let vm1 = value_model("a", 1);
    let rvm1 = add_value(vm1, 5);
    let rvm2 = add_value(rvm1, 10);

    let sql = to_sql(Dialect::Postgres, &rvm2).unwrap();
    let conn = Connection::open_in_memory().unwrap();
    let (key, value): (String, i64) = conn
        .query_row(&sql, [], |row| Ok((row.get("key")?, row.get("value")?)))
        .unwrap();
    assert_eq!(key, "a");
    assert_eq!(value, 16);
}

#[test]
fn view_and_table_are_created_before_the_join() {
    let vm1 = value_model("a", 1)
        .copy_set_materialization(Materialization::View)
        .copy_set_materialization_name("vm1");
    let vm2 = value_model("a", 2)
        .copy_set_materialization(Materialization::Table)
        .copy_set_materialization_name("vm2");
    let join = SqlModelBuilder::new(
        "JoinModel",
        "select l.key, l.value + r.value as value from {{left}} l join {{right}} r on l.key = r.key",
    )
    .reference("left", vm1)
    .reference("right", vm2)
    .build()
    .unwrap();

    let statements = to_sql_materialized_nodes(Dialect::Postgres, &join, true).unwrap();
    assert_eq!(statements.len(), 3);
    assert_eq!(statements[0].materialization, Materialization::View);
    assert_eq!(statements[1].materialization, Materialization::Table);
    assert_eq!(statements[2].materialization, Materialization::Query);

    let conn = Connection::open_in_memory().unwrap();
    for statement in &statements[..2] {
        conn.execute_batch(&statement.sql).unwrap();
    }
    assert_eq!(query_value(&conn, &statements[2].sql), 3);
    // The persisted objects are real.
    assert_eq!(query_value(&conn, "select value from \"vm2\""), 2);
}

#[test]
fn shared_subquery_is_defined_once() {
    let shared = SqlModelBuilder::new("Shared", "select 'shared-marker' as tag, 7 as value")
        .build()
        .unwrap();
    let branches: Vec<Arc<SqlModel>> = (1..=5).map(|step| add_value(shared.clone(), step)).collect();

    let mut builder = SqlModelBuilder::new(
        "Sum",
        "select b1.value + b2.value + b3.value + b4.value + b5.value as value \
         from {{b1}} b1, {{b2}} b2, {{b3}} b3, {{b4}} b4, {{b5}} b5",
    );
    for (index, branch) in branches.into_iter().enumerate() {
        builder = builder.reference(format!("b{}", index + 1), branch);
    }
    let root = builder.build().unwrap();

    let sql = to_sql(Dialect::Postgres, &root).unwrap();
    assert_eq!(sql.matches("shared-marker").count(), 1);

    let conn = Connection::open_in_memory().unwrap();
    assert_eq!(query_value(&conn, &sql), 5 * 7 + (1 + 2 + 3 + 4 + 5));
}

#[test]
fn exponential_paths_give_linear_output() {
    let mut node = SqlModelBuilder::new("Leaf", "select 'leaf-marker' as tag, 1 as value")
        .build()
        .unwrap();
    for _ in 0..20 {
        node = SqlModelBuilder::new(
            "Join",
            "select l.value + r.value as value from {{l}} l, {{r}} r",
        )
        .reference("l", node.clone())
        .reference("r", node)
        .build()
        .unwrap();
    }

    let sql = to_sql(Dialect::Postgres, &node).unwrap();
    assert!(sql.len() < 6000, "output grew to {} chars", sql.len());
    assert_eq!(sql.matches("leaf-marker").count(), 1);

    let conn = Connection::open_in_memory().unwrap();
    assert_eq!(query_value(&conn, &sql), 1 << 20);
}

#[test]
fn sources_with_references_stay_linear() {
    let mut node = SqlModelBuilder::new("Table", "{table}")
        .placeholder("table", "\"t\"")
        .materialization(Materialization::Source)
        .build()
        .unwrap();
    for _ in 0..14 {
        node = SqlModelBuilder::new(
            "Doubled",
            "select l.value + r.value as value from {{l}} l, {{r}} r",
        )
        .reference("l", node.clone())
        .reference("r", node)
        .materialization(Materialization::Source)
        .build()
        .unwrap();
    }
    let root = SqlModelBuilder::new("Result", "select value from {{input}}")
        .reference("input", node)
        .build()
        .unwrap();

    let sql = to_sql(Dialect::Postgres, &root).unwrap();
    assert!(sql.len() < 6000, "output grew to {} chars", sql.len());

    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("create table t (value integer); insert into t values (1);")
        .unwrap();
    assert_eq!(query_value(&conn, &sql), 1 << 14);
}

#[test]
fn cte_and_view_copies_of_one_node_merge() {
    let base = value_model("a", 4);
    let root = SqlModelBuilder::new(
        "SelfJoin",
        "select l.value * r.value as value from {{l}} l join {{r}} r on l.key = r.key",
    )
    .reference("l", base.clone())
    .reference("r", base.copy_set_materialization(Materialization::View))
    .build()
    .unwrap();

    let sql = to_sql(Dialect::Postgres, &root).unwrap();
    let conn = Connection::open_in_memory().unwrap();
    assert_eq!(query_value(&conn, &sql), 16);

    let statements = to_sql_materialized_nodes(Dialect::Postgres, &root, true).unwrap();
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0].materialization, Materialization::View);
    conn.execute_batch(&statements[0].sql).unwrap();
    assert_eq!(query_value(&conn, &statements[1].sql), 16);
}

#[test]
fn same_name_same_body_merges() {
    let make = || {
        value_model("a", 3)
            .copy_set_materialization_name("shared_values")
    };
    let root = SqlModelBuilder::new(
        "SelfJoin",
        "select l.value * r.value as value from {{l}} l join {{r}} r on l.key = r.key",
    )
    .reference("l", make())
    .reference("r", make())
    .build()
    .unwrap();

    let sql = to_sql(Dialect::Postgres, &root).unwrap();
    assert_eq!(sql.matches("\"shared_values\" as (").count(), 1);
    let conn = Connection::open_in_memory().unwrap();
    assert_eq!(query_value(&conn, &sql), 9);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn chain_sum_matches_graph(start in -1000i64..1000, steps in prop::collection::vec(-1000i64..1000, 0..12)) {
        let mut node = value_model("k", start);
        for step in &steps {
            node = add_value(node, *step);
        }
        let sql = to_sql(Dialect::Postgres, &node).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        prop_assert_eq!(query_value(&conn, &sql), start + steps.iter().sum::<i64>());
    }
}
