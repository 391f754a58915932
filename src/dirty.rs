//! Dirty tracking: diffing an entity against its `db_data` snapshot.
//!
//! The diff produces a [`BindMap`] — the changed columns only, in
//! declaration order, already in canonical string form. The same map is
//! bound into the SQL statement and used to scope cache invalidation, so
//! whatever the codec says is "equal" never reaches the database.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::entity::Entity;
use crate::error::Result;
use crate::schema::EntitySchema;
use crate::value::encode;

/// column name -> serialized value; `None` is an explicit SQL NULL.
pub type BindMap = IndexMap<String, Option<String>>;

/// Negative-cache sentinel: a row key holding this literal means the ID is
/// known absent.
pub const NIL_SENTINEL: &str = "nil";

/// Compute the dirty bit and bind map of one entity.
///
/// Entities marked for deletion are always dirty and bind their full
/// snapshot (the pre-image drives cache invalidation). Otherwise columns are
/// scanned in declaration order and a column enters the map iff its
/// canonical encoding differs from the snapshot entry; a missing snapshot
/// entry equals NULL.
pub fn dirty_bind(entity: &Entity) -> Result<(bool, BindMap)> {
    if entity.delete_requested {
        let mut bind = BindMap::new();
        for column in entity.schema.persisted_columns() {
            bind.insert(
                column.name.clone(),
                entity.db_data.get(&column.name).cloned().flatten(),
            );
        }
        return Ok((true, bind));
    }

    let has_old = !entity.db_data.is_empty();
    let mut bind = BindMap::new();
    for (idx, column) in entity.schema.columns.iter().enumerate() {
        if column.is_ignored() {
            continue;
        }
        let encoded = encode(column, entity.value_at(idx), entity.id)?;
        if has_old {
            let old = entity.db_data.get(&column.name).cloned().flatten();
            if old == encoded {
                continue;
            }
        }
        bind.insert(column.name.clone(), encoded);
    }
    Ok((!bind.is_empty(), bind))
}

/// Fold a successfully-flushed bind map back into the snapshot. After this
/// the entity is clean and counts as loaded.
pub(crate) fn inject_bind(entity: &mut Entity, bind: &BindMap) {
    for (column, value) in bind {
        entity.db_data.insert(column.clone(), value.clone());
    }
    entity.loaded = true;
}

/// Cached row envelope: the persisted column values in declaration order.
/// JSON keeps the codec round-trip intact for arbitrary payloads; the row
/// key carries the ID.
pub(crate) fn encode_row(
    schema: &EntitySchema,
    db_data: &HashMap<String, Option<String>>,
) -> Result<String> {
    let row: Vec<Option<&String>> = schema
        .persisted_columns()
        .map(|c| db_data.get(&c.name).and_then(|v| v.as_ref()))
        .collect();
    Ok(serde_json::to_string(&row)?)
}

pub(crate) fn decode_row(raw: &str) -> Result<Vec<Option<String>>> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, SchemaBuilder, ValidationContext};
    use crate::value::{Column, ColumnKind, Value};
    use std::sync::Arc;

    fn schema(fake_delete: bool) -> Arc<EntitySchema> {
        fn yes(_: &str) -> bool {
            true
        }
        let ctx = ValidationContext {
            entities: &yes,
            enums: &yes,
            sql_pools: &yes,
            local_pools: &yes,
            redis_pools: &yes,
            dirty_sinks: &yes,
        };
        let mut builder = SchemaBuilder::new("UserEntity")
            .column(Column::new("Name", ColumnKind::String { length: Some(100) }))
            .column(Column::new("Age", ColumnKind::Uint { bits: 16 }))
            .column(Column::new("Born", ColumnKind::Year))
            .column(Column::new("Parent", ColumnKind::Ref { target: "UserEntity".to_string() }));
        if fake_delete {
            builder = builder.fake_delete();
        }
        Arc::new(EntitySchema::build(&builder.build(), &ctx).unwrap())
    }

    #[test]
    fn test_fresh_entity_binds_every_column() {
        let mut entity = schema(false).new_entity();
        entity.set("Name", Value::from("a")).unwrap();
        let (dirty, bind) = dirty_bind(&entity).unwrap();
        assert!(dirty);
        let keys: Vec<&String> = bind.keys().collect();
        assert_eq!(keys, vec!["Name", "Age", "Born", "Parent"]);
        assert_eq!(bind["Name"].as_deref(), Some("a"));
        assert_eq!(bind["Age"].as_deref(), Some("0"));
        assert_eq!(bind["Born"], None);
        assert_eq!(bind["Parent"], None);
    }

    #[test]
    fn test_clean_after_inject() {
        let mut entity = schema(false).new_entity();
        entity.set("Name", Value::from("a")).unwrap();
        entity.set("Age", Value::Uint(10)).unwrap();
        let (_, bind) = dirty_bind(&entity).unwrap();
        inject_bind(&mut entity, &bind);
        assert!(entity.is_loaded());
        let (dirty, bind) = dirty_bind(&entity).unwrap();
        assert!(!dirty, "unexpected dirty columns: {:?}", bind);
    }

    #[test]
    fn test_only_changed_columns_bind() {
        let mut entity = schema(false).new_entity();
        let (_, bind) = dirty_bind(&entity).unwrap();
        inject_bind(&mut entity, &bind);

        entity.set("Age", Value::Uint(18)).unwrap();
        let (dirty, bind) = dirty_bind(&entity).unwrap();
        assert!(dirty);
        assert_eq!(bind.len(), 1);
        assert_eq!(bind["Age"].as_deref(), Some("18"));
    }

    #[test]
    fn test_null_collapse_edges() {
        let mut entity = schema(false).new_entity();
        // snapshot holds NULLs for year and reference
        entity.db_data.insert("Name".to_string(), None);
        entity.db_data.insert("Age".to_string(), Some("0".to_string()));
        entity.db_data.insert("Born".to_string(), None);
        entity.db_data.insert("Parent".to_string(), None);
        entity.loaded = true;
        // zero year and reference 0 both encode to NULL: not dirty
        let (dirty, bind) = dirty_bind(&entity).unwrap();
        assert!(!dirty, "unexpected dirty columns: {:?}", bind);
    }

    #[test]
    fn test_fake_delete_toggle_binds_row_id() {
        let mut entity = schema(true).new_entity();
        entity.id = 9;
        let (_, bind) = dirty_bind(&entity).unwrap();
        inject_bind(&mut entity, &bind);

        entity.mark_to_delete();
        let (dirty, bind) = dirty_bind(&entity).unwrap();
        assert!(dirty);
        assert_eq!(bind.len(), 1);
        assert_eq!(bind["FakeDelete"].as_deref(), Some("9"));
    }

    #[test]
    fn test_delete_binds_snapshot() {
        let mut entity = schema(false).new_entity();
        entity.db_data.insert("Name".to_string(), Some("a".to_string()));
        entity.db_data.insert("Age".to_string(), Some("10".to_string()));
        entity.loaded = true;
        entity.force_mark_to_delete();
        let (dirty, bind) = dirty_bind(&entity).unwrap();
        assert!(dirty);
        assert_eq!(bind["Name"].as_deref(), Some("a"));
        assert_eq!(bind["Age"].as_deref(), Some("10"));
    }

    #[test]
    fn test_row_envelope_roundtrip() {
        let schema = schema(false);
        let mut db_data = HashMap::new();
        db_data.insert("Name".to_string(), Some("a|b,c\"d".to_string()));
        db_data.insert("Age".to_string(), Some("10".to_string()));
        db_data.insert("Born".to_string(), None);
        let encoded = encode_row(&schema, &db_data).unwrap();
        let decoded = decode_row(&encoded).unwrap();
        assert_eq!(
            decoded,
            vec![Some("a|b,c\"d".to_string()), Some("10".to_string()), None, None]
        );
    }
}
