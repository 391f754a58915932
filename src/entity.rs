//! In-memory entity instances.
//!
//! An [`Entity`] is one row of one entity type: the user-visible field
//! values plus the `db_data` snapshot of the last-known persisted column
//! strings. The snapshot is what dirty detection diffs against and what
//! cache invalidation derives its pre-image keys from.
//!
//! Instances are owned by the application. The engine borrows them for the
//! duration of a flush and never keeps references across calls.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::schema::EntitySchema;
use crate::value::{RefValue, Value};

/// User-supplied `ON DUPLICATE KEY UPDATE` clause for a single insert.
#[derive(Debug, Clone)]
pub struct OnDuplicateKeyUpdate {
    /// SET fragment, e.g. `` "`Counter` = `Counter` + ?" ``. Empty means the
    /// no-op form `` `ID` = `ID` ``.
    pub assignments: String,
    pub params: Vec<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) schema: Arc<EntitySchema>,
    pub(crate) id: u64,
    /// Field values aligned with `schema.columns`.
    values: Vec<Value>,
    /// column name -> last-known persisted string; `None` is SQL NULL.
    pub(crate) db_data: HashMap<String, Option<String>>,
    pub(crate) loaded: bool,
    pub(crate) delete_requested: bool,
    pub(crate) on_duplicate: Option<OnDuplicateKeyUpdate>,
    /// Warmed references, column name -> loaded entity.
    pub(crate) references: HashMap<String, Entity>,
}

impl Entity {
    pub(crate) fn new(schema: Arc<EntitySchema>) -> Self {
        let values = schema.columns.iter().map(|c| Value::zero(&c.kind)).collect();
        Self {
            schema,
            id: 0,
            values,
            db_data: HashMap::new(),
            loaded: false,
            delete_requested: false,
            on_duplicate: None,
            references: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn entity_name(&self) -> &str {
        &self.schema.name
    }

    /// Primary key; 0 means not yet persisted.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True iff `db_data` reflects a row that exists or was just inserted.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, column: &str) -> Result<&Value> {
        let idx = self.column_index(column)?;
        Ok(&self.values[idx])
    }

    pub fn set(&mut self, column: &str, value: Value) -> Result<()> {
        let idx = self.column_index(column)?;
        self.values[idx] = value;
        Ok(())
    }

    /// Point a reference column at an already-persisted row.
    pub fn set_ref(&mut self, column: &str, id: u64) -> Result<()> {
        self.set(column, Value::Ref(if id == 0 { RefValue::Null } else { RefValue::Id(id) }))
    }

    /// Point a reference column at the not-yet-saved entity sitting at
    /// `batch_index` of the upcoming flush batch. The flush planner persists
    /// that entity first and patches this reference to its assigned ID.
    pub fn set_ref_unsaved(&mut self, column: &str, batch_index: usize) -> Result<()> {
        self.set(column, Value::Ref(RefValue::Unsaved(batch_index)))
    }

    pub(crate) fn value_at(&self, index: usize) -> &Value {
        &self.values[index]
    }

    pub(crate) fn set_value_at(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    /// Request removal on the next flush. Soft-deleting entities toggle
    /// their `FakeDelete` column instead of issuing a DELETE.
    pub fn mark_to_delete(&mut self) {
        if self.schema.has_fake_delete {
            let idx = self
                .schema
                .column_index("FakeDelete")
                .expect("fake-delete schema always carries the synthetic column");
            self.values[idx] = Value::Bool(true);
            return;
        }
        self.delete_requested = true;
    }

    /// Request a hard DELETE even when the entity soft-deletes.
    pub fn force_mark_to_delete(&mut self) {
        self.delete_requested = true;
    }

    pub fn is_marked_to_delete(&self) -> bool {
        self.delete_requested
    }

    pub fn set_on_duplicate_key_update(&mut self, update: OnDuplicateKeyUpdate) {
        self.on_duplicate = Some(update);
    }

    /// A reference entity warmed up by a search or load with references.
    pub fn reference(&self, column: &str) -> Option<&Entity> {
        self.references.get(column)
    }

    fn column_index(&self, column: &str) -> Result<usize> {
        self.schema.column_index(column).ok_or_else(|| EngineError::UnknownColumn {
            entity: self.schema.name.clone(),
            column: column.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityDef, EntitySchema, SchemaBuilder, ValidationContext};
    use crate::value::{Column, ColumnKind};

    fn build(def: EntityDef) -> Arc<EntitySchema> {
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
        Arc::new(EntitySchema::build(&def, &ctx).unwrap())
    }

    fn user_schema(fake_delete: bool) -> Arc<EntitySchema> {
        let mut builder = SchemaBuilder::new("UserEntity")
            .column(Column::new("Name", ColumnKind::String { length: Some(100) }))
            .column(Column::new("Age", ColumnKind::Uint { bits: 16 }));
        if fake_delete {
            builder = builder.fake_delete();
        }
        build(builder.build())
    }

    #[test]
    fn test_new_entity_has_zero_values() {
        let entity = user_schema(false).new_entity();
        assert_eq!(entity.id(), 0);
        assert!(!entity.is_loaded());
        assert_eq!(entity.get("Name").unwrap(), &Value::String(String::new()));
        assert_eq!(entity.get("Age").unwrap(), &Value::Uint(0));
    }

    #[test]
    fn test_set_and_get() {
        let mut entity = user_schema(false).new_entity();
        entity.set("Name", Value::from("a")).unwrap();
        assert_eq!(entity.get("Name").unwrap(), &Value::String("a".to_string()));
        assert!(entity.set("Nope", Value::from("x")).is_err());
    }

    #[test]
    fn test_mark_to_delete_hard() {
        let mut entity = user_schema(false).new_entity();
        entity.mark_to_delete();
        assert!(entity.is_marked_to_delete());
    }

    #[test]
    fn test_mark_to_delete_soft_toggles_fake_delete() {
        let mut entity = user_schema(true).new_entity();
        entity.mark_to_delete();
        assert!(!entity.is_marked_to_delete());
        assert_eq!(entity.get("FakeDelete").unwrap(), &Value::Bool(true));

        let mut hard = user_schema(true).new_entity();
        hard.force_mark_to_delete();
        assert!(hard.is_marked_to_delete());
    }

    #[test]
    fn test_ref_setters() {
        let schema = build(
            SchemaBuilder::new("E")
                .column(Column::new("Parent", ColumnKind::Ref { target: "E".to_string() }))
                .build(),
        );
        let mut entity = schema.new_entity();
        entity.set_ref("Parent", 5).unwrap();
        assert_eq!(entity.get("Parent").unwrap(), &Value::Ref(RefValue::Id(5)));
        entity.set_ref("Parent", 0).unwrap();
        assert_eq!(entity.get("Parent").unwrap(), &Value::Ref(RefValue::Null));
        entity.set_ref_unsaved("Parent", 2).unwrap();
        assert_eq!(entity.get("Parent").unwrap(), &Value::Ref(RefValue::Unsaved(2)));
    }
}
