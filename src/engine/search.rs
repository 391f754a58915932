//! Plain SQL search surface.
//!
//! `Where` fragments are raw SQL with `?` placeholders and typed parameters;
//! soft-deleting entities get an implicit `` `FakeDelete` = 0 `` prefix
//! unless the fragment opts out. The cached-query engine sits on top of
//! [`search_ids`](crate::engine::Engine::search_ids).

use std::sync::Arc;

use crate::engine::read::entity_from_row;
use crate::engine::Engine;
use crate::entity::Entity;
use crate::error::Result;
use crate::schema::EntitySchema;
use crate::value::Value;

/// A parameterized WHERE fragment.
#[derive(Debug, Clone)]
pub struct Where {
    pub(crate) query: String,
    params: Vec<Value>,
    include_fake_deleted: bool,
}

impl Where {
    pub fn new(query: &str, params: Vec<Value>) -> Self {
        Self { query: query.to_string(), params, include_fake_deleted: false }
    }

    /// Matches every row, ordered by ID.
    pub fn all() -> Self {
        Self::new("1 ORDER BY `ID`", Vec::new())
    }

    /// Opt out of the implicit `` `FakeDelete` = 0 `` filter.
    pub fn include_fake_deleted(mut self) -> Self {
        self.include_fake_deleted = true;
        self
    }

    pub(crate) fn sql_params(&self) -> Vec<Option<String>> {
        self.params.iter().map(Value::to_sql_param).collect()
    }

    pub(crate) fn clause_for(&self, schema: &EntitySchema) -> String {
        if schema.has_fake_delete && !self.include_fake_deleted {
            format!("`FakeDelete` = 0 AND {}", self.query)
        } else {
            self.query.clone()
        }
    }
}

/// 1-based pagination window.
#[derive(Debug, Clone, Copy)]
pub struct Pager {
    pub current_page: usize,
    pub page_size: usize,
}

impl Pager {
    pub fn new(current_page: usize, page_size: usize) -> Self {
        Self { current_page: current_page.max(1), page_size }
    }

    pub(crate) fn offset(&self) -> usize {
        (self.current_page - 1) * self.page_size
    }
}

impl Default for Pager {
    fn default() -> Self {
        Self::new(1, 50_000)
    }
}

impl Engine {
    /// Full-row search. The pager defaults to the first 50 000 rows.
    pub async fn search(
        &self,
        entity_name: &str,
        where_: Where,
        pager: Option<Pager>,
    ) -> Result<Vec<Entity>> {
        let schema = self.schema(entity_name)?;
        self.search_with_schema(&schema, &where_, &pager.unwrap_or_default()).await
    }

    /// Full-row search plus the total row count across all pages.
    pub async fn search_with_count(
        &self,
        entity_name: &str,
        where_: Where,
        pager: Pager,
    ) -> Result<(usize, Vec<Entity>)> {
        let schema = self.schema(entity_name)?;
        let entities = self.search_with_schema(&schema, &where_, &pager).await?;
        let total = self.total_rows(&schema, &where_, &pager, entities.len()).await?;
        Ok((total, entities))
    }

    /// Search and warm up the named reference columns (`"*"` for all).
    pub async fn search_with_references(
        &self,
        entity_name: &str,
        where_: Where,
        pager: Option<Pager>,
        references: &[&str],
    ) -> Result<Vec<Entity>> {
        let mut entities = self.search(entity_name, where_, pager).await?;
        self.warm_up_references(&mut entities, references).await?;
        Ok(entities)
    }

    pub async fn search_one(&self, entity_name: &str, where_: Where) -> Result<Option<Entity>> {
        let schema = self.schema(entity_name)?;
        self.search_one_with_schema(&schema, where_).await
    }

    pub async fn search_ids(
        &self,
        entity_name: &str,
        where_: Where,
        pager: Pager,
    ) -> Result<Vec<u64>> {
        let schema = self.schema(entity_name)?;
        Ok(self.search_ids_with_schema(&schema, &where_, &pager, false).await?.0)
    }

    pub async fn search_ids_with_count(
        &self,
        entity_name: &str,
        where_: Where,
        pager: Pager,
    ) -> Result<(Vec<u64>, usize)> {
        let schema = self.schema(entity_name)?;
        self.search_ids_with_schema(&schema, &where_, &pager, true).await
    }

    pub(crate) async fn search_with_schema(
        &self,
        schema: &Arc<EntitySchema>,
        where_: &Where,
        pager: &Pager,
    ) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT {} FROM `{}` WHERE {} LIMIT {},{}",
            schema.select_list(),
            schema.table_name,
            where_.clause_for(schema),
            pager.offset(),
            pager.page_size
        );
        let rows = self.sql(&schema.sql_pool)?.fetch_rows(&sql, &where_.sql_params()).await?;
        rows.iter().map(|row| entity_from_row(schema, row)).collect()
    }

    pub(crate) async fn search_one_with_schema(
        &self,
        schema: &Arc<EntitySchema>,
        where_: Where,
    ) -> Result<Option<Entity>> {
        let sql = format!(
            "SELECT {} FROM `{}` WHERE {} LIMIT 1",
            schema.select_list(),
            schema.table_name,
            where_.clause_for(schema)
        );
        let rows = self.sql(&schema.sql_pool)?.fetch_rows(&sql, &where_.sql_params()).await?;
        rows.first().map(|row| entity_from_row(schema, row)).transpose()
    }

    pub(crate) async fn search_ids_with_schema(
        &self,
        schema: &Arc<EntitySchema>,
        where_: &Where,
        pager: &Pager,
        with_count: bool,
    ) -> Result<(Vec<u64>, usize)> {
        let sql = format!(
            "SELECT CAST(`ID` AS CHAR) FROM `{}` WHERE {} LIMIT {},{}",
            schema.table_name,
            where_.clause_for(schema),
            pager.offset(),
            pager.page_size
        );
        let rows = self.sql(&schema.sql_pool)?.fetch_rows(&sql, &where_.sql_params()).await?;
        let ids: Vec<u64> = rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.as_deref()).and_then(|v| v.parse().ok()))
            .collect();
        let total = if with_count {
            self.total_rows(schema, where_, pager, ids.len()).await?
        } else {
            0
        };
        Ok((ids, total))
    }

    /// Total row count: exact when the page filled up (a `COUNT(1)` query),
    /// otherwise derived from the page position.
    async fn total_rows(
        &self,
        schema: &Arc<EntitySchema>,
        where_: &Where,
        pager: &Pager,
        found: usize,
    ) -> Result<usize> {
        if found == pager.page_size {
            let sql = format!(
                "SELECT CAST(COUNT(1) AS CHAR) FROM `{}` WHERE {}",
                schema.table_name,
                where_.clause_for(schema)
            );
            let total = self.sql(&schema.sql_pool)?.fetch_value(&sql, &where_.sql_params()).await?;
            Ok(total.and_then(|v| v.parse().ok()).unwrap_or(found))
        } else {
            Ok(found + pager.offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, SchemaBuilder, ValidationContext};
    use crate::value::{Column, ColumnKind};

    fn schema(fake_delete: bool) -> EntitySchema {
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
        let mut builder = SchemaBuilder::new("User")
            .column(Column::new("Age", ColumnKind::Uint { bits: 16 }));
        if fake_delete {
            builder = builder.fake_delete();
        }
        EntitySchema::build(&builder.build(), &ctx).unwrap()
    }

    #[test]
    fn test_implicit_fake_delete_filter() {
        let where_ = Where::new("`Age` = ?", vec![Value::Uint(10)]);
        assert_eq!(where_.clause_for(&schema(false)), "`Age` = ?");
        assert_eq!(where_.clause_for(&schema(true)), "`FakeDelete` = 0 AND `Age` = ?");
        let opted_out = where_.include_fake_deleted();
        assert_eq!(opted_out.clause_for(&schema(true)), "`Age` = ?");
    }

    #[test]
    fn test_pager_offsets() {
        assert_eq!(Pager::new(1, 10).offset(), 0);
        assert_eq!(Pager::new(2, 4).offset(), 4);
        // page numbers are 1-based; 0 clamps
        assert_eq!(Pager::new(0, 10).offset(), 0);
    }

    #[test]
    fn test_where_params_encode_canonically() {
        let where_ = Where::new("`A` = ? AND `B` = ?", vec![Value::Uint(10), Value::from("x")]);
        assert_eq!(
            where_.sql_params(),
            vec![Some("10".to_string()), Some("x".to_string())]
        );
    }
}
