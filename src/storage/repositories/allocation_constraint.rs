//! Allocation constraint repository
//!
//! A constraint reserves `constraint_value` units of one resource (an instance type
//! or an IP block) for its allocation. IP block constraints record the block carved
//! out for the tenant in `derived_resource_id`.

use super::allocation::{self, Allocation};
use super::distinct_ids;
use crate::domain::{parse_status, status_strings, AllocationConstraintType, AllocationResourceType};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_opt_strings, push_opt_uuids};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const ALLOCATION_CONSTRAINT_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("resource_type", "ac.resource_type"),
    OrderField::new("constraint_value", "ac.constraint_value"),
    OrderField::new("created", "ac.created"),
    OrderField::new("updated", "ac.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationConstraintRelation {
    Allocation,
}

/// Database row structure for allocation constraints
#[derive(Debug, Clone, FromRow)]
struct AllocationConstraintRow {
    id: Uuid,
    allocation_id: Uuid,
    resource_type: String,
    resource_type_id: Uuid,
    constraint_type: String,
    constraint_value: i32,
    derived_resource_id: Option<Uuid>,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationConstraint {
    pub id: Uuid,
    pub allocation_id: Uuid,
    pub allocation: Option<Allocation>,
    pub resource_type: AllocationResourceType,
    pub resource_type_id: Uuid,
    pub constraint_type: AllocationConstraintType,
    pub constraint_value: i32,
    pub derived_resource_id: Option<Uuid>,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<AllocationConstraintRow> for AllocationConstraint {
    type Error = ForgeError;

    fn try_from(row: AllocationConstraintRow) -> Result<Self> {
        Ok(Self {
            resource_type: parse_status(&row.resource_type)?,
            constraint_type: parse_status(&row.constraint_type)?,
            id: row.id,
            allocation_id: row.allocation_id,
            allocation: None,
            resource_type_id: row.resource_type_id,
            constraint_value: row.constraint_value,
            derived_resource_id: row.derived_resource_id,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAllocationConstraintRequest {
    pub allocation_id: Uuid,
    pub resource_type: AllocationResourceType,
    pub resource_type_id: Uuid,
    pub constraint_type: AllocationConstraintType,
    pub constraint_value: i32,
    pub derived_resource_id: Option<Uuid>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAllocationConstraintRequest {
    pub resource_type: Option<AllocationResourceType>,
    pub resource_type_id: Option<Uuid>,
    pub constraint_type: Option<AllocationConstraintType>,
    pub constraint_value: Option<i32>,
    pub derived_resource_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationConstraintFilter {
    pub ids: Option<Vec<Uuid>>,
    pub allocation_ids: Option<Vec<Uuid>>,
    pub resource_types: Option<Vec<AllocationResourceType>>,
    pub resource_type_ids: Option<Vec<Uuid>>,
    pub constraint_types: Option<Vec<AllocationConstraintType>>,
    pub derived_resource_ids: Option<Vec<Uuid>>,
}

#[async_trait]
pub trait AllocationConstraintRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateAllocationConstraintRequest,
    ) -> Result<AllocationConstraint>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[AllocationConstraintRelation],
    ) -> Result<AllocationConstraint>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &AllocationConstraintFilter,
        page: &PageInput,
        relations: &[AllocationConstraintRelation],
    ) -> Result<(Vec<AllocationConstraint>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateAllocationConstraintRequest,
    ) -> Result<AllocationConstraint>;
    /// Drop the derived resource reference
    async fn clear_derived_resource(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
    ) -> Result<AllocationConstraint>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxAllocationConstraintRepository {
    pool: DbPool,
}

impl SqlxAllocationConstraintRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load allocation constraints by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, AllocationConstraint>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, AllocationConstraintRow>(
        "SELECT * FROM allocation_constraint WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to load allocation constraints"))?;

    rows.into_iter()
        .map(|row| AllocationConstraint::try_from(row).map(|c| (c.id, c)))
        .collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    constraints: &mut [AllocationConstraint],
    relations: &[AllocationConstraintRelation],
) -> Result<()> {
    if relations.contains(&AllocationConstraintRelation::Allocation) {
        let ids = distinct_ids(constraints.iter().map(|c| c.allocation_id));
        let allocations = allocation::load_by_ids(conn, &ids).await?;
        for constraint in constraints.iter_mut() {
            constraint.allocation = allocations.get(&constraint.allocation_id).cloned();
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[AllocationConstraintRelation],
) -> Result<AllocationConstraint> {
    let row = sqlx::query_as::<_, AllocationConstraintRow>(
        "SELECT * FROM allocation_constraint WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch allocation constraint {}", id)))?
    .ok_or_else(|| ForgeError::not_found("AllocationConstraint", id))?;

    let mut constraints = [AllocationConstraint::try_from(row)?];
    attach_relations(conn, &mut constraints, relations).await?;
    let [constraint] = constraints;
    Ok(constraint)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &AllocationConstraintFilter) {
    push_opt_uuids(qb, "ac.id", &filter.ids);
    push_opt_uuids(qb, "ac.allocation_id", &filter.allocation_ids);
    push_opt_strings(qb, "ac.resource_type", &filter.resource_types.as_deref().map(status_strings));
    push_opt_uuids(qb, "ac.resource_type_id", &filter.resource_type_ids);
    push_opt_strings(
        qb,
        "ac.constraint_type",
        &filter.constraint_types.as_deref().map(status_strings),
    );
    push_opt_uuids(qb, "ac.derived_resource_id", &filter.derived_resource_ids);
}

#[async_trait]
impl AllocationConstraintRepository for SqlxAllocationConstraintRepository {
    #[instrument(skip(self, tx, request), fields(allocation_id = %request.allocation_id, resource_type = %request.resource_type), name = "db_create_allocation_constraint")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateAllocationConstraintRequest,
    ) -> Result<AllocationConstraint> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, AllocationConstraintRow>(
            "INSERT INTO allocation_constraint (id, allocation_id, resource_type, \
             resource_type_id, constraint_type, constraint_value, derived_resource_id, \
             created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(request.allocation_id)
        .bind(request.resource_type.as_str())
        .bind(request.resource_type_id)
        .bind(request.constraint_type.as_str())
        .bind(request.constraint_value)
        .bind(request.derived_resource_id)
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create allocation constraint"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_allocation_constraint_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[AllocationConstraintRelation],
    ) -> Result<AllocationConstraint> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_allocation_constraints")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &AllocationConstraintFilter,
        page: &PageInput,
        relations: &[AllocationConstraintRelation],
    ) -> Result<(Vec<AllocationConstraint>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            ALLOCATION_CONSTRAINT_ORDER_FIELDS,
            "ac.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM allocation_constraint ac WHERE ac.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count allocation constraints"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT ac.* FROM allocation_constraint ac WHERE ac.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<AllocationConstraintRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list allocation constraints"))?;

        let mut constraints =
            rows.into_iter().map(AllocationConstraint::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut constraints, relations).await?;
        Ok((constraints, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_allocation_constraint")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateAllocationConstraintRequest,
    ) -> Result<AllocationConstraint> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE allocation_constraint SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.resource_type {
            set.push("resource_type = ").push_bind_unseparated(v.as_str());
            changed = true;
        }
        if let Some(v) = request.resource_type_id {
            set.push("resource_type_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.constraint_type {
            set.push("constraint_type = ").push_bind_unseparated(v.as_str());
            changed = true;
        }
        if let Some(v) = request.constraint_value {
            set.push("constraint_value = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.derived_resource_id {
            set.push("derived_resource_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update allocation constraint {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("AllocationConstraint", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_clear_allocation_constraint")]
    async fn clear_derived_resource(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
    ) -> Result<AllocationConstraint> {
        let mut conn = acquire(&self.pool, tx).await?;

        let result = sqlx::query(
            "UPDATE allocation_constraint SET derived_resource_id = NULL, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to clear allocation constraint {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("AllocationConstraint", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_allocation_constraint")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE allocation_constraint SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to delete allocation constraint {}", id))
        })?;

        Ok(())
    }
}
