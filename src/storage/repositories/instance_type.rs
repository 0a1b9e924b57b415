//! Instance type repository
//!
//! An instance type names a class of machine a provider offers, optionally scoped
//! to a single site.

use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use super::site::{self, Site};
use crate::domain::{parse_status, status_strings, InstanceTypeStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const INSTANCE_TYPE_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "it.name"),
    OrderField::new("status", "it.status"),
    OrderField::new("created", "it.created"),
    OrderField::new("updated", "it.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceTypeRelation {
    InfrastructureProvider,
    Site,
}

/// Database row structure for instance types
#[derive(Debug, Clone, FromRow)]
struct InstanceTypeRow {
    id: Uuid,
    name: String,
    display_name: Option<String>,
    description: Option<String>,
    controller_machine_type: Option<String>,
    infrastructure_provider_id: Uuid,
    site_id: Option<Uuid>,
    version: Option<String>,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub controller_machine_type: Option<String>,
    pub infrastructure_provider_id: Uuid,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub site_id: Option<Uuid>,
    pub site: Option<Site>,
    pub version: Option<String>,
    pub status: InstanceTypeStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceTypeRow> for InstanceType {
    type Error = ForgeError;

    fn try_from(row: InstanceTypeRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            controller_machine_type: row.controller_machine_type,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            site_id: row.site_id,
            site: None,
            version: row.version,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceTypeRequest {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub controller_machine_type: Option<String>,
    pub infrastructure_provider_id: Uuid,
    pub site_id: Option<Uuid>,
    pub version: Option<String>,
    pub status: InstanceTypeStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInstanceTypeRequest {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub controller_machine_type: Option<String>,
    pub version: Option<String>,
    pub status: Option<InstanceTypeStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceTypeFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<InstanceTypeStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait InstanceTypeRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateInstanceTypeRequest,
    ) -> Result<InstanceType>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[InstanceTypeRelation],
    ) -> Result<InstanceType>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InstanceTypeFilter,
        page: &PageInput,
        relations: &[InstanceTypeRelation],
    ) -> Result<(Vec<InstanceType>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInstanceTypeRequest,
    ) -> Result<InstanceType>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxInstanceTypeRepository {
    pool: DbPool,
}

impl SqlxInstanceTypeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load instance types by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, InstanceType>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows =
        sqlx::query_as::<_, InstanceTypeRow>("SELECT * FROM instance_type WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to load instance types"))?;

    rows.into_iter().map(|row| InstanceType::try_from(row).map(|t| (t.id, t))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    types: &mut [InstanceType],
    relations: &[InstanceTypeRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            InstanceTypeRelation::InfrastructureProvider => {
                let ids = distinct_ids(types.iter().map(|t| t.infrastructure_provider_id));
                let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
                for it in types.iter_mut() {
                    it.infrastructure_provider =
                        providers.get(&it.infrastructure_provider_id).cloned();
                }
            }
            InstanceTypeRelation::Site => {
                let ids = distinct_ids(types.iter().filter_map(|t| t.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for it in types.iter_mut() {
                    it.site = it.site_id.and_then(|id| sites.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[InstanceTypeRelation],
) -> Result<InstanceType> {
    let row = sqlx::query_as::<_, InstanceTypeRow>(
        "SELECT * FROM instance_type WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch instance type {}", id)))?
    .ok_or_else(|| ForgeError::not_found("InstanceType", id))?;

    let mut types = [InstanceType::try_from(row)?];
    attach_relations(conn, &mut types, relations).await?;
    let [it] = types;
    Ok(it)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &InstanceTypeFilter) {
    push_opt_uuids(qb, "it.id", &filter.ids);
    push_opt_strings(qb, "it.name", &filter.names);
    push_opt_uuids(qb, "it.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_uuids(qb, "it.site_id", &filter.site_ids);
    push_opt_strings(qb, "it.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["it.name", "it.display_name", "it.description"],
        &["it.name", "it.display_name"],
    );
}

#[async_trait]
impl InstanceTypeRepository for SqlxInstanceTypeRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name), name = "db_create_instance_type")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateInstanceTypeRequest,
    ) -> Result<InstanceType> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, InstanceTypeRow>(
            "INSERT INTO instance_type (id, name, display_name, description, \
             controller_machine_type, infrastructure_provider_id, site_id, version, status, \
             created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.display_name)
        .bind(&request.description)
        .bind(&request.controller_machine_type)
        .bind(request.infrastructure_provider_id)
        .bind(request.site_id)
        .bind(&request.version)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create instance type"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_instance_type_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[InstanceTypeRelation],
    ) -> Result<InstanceType> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_instance_types")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InstanceTypeFilter,
        page: &PageInput,
        relations: &[InstanceTypeRelation],
    ) -> Result<(Vec<InstanceType>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            INSTANCE_TYPE_ORDER_FIELDS,
            "it.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM instance_type it WHERE it.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count instance types"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT it.* FROM instance_type it WHERE it.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<InstanceTypeRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list instance types"))?;

        let mut types = rows.into_iter().map(InstanceType::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut types, relations).await?;
        Ok((types, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_instance_type")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInstanceTypeRequest,
    ) -> Result<InstanceType> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE instance_type SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.name {
            set.push("name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.display_name {
            set.push("display_name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.description {
            set.push("description = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.controller_machine_type {
            set.push("controller_machine_type = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.version {
            set.push("version = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.status {
            set.push("status = ").push_bind_unseparated(v.as_str());
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to update instance type {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("InstanceType", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_instance_type")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE instance_type SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete instance type {}", id)))?;

        Ok(())
    }
}

#[cfg(all(test, feature = "postgres_tests"))]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{TestDatabase, TEST_PROVIDER_ID, TEST_SITE_ID, TEST_USER_ID};

    fn request(name: &str) -> CreateInstanceTypeRequest {
        CreateInstanceTypeRequest {
            name: name.to_string(),
            display_name: Some(format!("{} display", name)),
            description: Some("general purpose".to_string()),
            controller_machine_type: Some("x86_64".to_string()),
            infrastructure_provider_id: TEST_PROVIDER_ID,
            site_id: Some(TEST_SITE_ID),
            version: Some("1.0".to_string()),
            status: InstanceTypeStatus::Pending,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_crud_with_relations() {
        let db = TestDatabase::new("instance_type_crud").await;
        let repo = SqlxInstanceTypeRepository::new(db.pool.clone());

        let created = repo.create(None, request("sm.x86")).await.unwrap();
        let mut global = request("lg.x86");
        global.site_id = None;
        let global = repo.create(None, global).await.unwrap();

        let loaded = repo
            .get_by_id(
                None,
                created.id,
                &[InstanceTypeRelation::Site, InstanceTypeRelation::InfrastructureProvider],
            )
            .await
            .unwrap();
        assert_eq!(loaded.site.as_ref().map(|s| s.id), Some(TEST_SITE_ID));
        assert_eq!(loaded.infrastructure_provider.as_ref().map(|p| p.id), Some(TEST_PROVIDER_ID));

        let (types, _) = repo
            .get_all(None, &Default::default(), &PageInput::default(), &[InstanceTypeRelation::Site])
            .await
            .unwrap();
        let unscoped = types.iter().find(|t| t.id == global.id).unwrap();
        assert!(unscoped.site.is_none());

        let ready = repo
            .update(
                None,
                created.id,
                UpdateInstanceTypeRequest {
                    status: Some(InstanceTypeStatus::Ready),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ready.status, InstanceTypeStatus::Ready);

        let filter = InstanceTypeFilter {
            statuses: Some(vec![InstanceTypeStatus::Ready]),
            ..Default::default()
        };
        let (types, total) = repo.get_all(None, &filter, &PageInput::default(), &[]).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(types[0].id, created.id);

        repo.delete(None, created.id).await.unwrap();
        assert!(repo.get_by_id(None, created.id, &[]).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unknown_site_is_foreign_key_violation() {
        let db = TestDatabase::new("instance_type_fk").await;
        let repo = SqlxInstanceTypeRepository::new(db.pool.clone());

        let mut bad = request("orphan");
        bad.site_id = Some(Uuid::new_v4());
        assert!(repo.create(None, bad).await.unwrap_err().is_foreign_key_violation());
    }
}
