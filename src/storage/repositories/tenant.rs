//! Tenant repository

use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const TENANT_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "tn.name"),
    OrderField::new("org", "tn.org"),
    OrderField::new("created", "tn.created"),
    OrderField::new("updated", "tn.updated"),
];

/// Per-tenant feature switches, stored as camelCase JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantConfig {
    pub enable_ssh_access: bool,
    pub targeted_instance_creation: bool,
}

/// Database row structure for tenants. `config` is stored as jsonb
#[derive(Debug, Clone, FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    display_name: Option<String>,
    org: String,
    org_display_name: Option<String>,
    config: Json<TenantConfig>,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub org: String,
    pub org_display_name: Option<String>,
    pub config: TenantConfig,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            org: row.org,
            org_display_name: row.org_display_name,
            config: row.config.0,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub display_name: Option<String>,
    pub org: String,
    pub org_display_name: Option<String>,
    pub config: Option<TenantConfig>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub org_display_name: Option<String>,
    pub config: Option<TenantConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub orgs: Option<Vec<String>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateTenantRequest) -> Result<Tenant>;
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<Tenant>;
    async fn get_all_by_org(&self, tx: Option<&mut Tx>, org: &str) -> Result<Vec<Tenant>>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &TenantFilter,
        page: &PageInput,
    ) -> Result<(Vec<Tenant>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateTenantRequest,
    ) -> Result<Tenant>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxTenantRepository {
    pool: DbPool,
}

impl SqlxTenantRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load tenants by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Tenant>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenant WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load tenants"))?;

    Ok(rows.into_iter().map(|row| (row.id, Tenant::from(row))).collect())
}

async fn fetch_one(conn: &mut PgConnection, id: Uuid) -> Result<Tenant> {
    sqlx::query_as::<_, TenantRow>("SELECT * FROM tenant WHERE id = $1 AND deleted IS NULL")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to fetch tenant {}", id)))?
        .map(Tenant::from)
        .ok_or_else(|| ForgeError::not_found("Tenant", id))
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TenantFilter) {
    push_opt_uuids(qb, "tn.id", &filter.ids);
    push_opt_strings(qb, "tn.name", &filter.names);
    push_opt_strings(qb, "tn.org", &filter.orgs);
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["tn.name", "tn.display_name", "tn.org_display_name"],
        &["tn.name", "tn.display_name", "tn.org_display_name"],
    );
}

#[async_trait]
impl TenantRepository for SqlxTenantRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, org = %request.org), name = "db_create_tenant")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateTenantRequest) -> Result<Tenant> {
        let mut conn = acquire(&self.pool, tx).await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, TenantRow>(
            "INSERT INTO tenant \
             (id, name, display_name, org, org_display_name, config, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.display_name)
        .bind(&request.org)
        .bind(&request.org_display_name)
        .bind(Json(request.config.clone().unwrap_or_default()))
        .bind(request.created_by)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create tenant"))?;

        Ok(row.into())
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_tenant_by_id")]
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<Tenant> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id).await
    }

    #[instrument(skip(self, tx), fields(org = %org), name = "db_get_all_tenants_by_org")]
    async fn get_all_by_org(&self, tx: Option<&mut Tx>, org: &str) -> Result<Vec<Tenant>> {
        let mut conn = acquire(&self.pool, tx).await?;

        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT * FROM tenant WHERE org = $1 AND deleted IS NULL ORDER BY created ASC, id ASC",
        )
        .bind(org)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to list tenants for {}", org)))?;

        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_tenants")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &TenantFilter,
        page: &PageInput,
    ) -> Result<(Vec<Tenant>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), TENANT_ORDER_FIELDS, "tn.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tenant tn WHERE tn.deleted IS NULL");
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count tenants"))?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT tn.* FROM tenant tn WHERE tn.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<TenantRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list tenants"))?;

        Ok((rows.into_iter().map(Tenant::from).collect(), total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_tenant")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateTenantRequest,
    ) -> Result<Tenant> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE tenant SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(name) = request.name {
            set.push("name = ").push_bind_unseparated(name);
            changed = true;
        }
        if let Some(display_name) = request.display_name {
            set.push("display_name = ").push_bind_unseparated(display_name);
            changed = true;
        }
        if let Some(org_display_name) = request.org_display_name {
            set.push("org_display_name = ").push_bind_unseparated(org_display_name);
            changed = true;
        }
        if let Some(config) = request.config {
            set.push("config = ").push_bind_unseparated(Json(config));
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to update tenant {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Tenant", id));
        }

        fetch_one(&mut conn, id).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_tenant")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE tenant SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete tenant {}", id)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serializes_camel_case() {
        let config = TenantConfig { enable_ssh_access: true, targeted_instance_creation: false };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"enableSshAccess": true, "targetedInstanceCreation": false})
        );

        let empty: TenantConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, TenantConfig::default());
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::{TestDatabase, TEST_TENANT_ID, TEST_USER_ID};

        #[tokio::test]
        async fn test_create_update_config() {
            let db = TestDatabase::new("tenant_config").await;
            let repo = SqlxTenantRepository::new(db.pool.clone());

            let created = repo
                .create(
                    None,
                    CreateTenantRequest {
                        name: "acme".to_string(),
                        org: "acme-org".to_string(),
                        created_by: TEST_USER_ID,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(created.config, TenantConfig::default());

            let updated = repo
                .update(
                    None,
                    created.id,
                    UpdateTenantRequest {
                        config: Some(TenantConfig {
                            enable_ssh_access: true,
                            targeted_instance_creation: true,
                        }),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(updated.config.enable_ssh_access);
            assert!(updated.config.targeted_instance_creation);

            let stored: serde_json::Value =
                sqlx::query_scalar("SELECT config FROM tenant WHERE id = $1")
                    .bind(created.id)
                    .fetch_one(&db.pool)
                    .await
                    .unwrap();
            assert_eq!(stored["enableSshAccess"], serde_json::Value::Bool(true));
        }

        #[tokio::test]
        async fn test_get_all_by_org_excludes_deleted() {
            let db = TestDatabase::new("tenant_by_org").await;
            let repo = SqlxTenantRepository::new(db.pool.clone());

            let tenants = repo.get_all_by_org(None, "test-org").await.unwrap();
            assert_eq!(tenants.iter().map(|t| t.id).collect::<Vec<_>>(), vec![TEST_TENANT_ID]);

            let extra = repo
                .create(
                    None,
                    CreateTenantRequest {
                        name: "second".to_string(),
                        org: "test-org".to_string(),
                        created_by: TEST_USER_ID,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(repo.get_all_by_org(None, "test-org").await.unwrap().len(), 2);

            repo.delete(None, extra.id).await.unwrap();
            assert_eq!(repo.get_all_by_org(None, "test-org").await.unwrap().len(), 1);

            let (rows, total) = repo
                .get_all(
                    None,
                    &TenantFilter { search_query: Some("Test Org".to_string()), ..Default::default() },
                    &PageInput::default(),
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].id, TEST_TENANT_ID);
        }
    }
}
