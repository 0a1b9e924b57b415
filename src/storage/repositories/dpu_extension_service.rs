//! DPU extension service repository
//!
//! An extension service is a tenant-defined workload for the DPUs of one site.
//! Deployments of it onto individual instances live in
//! [`dpu_extension_service_deployment`](super::dpu_extension_service_deployment).

use super::distinct_ids;
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use crate::domain::{parse_status, status_strings, DpuExtensionServiceStatus};
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

pub const DPU_EXTENSION_SERVICE_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "des.name"),
    OrderField::new("status", "des.status"),
    OrderField::new("created", "des.created"),
    OrderField::new("updated", "des.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpuExtensionServiceRelation {
    Site,
    Tenant,
}

/// Database row structure for DPU extension services
#[derive(Debug, Clone, FromRow)]
struct DpuExtensionServiceRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    service_type: String,
    site_id: Uuid,
    tenant_id: Uuid,
    version: Option<String>,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpuExtensionService {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub service_type: String,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub version: Option<String>,
    pub status: DpuExtensionServiceStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<DpuExtensionServiceRow> for DpuExtensionService {
    type Error = ForgeError;

    fn try_from(row: DpuExtensionServiceRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            service_type: row.service_type,
            site_id: row.site_id,
            site: None,
            tenant_id: row.tenant_id,
            tenant: None,
            version: row.version,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDpuExtensionServiceRequest {
    pub name: String,
    pub description: Option<String>,
    pub service_type: String,
    pub site_id: Uuid,
    pub tenant_id: Uuid,
    pub version: Option<String>,
    pub status: DpuExtensionServiceStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDpuExtensionServiceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub service_type: Option<String>,
    pub version: Option<String>,
    pub status: Option<DpuExtensionServiceStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DpuExtensionServiceFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub service_types: Option<Vec<String>>,
    pub versions: Option<Vec<String>>,
    pub statuses: Option<Vec<DpuExtensionServiceStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait DpuExtensionServiceRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateDpuExtensionServiceRequest,
    ) -> Result<DpuExtensionService>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[DpuExtensionServiceRelation],
    ) -> Result<DpuExtensionService>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &DpuExtensionServiceFilter,
        page: &PageInput,
        relations: &[DpuExtensionServiceRelation],
    ) -> Result<(Vec<DpuExtensionService>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateDpuExtensionServiceRequest,
    ) -> Result<DpuExtensionService>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxDpuExtensionServiceRepository {
    pool: DbPool,
}

impl SqlxDpuExtensionServiceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load services by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, DpuExtensionService>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, DpuExtensionServiceRow>(
        "SELECT * FROM dpu_extension_service WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to load DPU extension services"))?;

    rows.into_iter().map(|row| DpuExtensionService::try_from(row).map(|s| (s.id, s))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    services: &mut [DpuExtensionService],
    relations: &[DpuExtensionServiceRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            DpuExtensionServiceRelation::Site => {
                let ids = distinct_ids(services.iter().map(|s| s.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for service in services.iter_mut() {
                    service.site = sites.get(&service.site_id).cloned();
                }
            }
            DpuExtensionServiceRelation::Tenant => {
                let ids = distinct_ids(services.iter().map(|s| s.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for service in services.iter_mut() {
                    service.tenant = tenants.get(&service.tenant_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[DpuExtensionServiceRelation],
) -> Result<DpuExtensionService> {
    let row = sqlx::query_as::<_, DpuExtensionServiceRow>(
        "SELECT * FROM dpu_extension_service WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch DPU extension service {}", id)))?
    .ok_or_else(|| ForgeError::not_found("DpuExtensionService", id))?;

    let mut services = [DpuExtensionService::try_from(row)?];
    attach_relations(conn, &mut services, relations).await?;
    let [service] = services;
    Ok(service)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &DpuExtensionServiceFilter) {
    push_opt_uuids(qb, "des.id", &filter.ids);
    push_opt_strings(qb, "des.name", &filter.names);
    push_opt_uuids(qb, "des.site_id", &filter.site_ids);
    push_opt_uuids(qb, "des.tenant_id", &filter.tenant_ids);
    push_opt_strings(qb, "des.service_type", &filter.service_types);
    push_opt_strings(qb, "des.version", &filter.versions);
    push_opt_strings(qb, "des.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["des.name", "des.description", "des.service_type", "des.status"],
        &["des.name", "des.description", "des.service_type", "des.status"],
    );
}

#[async_trait]
impl DpuExtensionServiceRepository for SqlxDpuExtensionServiceRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, site_id = %request.site_id), name = "db_create_dpu_extension_service")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateDpuExtensionServiceRequest,
    ) -> Result<DpuExtensionService> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, DpuExtensionServiceRow>(
            "INSERT INTO dpu_extension_service (id, name, description, service_type, site_id, \
             tenant_id, version, status, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.service_type)
        .bind(request.site_id)
        .bind(request.tenant_id)
        .bind(&request.version)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create DPU extension service"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_dpu_extension_service_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[DpuExtensionServiceRelation],
    ) -> Result<DpuExtensionService> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_dpu_extension_services")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &DpuExtensionServiceFilter,
        page: &PageInput,
        relations: &[DpuExtensionServiceRelation],
    ) -> Result<(Vec<DpuExtensionService>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            DPU_EXTENSION_SERVICE_ORDER_FIELDS,
            "des.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM dpu_extension_service des WHERE des.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count DPU extension services"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT des.* FROM dpu_extension_service des WHERE des.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<DpuExtensionServiceRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list DPU extension services"))?;

        let mut services =
            rows.into_iter().map(DpuExtensionService::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut services, relations).await?;
        Ok((services, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_dpu_extension_service")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateDpuExtensionServiceRequest,
    ) -> Result<DpuExtensionService> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE dpu_extension_service SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.name {
            set.push("name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.description {
            set.push("description = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.service_type {
            set.push("service_type = ").push_bind_unseparated(v);
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

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update DPU extension service {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("DpuExtensionService", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_dpu_extension_service")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE dpu_extension_service SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete DPU extension service {}", id)))?;

        Ok(())
    }
}

#[cfg(all(test, feature = "postgres_tests"))]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{TestDatabase, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID};

    fn request(name: &str, service_type: &str) -> CreateDpuExtensionServiceRequest {
        CreateDpuExtensionServiceRequest {
            name: name.to_string(),
            description: Some(format!("{} on the DPU", name)),
            service_type: service_type.to_string(),
            site_id: TEST_SITE_ID,
            tenant_id: TEST_TENANT_ID,
            version: Some("1.0.0".to_string()),
            status: DpuExtensionServiceStatus::Pending,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_filters_relations_and_lifecycle() {
        let db = TestDatabase::new("dpu_extension_service").await;
        let repo = SqlxDpuExtensionServiceRepository::new(db.pool.clone());

        let firewall = repo.create(None, request("firewall", "KubernetesPod")).await.unwrap();
        repo.create(None, request("telemetry", "Daemon")).await.unwrap();

        let (rows, total) = repo
            .get_all(
                None,
                &DpuExtensionServiceFilter {
                    service_types: Some(vec!["KubernetesPod".to_string()]),
                    ..Default::default()
                },
                &PageInput::default(),
                &[DpuExtensionServiceRelation::Site, DpuExtensionServiceRelation::Tenant],
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, firewall.id);
        assert_eq!(rows[0].site.as_ref().map(|s| s.name.as_str()), Some("test-site"));
        assert_eq!(rows[0].tenant.as_ref().map(|t| t.id), Some(TEST_TENANT_ID));

        let (rows, _) = repo
            .get_all(
                None,
                &DpuExtensionServiceFilter::default(),
                &PageInput::default().ordered_by(OrderBy::desc("name")),
                &[],
            )
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["telemetry", "firewall"]);

        let ready = repo
            .update(
                None,
                firewall.id,
                UpdateDpuExtensionServiceRequest {
                    status: Some(DpuExtensionServiceStatus::Ready),
                    version: Some("1.1.0".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ready.status, DpuExtensionServiceStatus::Ready);
        assert!(ready.updated >= firewall.updated);

        let (_, total) = repo
            .get_all(
                None,
                &DpuExtensionServiceFilter {
                    search_query: Some("firewall".to_string()),
                    ..Default::default()
                },
                &PageInput::default(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(total, 1);

        repo.delete(None, firewall.id).await.unwrap();
        assert!(repo.get_by_id(None, firewall.id, &[]).await.unwrap_err().is_not_found());
        assert!(repo
            .update(None, firewall.id, UpdateDpuExtensionServiceRequest {
                name: Some("gone".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err()
            .is_not_found());
    }
}
