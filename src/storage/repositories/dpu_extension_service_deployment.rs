//! DPU extension service deployment repository

use super::distinct_ids;
use super::dpu_extension_service::{self, DpuExtensionService};
use super::instance::{self, Instance};
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use crate::domain::{parse_status, status_strings, DpuExtensionServiceDeploymentStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{
    check_batch_size, check_unique_ids, ensure_live_row, order_by_input, push_opt_strings,
    push_opt_uuids, push_search, record_batch_ids,
};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use tracing::{field, instrument, Span};
use uuid::Uuid;

pub const DPU_EXTENSION_SERVICE_DEPLOYMENT_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("id", "desd.id"),
    OrderField::new("status", "desd.status"),
    OrderField::new("created", "desd.created"),
    OrderField::new("updated", "desd.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpuExtensionServiceDeploymentRelation {
    Site,
    Tenant,
    Instance,
    DpuExtensionService,
}

/// Database row structure for DPU extension service deployments
#[derive(Debug, Clone, FromRow)]
struct DpuExtensionServiceDeploymentRow {
    id: Uuid,
    site_id: Uuid,
    tenant_id: Uuid,
    instance_id: Uuid,
    dpu_extension_service_id: Uuid,
    version: String,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpuExtensionServiceDeployment {
    pub id: Uuid,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub instance_id: Uuid,
    pub instance: Option<Instance>,
    pub dpu_extension_service_id: Uuid,
    pub dpu_extension_service: Option<DpuExtensionService>,
    pub version: String,
    pub status: DpuExtensionServiceDeploymentStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<DpuExtensionServiceDeploymentRow> for DpuExtensionServiceDeployment {
    type Error = ForgeError;

    fn try_from(row: DpuExtensionServiceDeploymentRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            site_id: row.site_id,
            site: None,
            tenant_id: row.tenant_id,
            tenant: None,
            instance_id: row.instance_id,
            instance: None,
            dpu_extension_service_id: row.dpu_extension_service_id,
            dpu_extension_service: None,
            version: row.version,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDpuExtensionServiceDeploymentRequest {
    /// Generated when absent
    pub id: Option<Uuid>,
    pub site_id: Uuid,
    pub tenant_id: Uuid,
    pub instance_id: Uuid,
    pub dpu_extension_service_id: Uuid,
    pub version: String,
    pub status: DpuExtensionServiceDeploymentStatus,
    pub created_by: Uuid,
}

/// Only the status of a deployment changes after creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDpuExtensionServiceDeploymentRequest {
    pub status: Option<DpuExtensionServiceDeploymentStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DpuExtensionServiceDeploymentFilter {
    /// `Some(vec![])` matches nothing
    pub ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub instance_ids: Option<Vec<Uuid>>,
    pub dpu_extension_service_ids: Option<Vec<Uuid>>,
    pub versions: Option<Vec<String>>,
    pub statuses: Option<Vec<DpuExtensionServiceDeploymentStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait DpuExtensionServiceDeploymentRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateDpuExtensionServiceDeploymentRequest,
    ) -> Result<DpuExtensionServiceDeployment>;
    /// Insert all rows in one statement; results follow input order
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateDpuExtensionServiceDeploymentRequest>,
    ) -> Result<Vec<DpuExtensionServiceDeployment>>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[DpuExtensionServiceDeploymentRelation],
    ) -> Result<DpuExtensionServiceDeployment>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &DpuExtensionServiceDeploymentFilter,
        page: &PageInput,
        relations: &[DpuExtensionServiceDeploymentRelation],
    ) -> Result<(Vec<DpuExtensionServiceDeployment>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateDpuExtensionServiceDeploymentRequest,
    ) -> Result<DpuExtensionServiceDeployment>;
    /// Apply each update in turn. Pass a transaction to make the batch atomic.
    async fn update_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<(Uuid, UpdateDpuExtensionServiceDeploymentRequest)>,
    ) -> Result<Vec<DpuExtensionServiceDeployment>>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxDpuExtensionServiceDeploymentRepository {
    pool: DbPool,
}

impl SqlxDpuExtensionServiceDeploymentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn attach_relations(
    conn: &mut PgConnection,
    deployments: &mut [DpuExtensionServiceDeployment],
    relations: &[DpuExtensionServiceDeploymentRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            DpuExtensionServiceDeploymentRelation::Site => {
                let ids = distinct_ids(deployments.iter().map(|d| d.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for deployment in deployments.iter_mut() {
                    deployment.site = sites.get(&deployment.site_id).cloned();
                }
            }
            DpuExtensionServiceDeploymentRelation::Tenant => {
                let ids = distinct_ids(deployments.iter().map(|d| d.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for deployment in deployments.iter_mut() {
                    deployment.tenant = tenants.get(&deployment.tenant_id).cloned();
                }
            }
            DpuExtensionServiceDeploymentRelation::Instance => {
                let ids = distinct_ids(deployments.iter().map(|d| d.instance_id));
                let instances = instance::load_by_ids(conn, &ids).await?;
                for deployment in deployments.iter_mut() {
                    deployment.instance = instances.get(&deployment.instance_id).cloned();
                }
            }
            DpuExtensionServiceDeploymentRelation::DpuExtensionService => {
                let ids = distinct_ids(deployments.iter().map(|d| d.dpu_extension_service_id));
                let services = dpu_extension_service::load_by_ids(conn, &ids).await?;
                for deployment in deployments.iter_mut() {
                    deployment.dpu_extension_service =
                        services.get(&deployment.dpu_extension_service_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[DpuExtensionServiceDeploymentRelation],
) -> Result<DpuExtensionServiceDeployment> {
    let row = sqlx::query_as::<_, DpuExtensionServiceDeploymentRow>(
        "SELECT * FROM dpu_extension_service_deployment WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ForgeError::database(e, format!("Failed to fetch DPU extension service deployment {}", id))
    })?
    .ok_or_else(|| ForgeError::not_found("DpuExtensionServiceDeployment", id))?;

    let mut deployments = [DpuExtensionServiceDeployment::try_from(row)?];
    attach_relations(conn, &mut deployments, relations).await?;
    let [deployment] = deployments;
    Ok(deployment)
}

async fn insert_rows(
    conn: &mut PgConnection,
    rows: Vec<(Uuid, CreateDpuExtensionServiceDeploymentRequest)>,
) -> Result<Vec<DpuExtensionServiceDeployment>> {
    let ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
    let now = Utc::now();

    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO dpu_extension_service_deployment (id, site_id, tenant_id, instance_id, \
         dpu_extension_service_id, version, status, created_by, created, updated) ",
    );
    qb.push_values(rows, |mut b, (id, r)| {
        b.push_bind(id)
            .push_bind(r.site_id)
            .push_bind(r.tenant_id)
            .push_bind(r.instance_id)
            .push_bind(r.dpu_extension_service_id)
            .push_bind(r.version)
            .push_bind(r.status.as_str())
            .push_bind(r.created_by)
            .push_bind(now)
            .push_bind(now);
    });
    qb.push(" RETURNING *");

    let inserted = qb
        .build_query_as::<DpuExtensionServiceDeploymentRow>()
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create DPU extension service deployments"))?;

    let deployments = inserted
        .into_iter()
        .map(DpuExtensionServiceDeployment::try_from)
        .collect::<Result<Vec<_>>>()?;
    order_by_input(&ids, deployments, |d| &d.id)
}

async fn apply_update(
    conn: &mut PgConnection,
    id: Uuid,
    request: UpdateDpuExtensionServiceDeploymentRequest,
) -> Result<()> {
    let Some(status) = request.status else {
        return ensure_live_row(
            conn,
            "dpu_extension_service_deployment",
            "DpuExtensionServiceDeployment",
            id,
        )
        .await;
    };

    let result = sqlx::query(
        "UPDATE dpu_extension_service_deployment SET status = $2, updated = $3 \
         WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .bind(status.as_str())
    .bind(Utc::now())
    .execute(conn)
    .await
    .map_err(|e| {
        ForgeError::database(e, format!("Failed to update DPU extension service deployment {}", id))
    })?;
    if result.rows_affected() == 0 {
        return Err(ForgeError::not_found("DpuExtensionServiceDeployment", id));
    }
    Ok(())
}

async fn update_batch(
    conn: &mut PgConnection,
    requests: Vec<(Uuid, UpdateDpuExtensionServiceDeploymentRequest)>,
    ids: &[Uuid],
) -> Result<Vec<DpuExtensionServiceDeployment>> {
    for (id, request) in requests {
        apply_update(conn, id, request).await?;
    }

    let rows = sqlx::query_as::<_, DpuExtensionServiceDeploymentRow>(
        "SELECT * FROM dpu_extension_service_deployment WHERE id = ANY($1) AND deleted IS NULL",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| {
        ForgeError::database(e, "Failed to fetch updated DPU extension service deployments")
    })?;

    let deployments = rows
        .into_iter()
        .map(DpuExtensionServiceDeployment::try_from)
        .collect::<Result<Vec<_>>>()?;
    order_by_input(ids, deployments, |d| &d.id)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &DpuExtensionServiceDeploymentFilter) {
    push_opt_uuids(qb, "desd.id", &filter.ids);
    push_opt_uuids(qb, "desd.site_id", &filter.site_ids);
    push_opt_uuids(qb, "desd.tenant_id", &filter.tenant_ids);
    push_opt_uuids(qb, "desd.instance_id", &filter.instance_ids);
    push_opt_uuids(qb, "desd.dpu_extension_service_id", &filter.dpu_extension_service_ids);
    push_opt_strings(qb, "desd.version", &filter.versions);
    push_opt_strings(qb, "desd.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["desd.status"],
        &["desd.status", "desd.id::text"],
    );
}

#[async_trait]
impl DpuExtensionServiceDeploymentRepository for SqlxDpuExtensionServiceDeploymentRepository {
    #[instrument(skip(self, tx, request), fields(instance_id = %request.instance_id, dpu_extension_service_id = %request.dpu_extension_service_id), name = "db_create_dpu_extension_service_deployment")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateDpuExtensionServiceDeploymentRequest,
    ) -> Result<DpuExtensionServiceDeployment> {
        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, vec![(id, request)])
            .await?
            .pop()
            .ok_or_else(|| ForgeError::internal("insert returned no DPU extension service deployment"))
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_create_multiple_dpu_extension_service_deployments"
    )]
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateDpuExtensionServiceDeploymentRequest>,
    ) -> Result<Vec<DpuExtensionServiceDeployment>> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(Uuid, CreateDpuExtensionServiceDeploymentRequest)> = requests
            .into_iter()
            .map(|r| (r.id.unwrap_or_else(Uuid::new_v4), r))
            .collect();
        let ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        record_batch_ids(&Span::current(), &ids);

        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, rows).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_dpu_extension_service_deployment_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[DpuExtensionServiceDeploymentRelation],
    ) -> Result<DpuExtensionServiceDeployment> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_dpu_extension_service_deployments")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &DpuExtensionServiceDeploymentFilter,
        page: &PageInput,
        relations: &[DpuExtensionServiceDeploymentRelation],
    ) -> Result<(Vec<DpuExtensionServiceDeployment>, i64)> {
        if filter.ids.as_ref().is_some_and(Vec::is_empty) {
            return Ok((Vec::new(), 0));
        }

        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            DPU_EXTENSION_SERVICE_DEPLOYMENT_ORDER_FIELDS,
            "desd.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM dpu_extension_service_deployment desd WHERE desd.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                ForgeError::database(e, "Failed to count DPU extension service deployments")
            })?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT desd.* FROM dpu_extension_service_deployment desd WHERE desd.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<DpuExtensionServiceDeploymentRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list DPU extension service deployments"))?;

        let mut deployments = rows
            .into_iter()
            .map(DpuExtensionServiceDeployment::try_from)
            .collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut deployments, relations).await?;
        Ok((deployments, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id, status = ?request.status), name = "db_update_dpu_extension_service_deployment")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateDpuExtensionServiceDeploymentRequest,
    ) -> Result<DpuExtensionServiceDeployment> {
        let mut conn = acquire(&self.pool, tx).await?;
        apply_update(&mut conn, id, request).await?;
        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_update_multiple_dpu_extension_service_deployments"
    )]
    async fn update_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<(Uuid, UpdateDpuExtensionServiceDeploymentRequest)>,
    ) -> Result<Vec<DpuExtensionServiceDeployment>> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = requests.iter().map(|(id, _)| *id).collect();
        check_unique_ids(&ids)?;
        record_batch_ids(&Span::current(), &ids);

        match tx {
            Some(tx) => update_batch(tx.connection(), requests, &ids).await,
            None => {
                let mut tx = Tx::begin(&self.pool).await?;
                let deployments = update_batch(tx.connection(), requests, &ids).await?;
                tx.commit().await?;
                Ok(deployments)
            }
        }
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_dpu_extension_service_deployment")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE dpu_extension_service_deployment SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(
                e,
                format!("Failed to delete DPU extension service deployment {}", id),
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{
        lazy_pool, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID,
    };
    use crate::storage::MAX_BATCH_ITEMS;

    fn request(instance_id: Uuid, service_id: Uuid) -> CreateDpuExtensionServiceDeploymentRequest {
        CreateDpuExtensionServiceDeploymentRequest {
            id: None,
            site_id: TEST_SITE_ID,
            tenant_id: TEST_TENANT_ID,
            instance_id,
            dpu_extension_service_id: service_id,
            version: "1.0.0".to_string(),
            status: DpuExtensionServiceDeploymentStatus::Pending,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_explicit_empty_ids_short_circuit() {
        let repo = SqlxDpuExtensionServiceDeploymentRepository::new(lazy_pool());
        let filter = DpuExtensionServiceDeploymentFilter { ids: Some(Vec::new()), ..Default::default() };

        let (rows, total) = repo.get_all(None, &filter, &PageInput::default(), &[]).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_update_multiple_over_limit() {
        let repo = SqlxDpuExtensionServiceDeploymentRepository::new(lazy_pool());
        let requests = (0..MAX_BATCH_ITEMS + 1)
            .map(|_| (Uuid::new_v4(), UpdateDpuExtensionServiceDeploymentRequest::default()))
            .collect();

        let err = repo.update_multiple(None, requests).await.unwrap_err();
        assert!(matches!(err, ForgeError::BatchTooLarge { size: 101, .. }));
    }

    #[tokio::test]
    async fn test_update_multiple_repeated_id_is_rejected() {
        let repo = SqlxDpuExtensionServiceDeploymentRepository::new(lazy_pool());
        let id = Uuid::new_v4();
        let running = UpdateDpuExtensionServiceDeploymentRequest {
            status: Some(DpuExtensionServiceDeploymentStatus::Running),
        };

        let err = repo
            .update_multiple(None, vec![(id, running.clone()), (id, running)])
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));
    }

    #[test]
    fn test_search_matches_status_and_id_text() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT desd.* FROM dpu_extension_service_deployment desd WHERE TRUE");
        push_filter(
            &mut qb,
            &DpuExtensionServiceDeploymentFilter {
                search_query: Some("run".to_string()),
                ..Default::default()
            },
        );
        let sql = qb.sql();
        assert!(sql.contains("desd.status ILIKE $2"));
        assert!(sql.contains("desd.id::text ILIKE $3"));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::domain::DpuExtensionServiceStatus;
        use crate::storage::repositories::dpu_extension_service::{
            CreateDpuExtensionServiceRequest, DpuExtensionServiceRepository,
            SqlxDpuExtensionServiceRepository,
        };
        use crate::storage::test_helpers::TestDatabase;
        use crate::storage::Tx;

        async fn seed_service(db: &TestDatabase) -> Uuid {
            SqlxDpuExtensionServiceRepository::new(db.pool.clone())
                .create(
                    None,
                    CreateDpuExtensionServiceRequest {
                        name: "flow-collector".to_string(),
                        description: None,
                        service_type: "KubernetesPod".to_string(),
                        site_id: TEST_SITE_ID,
                        tenant_id: TEST_TENANT_ID,
                        version: Some("1.0.0".to_string()),
                        status: DpuExtensionServiceStatus::Ready,
                        created_by: TEST_USER_ID,
                    },
                )
                .await
                .unwrap()
                .id
        }

        #[tokio::test]
        async fn test_batch_create_update_and_relations() {
            let db = TestDatabase::new("desd_batch").await;
            let repo = SqlxDpuExtensionServiceDeploymentRepository::new(db.pool.clone());
            let service_id = seed_service(&db).await;
            let first = db.seed_instance("dpu-host-1").await;
            let second = db.seed_instance("dpu-host-2").await;

            let fixed = Uuid::new_v4();
            let mut with_id = request(first, service_id);
            with_id.id = Some(fixed);

            let created = repo
                .create_multiple(None, vec![with_id, request(second, service_id)])
                .await
                .unwrap();
            assert_eq!(created[0].id, fixed);
            assert_eq!(created[1].instance_id, second);

            let mut tx = Tx::begin(&db.pool).await.unwrap();
            let updated = repo
                .update_multiple(
                    Some(&mut tx),
                    vec![
                        (
                            created[1].id,
                            UpdateDpuExtensionServiceDeploymentRequest {
                                status: Some(DpuExtensionServiceDeploymentStatus::Running),
                            },
                        ),
                        (
                            created[0].id,
                            UpdateDpuExtensionServiceDeploymentRequest {
                                status: Some(DpuExtensionServiceDeploymentStatus::Failed),
                            },
                        ),
                    ],
                )
                .await
                .unwrap();
            tx.commit().await.unwrap();
            assert_eq!(updated[0].id, created[1].id);
            assert_eq!(updated[0].status, DpuExtensionServiceDeploymentStatus::Running);
            assert_eq!(updated[1].status, DpuExtensionServiceDeploymentStatus::Failed);

            let (rows, total) = repo
                .get_all(
                    None,
                    &DpuExtensionServiceDeploymentFilter {
                        statuses: Some(vec![DpuExtensionServiceDeploymentStatus::Running]),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[
                        DpuExtensionServiceDeploymentRelation::Instance,
                        DpuExtensionServiceDeploymentRelation::DpuExtensionService,
                    ],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].instance.as_ref().map(|i| i.name.as_str()), Some("dpu-host-2"));
            assert_eq!(
                rows[0].dpu_extension_service.as_ref().map(|s| s.name.as_str()),
                Some("flow-collector")
            );

            let (_, total) = repo
                .get_all(
                    None,
                    &DpuExtensionServiceDeploymentFilter {
                        search_query: Some(fixed.to_string()[..8].to_string()),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[],
                )
                .await
                .unwrap();
            assert!(total >= 1);

            let missing = repo
                .update(
                    None,
                    Uuid::new_v4(),
                    UpdateDpuExtensionServiceDeploymentRequest {
                        status: Some(DpuExtensionServiceDeploymentStatus::Terminating),
                    },
                )
                .await
                .unwrap_err();
            assert!(missing.is_not_found());

            let missing = repo
                .update_multiple(
                    None,
                    vec![
                        (
                            created[0].id,
                            UpdateDpuExtensionServiceDeploymentRequest {
                                status: Some(DpuExtensionServiceDeploymentStatus::Error),
                            },
                        ),
                        (Uuid::new_v4(), UpdateDpuExtensionServiceDeploymentRequest::default()),
                    ],
                )
                .await
                .unwrap_err();
            assert!(missing.is_not_found());
            let kept = repo.get_by_id(None, created[0].id, &[]).await.unwrap();
            assert_eq!(kept.status, DpuExtensionServiceDeploymentStatus::Failed);

            repo.delete(None, fixed).await.unwrap();
            assert!(repo.get_by_id(None, fixed, &[]).await.unwrap_err().is_not_found());
        }
    }
}
