//! VPC repository

use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use super::network_security_group::{
    self, NetworkSecurityGroup, NetworkSecurityGroupPropagationDetails,
};
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use crate::domain::{parse_status, status_strings, VpcStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_eq, push_opt_strings, push_opt_uuids, push_search, status_counts};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use tracing::instrument;
use uuid::Uuid;

pub const VPC_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "v.name"),
    OrderField::new("status", "v.status"),
    OrderField::new("created", "v.created"),
    OrderField::new("updated", "v.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpcRelation {
    InfrastructureProvider,
    Tenant,
    Site,
    NetworkSecurityGroup,
}

/// Database row structure for VPCs
#[derive(Debug, Clone, FromRow)]
struct VpcRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    org: String,
    infrastructure_provider_id: Uuid,
    tenant_id: Uuid,
    site_id: Uuid,
    network_virtualization_type: Option<String>,
    controller_vpc_id: Option<Uuid>,
    network_security_group_id: Option<String>,
    network_security_group_propagation_details: Option<Json<NetworkSecurityGroupPropagationDetails>>,
    labels: Json<BTreeMap<String, String>>,
    status: String,
    is_missing_on_site: bool,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vpc {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub infrastructure_provider_id: Uuid,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub network_virtualization_type: Option<String>,
    pub controller_vpc_id: Option<Uuid>,
    pub network_security_group_id: Option<String>,
    pub network_security_group: Option<NetworkSecurityGroup>,
    pub network_security_group_propagation_details: Option<NetworkSecurityGroupPropagationDetails>,
    pub labels: BTreeMap<String, String>,
    pub status: VpcStatus,
    pub is_missing_on_site: bool,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<VpcRow> for Vpc {
    type Error = ForgeError;

    fn try_from(row: VpcRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            org: row.org,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            tenant_id: row.tenant_id,
            tenant: None,
            site_id: row.site_id,
            site: None,
            network_virtualization_type: row.network_virtualization_type,
            controller_vpc_id: row.controller_vpc_id,
            network_security_group_id: row.network_security_group_id,
            network_security_group: None,
            network_security_group_propagation_details: row
                .network_security_group_propagation_details
                .map(|d| d.0),
            labels: row.labels.0,
            is_missing_on_site: row.is_missing_on_site,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVpcRequest {
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub infrastructure_provider_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub network_virtualization_type: Option<String>,
    pub controller_vpc_id: Option<Uuid>,
    pub network_security_group_id: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub status: VpcStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVpcRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub network_virtualization_type: Option<String>,
    pub controller_vpc_id: Option<Uuid>,
    pub network_security_group_id: Option<String>,
    pub network_security_group_propagation_details: Option<NetworkSecurityGroupPropagationDetails>,
    pub labels: Option<BTreeMap<String, String>>,
    pub status: Option<VpcStatus>,
    pub is_missing_on_site: Option<bool>,
}

/// Nullable columns to reset. Labels reset to an empty map.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClearVpcRequest {
    pub description: bool,
    pub controller_vpc_id: bool,
    pub network_security_group_id: bool,
    pub network_security_group_propagation_details: bool,
    pub labels: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpcFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub orgs: Option<Vec<String>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub network_security_group_ids: Option<Vec<String>>,
    pub network_virtualization_types: Option<Vec<String>>,
    pub statuses: Option<Vec<VpcStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait VpcRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateVpcRequest) -> Result<Vpc>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[VpcRelation],
    ) -> Result<Vpc>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &VpcFilter,
        page: &PageInput,
        relations: &[VpcRelation],
    ) -> Result<(Vec<Vpc>, i64)>;
    /// Count live VPCs per status. Every status is present, plus a `total` key.
    async fn get_count_by_status(
        &self,
        tx: Option<&mut Tx>,
        infrastructure_provider_id: Option<Uuid>,
        tenant_id: Option<Uuid>,
        site_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>>;
    async fn update(&self, tx: Option<&mut Tx>, id: Uuid, request: UpdateVpcRequest)
        -> Result<Vpc>;
    async fn clear(&self, tx: Option<&mut Tx>, id: Uuid, request: ClearVpcRequest) -> Result<Vpc>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxVpcRepository {
    pool: DbPool,
}

impl SqlxVpcRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load VPCs by id, including soft deleted ones
pub(crate) async fn load_by_ids(conn: &mut PgConnection, ids: &[Uuid]) -> Result<HashMap<Uuid, Vpc>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, VpcRow>("SELECT * FROM vpc WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load VPCs"))?;

    rows.into_iter().map(|row| Vpc::try_from(row).map(|v| (v.id, v))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    vpcs: &mut [Vpc],
    relations: &[VpcRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            VpcRelation::InfrastructureProvider => {
                let ids = distinct_ids(vpcs.iter().map(|v| v.infrastructure_provider_id));
                let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
                for vpc in vpcs.iter_mut() {
                    vpc.infrastructure_provider =
                        providers.get(&vpc.infrastructure_provider_id).cloned();
                }
            }
            VpcRelation::Tenant => {
                let ids = distinct_ids(vpcs.iter().map(|v| v.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for vpc in vpcs.iter_mut() {
                    vpc.tenant = tenants.get(&vpc.tenant_id).cloned();
                }
            }
            VpcRelation::Site => {
                let ids = distinct_ids(vpcs.iter().map(|v| v.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for vpc in vpcs.iter_mut() {
                    vpc.site = sites.get(&vpc.site_id).cloned();
                }
            }
            VpcRelation::NetworkSecurityGroup => {
                let mut ids: Vec<String> =
                    vpcs.iter().filter_map(|v| v.network_security_group_id.clone()).collect();
                ids.sort();
                ids.dedup();
                let groups = network_security_group::load_by_ids(conn, &ids).await?;
                for vpc in vpcs.iter_mut() {
                    vpc.network_security_group = vpc
                        .network_security_group_id
                        .as_ref()
                        .and_then(|id| groups.get(id))
                        .cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(conn: &mut PgConnection, id: Uuid, relations: &[VpcRelation]) -> Result<Vpc> {
    let row = sqlx::query_as::<_, VpcRow>("SELECT * FROM vpc WHERE id = $1 AND deleted IS NULL")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to fetch VPC {}", id)))?
        .ok_or_else(|| ForgeError::not_found("Vpc", id))?;

    let mut vpcs = [Vpc::try_from(row)?];
    attach_relations(conn, &mut vpcs, relations).await?;
    let [vpc] = vpcs;
    Ok(vpc)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &VpcFilter) {
    push_opt_uuids(qb, "v.id", &filter.ids);
    push_opt_strings(qb, "v.name", &filter.names);
    push_opt_strings(qb, "v.org", &filter.orgs);
    push_opt_uuids(qb, "v.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_uuids(qb, "v.tenant_id", &filter.tenant_ids);
    push_opt_uuids(qb, "v.site_id", &filter.site_ids);
    push_opt_strings(qb, "v.network_security_group_id", &filter.network_security_group_ids);
    push_opt_strings(qb, "v.network_virtualization_type", &filter.network_virtualization_types);
    push_opt_strings(qb, "v.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["v.name", "v.description", "v.status"],
        &["v.name", "v.description", "v.status", "v.labels::text"],
    );
}

#[async_trait]
impl VpcRepository for SqlxVpcRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, tenant_id = %request.tenant_id), name = "db_create_vpc")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateVpcRequest) -> Result<Vpc> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, VpcRow>(
            "INSERT INTO vpc (id, name, description, org, infrastructure_provider_id, tenant_id, \
             site_id, network_virtualization_type, controller_vpc_id, network_security_group_id, \
             labels, status, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.org)
        .bind(request.infrastructure_provider_id)
        .bind(request.tenant_id)
        .bind(request.site_id)
        .bind(&request.network_virtualization_type)
        .bind(request.controller_vpc_id)
        .bind(&request.network_security_group_id)
        .bind(Json(&request.labels))
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create VPC"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_vpc_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[VpcRelation],
    ) -> Result<Vpc> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_vpcs")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &VpcFilter,
        page: &PageInput,
        relations: &[VpcRelation],
    ) -> Result<(Vec<Vpc>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), VPC_ORDER_FIELDS, "v.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM vpc v WHERE v.deleted IS NULL");
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count VPCs"))?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT v.* FROM vpc v WHERE v.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<VpcRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list VPCs"))?;

        let mut vpcs = rows.into_iter().map(Vpc::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut vpcs, relations).await?;
        Ok((vpcs, total))
    }

    #[instrument(skip(self, tx), name = "db_get_vpc_count_by_status")]
    async fn get_count_by_status(
        &self,
        tx: Option<&mut Tx>,
        infrastructure_provider_id: Option<Uuid>,
        tenant_id: Option<Uuid>,
        site_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT v.status, COUNT(*) FROM vpc v WHERE v.deleted IS NULL",
        );
        if let Some(id) = infrastructure_provider_id {
            push_eq(&mut qb, "v.infrastructure_provider_id", id);
        }
        if let Some(id) = tenant_id {
            push_eq(&mut qb, "v.tenant_id", id);
        }
        if let Some(id) = site_id {
            push_eq(&mut qb, "v.site_id", id);
        }
        qb.push(" GROUP BY v.status");

        let rows = qb
            .build_query_as::<(String, i64)>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count VPCs by status"))?;

        Ok(status_counts(VpcStatus::ALL, rows))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_vpc")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateVpcRequest,
    ) -> Result<Vpc> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE vpc SET ");
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
        if let Some(v) = request.network_virtualization_type {
            set.push("network_virtualization_type = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.controller_vpc_id {
            set.push("controller_vpc_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.network_security_group_id {
            set.push("network_security_group_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.network_security_group_propagation_details {
            set.push("network_security_group_propagation_details = ")
                .push_bind_unseparated(Json(v));
            changed = true;
        }
        if let Some(v) = request.labels {
            set.push("labels = ").push_bind_unseparated(Json(v));
            changed = true;
        }
        if let Some(v) = request.status {
            set.push("status = ").push_bind_unseparated(v.as_str());
            changed = true;
        }
        if let Some(v) = request.is_missing_on_site {
            set.push("is_missing_on_site = ").push_bind_unseparated(v);
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
            .map_err(|e| ForgeError::database(e, format!("Failed to update VPC {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Vpc", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_clear_vpc")]
    async fn clear(&self, tx: Option<&mut Tx>, id: Uuid, request: ClearVpcRequest) -> Result<Vpc> {
        let mut conn = acquire(&self.pool, tx).await?;

        let columns = [
            (request.description, "description = NULL"),
            (request.controller_vpc_id, "controller_vpc_id = NULL"),
            (request.network_security_group_id, "network_security_group_id = NULL"),
            (
                request.network_security_group_propagation_details,
                "network_security_group_propagation_details = NULL",
            ),
            (request.labels, "labels = '{}'::jsonb"),
        ];

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE vpc SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        for (clear, assignment) in columns {
            if clear {
                set.push(assignment);
                changed = true;
            }
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
            .map_err(|e| ForgeError::database(e, format!("Failed to clear VPC {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Vpc", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_vpc")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query("UPDATE vpc SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to delete VPC {}", id)))?;

        Ok(())
    }
}

#[cfg(all(test, feature = "postgres_tests"))]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{
        TestDatabase, TEST_PROVIDER_ID, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID, TEST_VPC_ID,
    };

    fn request(name: &str, status: VpcStatus) -> CreateVpcRequest {
        CreateVpcRequest {
            name: name.to_string(),
            description: Some(format!("{} network", name)),
            org: "test-org".to_string(),
            infrastructure_provider_id: TEST_PROVIDER_ID,
            tenant_id: TEST_TENANT_ID,
            site_id: TEST_SITE_ID,
            network_virtualization_type: Some("ETHERNET_VIRTUALIZER".to_string()),
            controller_vpc_id: Some(Uuid::new_v4()),
            network_security_group_id: None,
            labels: BTreeMap::from([("team".to_string(), "storage".to_string())]),
            status,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_create_get_with_relations() {
        let db = TestDatabase::new("vpc_create").await;
        let repo = SqlxVpcRepository::new(db.pool.clone());

        let vpc = repo.create(None, request("blue", VpcStatus::Pending)).await.unwrap();
        let fetched = repo
            .get_by_id(
                None,
                vpc.id,
                &[VpcRelation::InfrastructureProvider, VpcRelation::Tenant, VpcRelation::Site],
            )
            .await
            .unwrap();

        assert_eq!(fetched.name, "blue");
        assert_eq!(fetched.labels.get("team").map(String::as_str), Some("storage"));
        assert_eq!(fetched.infrastructure_provider.map(|p| p.id), Some(TEST_PROVIDER_ID));
        assert_eq!(fetched.tenant.map(|t| t.id), Some(TEST_TENANT_ID));
        assert_eq!(fetched.site.map(|s| s.id), Some(TEST_SITE_ID));
        assert!(fetched.network_security_group.is_none());
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let db = TestDatabase::new("vpc_count").await;
        let repo = SqlxVpcRepository::new(db.pool.clone());

        repo.create(None, request("a", VpcStatus::Pending)).await.unwrap();
        repo.create(None, request("b", VpcStatus::Pending)).await.unwrap();
        let doomed = repo.create(None, request("c", VpcStatus::Error)).await.unwrap();
        repo.delete(None, doomed.id).await.unwrap();

        // the seeded VPC is Ready
        let counts = repo.get_count_by_status(None, None, Some(TEST_TENANT_ID), None).await.unwrap();
        assert_eq!(counts["Pending"], 2);
        assert_eq!(counts["Ready"], 1);
        assert_eq!(counts["Error"], 0);
        assert_eq!(counts["total"], 3);

        let none = repo.get_count_by_status(None, None, Some(Uuid::new_v4()), None).await.unwrap();
        assert_eq!(none["total"], 0);
    }

    #[tokio::test]
    async fn test_clear_and_filters() {
        let db = TestDatabase::new("vpc_clear").await;
        let repo = SqlxVpcRepository::new(db.pool.clone());

        let vpc = repo.create(None, request("green", VpcStatus::Ready)).await.unwrap();
        let cleared = repo
            .clear(
                None,
                vpc.id,
                ClearVpcRequest { description: true, labels: true, ..Default::default() },
            )
            .await
            .unwrap();
        assert!(cleared.description.is_none());
        assert!(cleared.labels.is_empty());
        assert!(cleared.controller_vpc_id.is_some());
        assert!(cleared.updated >= vpc.updated);

        let (rows, total) = repo
            .get_all(
                None,
                &VpcFilter {
                    statuses: Some(vec![VpcStatus::Ready]),
                    ..Default::default()
                },
                &PageInput::default().ordered_by(OrderBy::default_for("name")),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].name, "green");
        assert_eq!(rows[1].id, TEST_VPC_ID);

        let (rows, total) = repo
            .get_all(
                None,
                &VpcFilter { search_query: Some("storage".to_string()), ..Default::default() },
                &PageInput::default(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(total, 0);
        assert!(rows.is_empty());

        let err = repo
            .clear(None, Uuid::new_v4(), ClearVpcRequest { labels: true, ..Default::default() })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
