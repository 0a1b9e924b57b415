//! Subnet repository
//!
//! Subnets belong to a VPC on a site. Address fields are stored as text and each
//! family may be carved out of an IP block.

use super::distinct_ids;
use super::domain::{self, Domain};
use super::ip_block::{self, IpBlock};
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use super::vpc::{self, Vpc};
use crate::domain::{parse_status, status_strings, SubnetStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_eq, push_opt_strings, push_opt_uuids, push_search, status_counts};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const SUBNET_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "su.name"),
    OrderField::new("status", "su.status"),
    OrderField::new("created", "su.created"),
    OrderField::new("updated", "su.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetRelation {
    Site,
    Vpc,
    Tenant,
    Domain,
    Ipv4Block,
    Ipv6Block,
}

/// Database row structure for subnets
#[derive(Debug, Clone, FromRow)]
struct SubnetRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    org: String,
    site_id: Uuid,
    vpc_id: Uuid,
    domain_id: Option<Uuid>,
    tenant_id: Uuid,
    controller_network_segment_id: Option<Uuid>,
    routing_type: Option<String>,
    ipv4_prefix: Option<String>,
    ipv4_gateway: Option<String>,
    ipv4_block_id: Option<Uuid>,
    ipv6_prefix: Option<String>,
    ipv6_gateway: Option<String>,
    ipv6_block_id: Option<Uuid>,
    prefix_length: i32,
    mtu: Option<i32>,
    status: String,
    is_missing_on_site: bool,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub vpc_id: Uuid,
    pub vpc: Option<Vpc>,
    pub domain_id: Option<Uuid>,
    pub domain: Option<Domain>,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub controller_network_segment_id: Option<Uuid>,
    pub routing_type: Option<String>,
    pub ipv4_prefix: Option<String>,
    pub ipv4_gateway: Option<String>,
    pub ipv4_block_id: Option<Uuid>,
    pub ipv4_block: Option<IpBlock>,
    pub ipv6_prefix: Option<String>,
    pub ipv6_gateway: Option<String>,
    pub ipv6_block_id: Option<Uuid>,
    pub ipv6_block: Option<IpBlock>,
    pub prefix_length: i32,
    pub mtu: Option<i32>,
    pub status: SubnetStatus,
    pub is_missing_on_site: bool,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<SubnetRow> for Subnet {
    type Error = ForgeError;

    fn try_from(row: SubnetRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            org: row.org,
            site_id: row.site_id,
            site: None,
            vpc_id: row.vpc_id,
            vpc: None,
            domain_id: row.domain_id,
            domain: None,
            tenant_id: row.tenant_id,
            tenant: None,
            controller_network_segment_id: row.controller_network_segment_id,
            routing_type: row.routing_type,
            ipv4_prefix: row.ipv4_prefix,
            ipv4_gateway: row.ipv4_gateway,
            ipv4_block_id: row.ipv4_block_id,
            ipv4_block: None,
            ipv6_prefix: row.ipv6_prefix,
            ipv6_gateway: row.ipv6_gateway,
            ipv6_block_id: row.ipv6_block_id,
            ipv6_block: None,
            prefix_length: row.prefix_length,
            mtu: row.mtu,
            is_missing_on_site: row.is_missing_on_site,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubnetRequest {
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub site_id: Uuid,
    pub vpc_id: Uuid,
    pub domain_id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub controller_network_segment_id: Option<Uuid>,
    pub routing_type: Option<String>,
    pub ipv4_prefix: Option<String>,
    pub ipv4_gateway: Option<String>,
    pub ipv4_block_id: Option<Uuid>,
    pub ipv6_prefix: Option<String>,
    pub ipv6_gateway: Option<String>,
    pub ipv6_block_id: Option<Uuid>,
    pub prefix_length: i32,
    pub mtu: Option<i32>,
    pub status: SubnetStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSubnetRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub domain_id: Option<Uuid>,
    pub controller_network_segment_id: Option<Uuid>,
    pub routing_type: Option<String>,
    pub ipv4_prefix: Option<String>,
    pub ipv4_gateway: Option<String>,
    pub ipv4_block_id: Option<Uuid>,
    pub ipv6_prefix: Option<String>,
    pub ipv6_gateway: Option<String>,
    pub ipv6_block_id: Option<Uuid>,
    pub prefix_length: Option<i32>,
    pub mtu: Option<i32>,
    pub status: Option<SubnetStatus>,
    pub is_missing_on_site: Option<bool>,
}

/// Nullable columns to reset to NULL
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClearSubnetRequest {
    pub description: bool,
    pub domain_id: bool,
    pub controller_network_segment_id: bool,
    pub ipv4_prefix: bool,
    pub ipv4_gateway: bool,
    pub ipv4_block_id: bool,
    pub ipv6_prefix: bool,
    pub ipv6_gateway: bool,
    pub ipv6_block_id: bool,
    pub mtu: bool,
}

impl ClearSubnetRequest {
    fn columns(&self) -> Vec<&'static str> {
        [
            (self.description, "description"),
            (self.domain_id, "domain_id"),
            (self.controller_network_segment_id, "controller_network_segment_id"),
            (self.ipv4_prefix, "ipv4_prefix"),
            (self.ipv4_gateway, "ipv4_gateway"),
            (self.ipv4_block_id, "ipv4_block_id"),
            (self.ipv6_prefix, "ipv6_prefix"),
            (self.ipv6_gateway, "ipv6_gateway"),
            (self.ipv6_block_id, "ipv6_block_id"),
            (self.mtu, "mtu"),
        ]
        .into_iter()
        .filter_map(|(clear, column)| clear.then_some(column))
        .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub vpc_ids: Option<Vec<Uuid>>,
    pub domain_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub ipv4_block_ids: Option<Vec<Uuid>>,
    pub ipv6_block_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<SubnetStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait SubnetRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateSubnetRequest) -> Result<Subnet>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SubnetRelation],
    ) -> Result<Subnet>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SubnetFilter,
        page: &PageInput,
        relations: &[SubnetRelation],
    ) -> Result<(Vec<Subnet>, i64)>;
    /// Count live subnets per status. Every status is present, plus a `total` key.
    async fn get_count_by_status(
        &self,
        tx: Option<&mut Tx>,
        tenant_id: Option<Uuid>,
        vpc_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSubnetRequest,
    ) -> Result<Subnet>;
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearSubnetRequest,
    ) -> Result<Subnet>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxSubnetRepository {
    pool: DbPool,
}

impl SqlxSubnetRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load subnets by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Subnet>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, SubnetRow>("SELECT * FROM subnet WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load subnets"))?;

    rows.into_iter().map(|row| Subnet::try_from(row).map(|s| (s.id, s))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    subnets: &mut [Subnet],
    relations: &[SubnetRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            SubnetRelation::Site => {
                let ids = distinct_ids(subnets.iter().map(|s| s.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for subnet in subnets.iter_mut() {
                    subnet.site = sites.get(&subnet.site_id).cloned();
                }
            }
            SubnetRelation::Vpc => {
                let ids = distinct_ids(subnets.iter().map(|s| s.vpc_id));
                let vpcs = vpc::load_by_ids(conn, &ids).await?;
                for subnet in subnets.iter_mut() {
                    subnet.vpc = vpcs.get(&subnet.vpc_id).cloned();
                }
            }
            SubnetRelation::Tenant => {
                let ids = distinct_ids(subnets.iter().map(|s| s.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for subnet in subnets.iter_mut() {
                    subnet.tenant = tenants.get(&subnet.tenant_id).cloned();
                }
            }
            SubnetRelation::Domain => {
                let ids = distinct_ids(subnets.iter().filter_map(|s| s.domain_id));
                let domains = domain::load_by_ids(conn, &ids).await?;
                for subnet in subnets.iter_mut() {
                    subnet.domain = subnet.domain_id.and_then(|id| domains.get(&id)).cloned();
                }
            }
            SubnetRelation::Ipv4Block => {
                let ids = distinct_ids(subnets.iter().filter_map(|s| s.ipv4_block_id));
                let blocks = ip_block::load_by_ids(conn, &ids).await?;
                for subnet in subnets.iter_mut() {
                    subnet.ipv4_block = subnet.ipv4_block_id.and_then(|id| blocks.get(&id)).cloned();
                }
            }
            SubnetRelation::Ipv6Block => {
                let ids = distinct_ids(subnets.iter().filter_map(|s| s.ipv6_block_id));
                let blocks = ip_block::load_by_ids(conn, &ids).await?;
                for subnet in subnets.iter_mut() {
                    subnet.ipv6_block = subnet.ipv6_block_id.and_then(|id| blocks.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[SubnetRelation],
) -> Result<Subnet> {
    let row =
        sqlx::query_as::<_, SubnetRow>("SELECT * FROM subnet WHERE id = $1 AND deleted IS NULL")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to fetch subnet {}", id)))?
            .ok_or_else(|| ForgeError::not_found("Subnet", id))?;

    let mut subnets = [Subnet::try_from(row)?];
    attach_relations(conn, &mut subnets, relations).await?;
    let [subnet] = subnets;
    Ok(subnet)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SubnetFilter) {
    push_opt_uuids(qb, "su.id", &filter.ids);
    push_opt_strings(qb, "su.name", &filter.names);
    push_opt_uuids(qb, "su.site_id", &filter.site_ids);
    push_opt_uuids(qb, "su.vpc_id", &filter.vpc_ids);
    push_opt_uuids(qb, "su.domain_id", &filter.domain_ids);
    push_opt_uuids(qb, "su.tenant_id", &filter.tenant_ids);
    push_opt_uuids(qb, "su.ipv4_block_id", &filter.ipv4_block_ids);
    push_opt_uuids(qb, "su.ipv6_block_id", &filter.ipv6_block_ids);
    push_opt_strings(qb, "su.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["su.name", "su.description", "su.status"],
        &["su.name", "su.description", "su.status"],
    );
}

#[async_trait]
impl SubnetRepository for SqlxSubnetRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, vpc_id = %request.vpc_id), name = "db_create_subnet")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateSubnetRequest) -> Result<Subnet> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, SubnetRow>(
            "INSERT INTO subnet (id, name, description, org, site_id, vpc_id, domain_id, tenant_id, \
             controller_network_segment_id, routing_type, ipv4_prefix, ipv4_gateway, ipv4_block_id, \
             ipv6_prefix, ipv6_gateway, ipv6_block_id, prefix_length, mtu, status, created_by, \
             created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20, $21, $21) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.org)
        .bind(request.site_id)
        .bind(request.vpc_id)
        .bind(request.domain_id)
        .bind(request.tenant_id)
        .bind(request.controller_network_segment_id)
        .bind(&request.routing_type)
        .bind(&request.ipv4_prefix)
        .bind(&request.ipv4_gateway)
        .bind(request.ipv4_block_id)
        .bind(&request.ipv6_prefix)
        .bind(&request.ipv6_gateway)
        .bind(request.ipv6_block_id)
        .bind(request.prefix_length)
        .bind(request.mtu)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create subnet"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_subnet_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SubnetRelation],
    ) -> Result<Subnet> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_subnets")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SubnetFilter,
        page: &PageInput,
        relations: &[SubnetRelation],
    ) -> Result<(Vec<Subnet>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), SUBNET_ORDER_FIELDS, "su.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM subnet su WHERE su.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count subnets"))?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT su.* FROM subnet su WHERE su.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<SubnetRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list subnets"))?;

        let mut subnets = rows.into_iter().map(Subnet::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut subnets, relations).await?;
        Ok((subnets, total))
    }

    #[instrument(skip(self, tx), name = "db_get_subnet_count_by_status")]
    async fn get_count_by_status(
        &self,
        tx: Option<&mut Tx>,
        tenant_id: Option<Uuid>,
        vpc_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT su.status, COUNT(*) FROM subnet su WHERE su.deleted IS NULL",
        );
        if let Some(id) = tenant_id {
            push_eq(&mut qb, "su.tenant_id", id);
        }
        if let Some(id) = vpc_id {
            push_eq(&mut qb, "su.vpc_id", id);
        }
        qb.push(" GROUP BY su.status");

        let rows = qb
            .build_query_as::<(String, i64)>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count subnets by status"))?;

        Ok(status_counts(SubnetStatus::ALL, rows))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_subnet")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSubnetRequest,
    ) -> Result<Subnet> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE subnet SET ");
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
        if let Some(v) = request.domain_id {
            set.push("domain_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.controller_network_segment_id {
            set.push("controller_network_segment_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.routing_type {
            set.push("routing_type = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ipv4_prefix {
            set.push("ipv4_prefix = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ipv4_gateway {
            set.push("ipv4_gateway = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ipv4_block_id {
            set.push("ipv4_block_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ipv6_prefix {
            set.push("ipv6_prefix = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ipv6_gateway {
            set.push("ipv6_gateway = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ipv6_block_id {
            set.push("ipv6_block_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.prefix_length {
            set.push("prefix_length = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.mtu {
            set.push("mtu = ").push_bind_unseparated(v);
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
            .map_err(|e| ForgeError::database(e, format!("Failed to update subnet {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Subnet", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_clear_subnet")]
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearSubnetRequest,
    ) -> Result<Subnet> {
        let mut conn = acquire(&self.pool, tx).await?;

        let columns = request.columns();
        if columns.is_empty() {
            return fetch_one(&mut conn, id, &[]).await;
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE subnet SET ");
        let mut set = qb.separated(", ");
        for column in columns {
            set.push(column).push_unseparated(" = NULL");
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to clear subnet {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Subnet", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_subnet")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE subnet SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete subnet {}", id)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_columns() {
        assert!(ClearSubnetRequest::default().columns().is_empty());

        let request = ClearSubnetRequest { ipv4_gateway: true, mtu: true, ..Default::default() };
        assert_eq!(request.columns(), vec!["ipv4_gateway", "mtu"]);
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::{
            TestDatabase, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID, TEST_VPC_ID,
        };

        fn request(name: &str, status: SubnetStatus) -> CreateSubnetRequest {
            CreateSubnetRequest {
                name: name.to_string(),
                description: Some("compute".to_string()),
                org: "test-org".to_string(),
                site_id: TEST_SITE_ID,
                vpc_id: TEST_VPC_ID,
                domain_id: None,
                tenant_id: TEST_TENANT_ID,
                controller_network_segment_id: None,
                routing_type: Some("Public".to_string()),
                ipv4_prefix: Some("10.0.0.0".to_string()),
                ipv4_gateway: Some("10.0.0.1".to_string()),
                ipv4_block_id: Some(Uuid::new_v4()),
                ipv6_prefix: None,
                ipv6_gateway: None,
                ipv6_block_id: None,
                prefix_length: 24,
                mtu: Some(9000),
                status,
                created_by: TEST_USER_ID,
            }
        }

        #[tokio::test]
        async fn test_create_clear_and_relations() {
            let db = TestDatabase::new("subnet_clear").await;
            let repo = SqlxSubnetRepository::new(db.pool.clone());

            let subnet = repo.create(None, request("s1", SubnetStatus::Pending)).await.unwrap();
            let cleared = repo
                .clear(
                    None,
                    subnet.id,
                    ClearSubnetRequest {
                        ipv4_gateway: true,
                        ipv4_block_id: true,
                        mtu: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(cleared.ipv4_gateway.is_none());
            assert!(cleared.ipv4_block_id.is_none());
            assert!(cleared.mtu.is_none());
            assert_eq!(cleared.ipv4_prefix.as_deref(), Some("10.0.0.0"));

            let fetched = repo
                .get_by_id(None, subnet.id, &[SubnetRelation::Vpc, SubnetRelation::Tenant])
                .await
                .unwrap();
            assert_eq!(fetched.vpc.map(|v| v.id), Some(TEST_VPC_ID));
            assert_eq!(fetched.tenant.map(|t| t.id), Some(TEST_TENANT_ID));
            assert!(fetched.site.is_none());
        }

        #[tokio::test]
        async fn test_filters_and_count() {
            let db = TestDatabase::new("subnet_filters").await;
            let repo = SqlxSubnetRepository::new(db.pool.clone());

            let a = repo.create(None, request("a", SubnetStatus::Ready)).await.unwrap();
            repo.create(None, request("b", SubnetStatus::Ready)).await.unwrap();
            repo.create(None, request("c", SubnetStatus::Error)).await.unwrap();

            let (rows, total) = repo
                .get_all(
                    None,
                    &SubnetFilter {
                        vpc_ids: Some(vec![TEST_VPC_ID]),
                        statuses: Some(vec![SubnetStatus::Ready]),
                        ..Default::default()
                    },
                    &PageInput::default().with_limit(1),
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(total, 2);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].id, a.id);

            let (rows, total) = repo
                .get_all(
                    None,
                    &SubnetFilter { ipv4_block_ids: a.ipv4_block_id.map(|id| vec![id]), ..Default::default() },
                    &PageInput::default(),
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].name, "a");

            let counts = repo.get_count_by_status(None, None, Some(TEST_VPC_ID)).await.unwrap();
            assert_eq!(counts["Ready"], 2);
            assert_eq!(counts["Error"], 1);
            assert_eq!(counts["Provisioning"], 0);
            assert_eq!(counts["total"], 3);
        }

        #[tokio::test]
        async fn test_domain_and_block_relations() {
            use crate::domain::{DomainStatus, IpBlockStatus};
            use crate::storage::repositories::domain::{
                CreateDomainRequest, DomainRepository, SqlxDomainRepository,
            };
            use crate::storage::repositories::ip_block::{
                CreateIpBlockRequest, IpBlockRepository, SqlxIpBlockRepository,
            };
            use crate::storage::test_helpers::TEST_PROVIDER_ID;

            let db = TestDatabase::new("subnet_relations").await;
            let repo = SqlxSubnetRepository::new(db.pool.clone());
            let domain = SqlxDomainRepository::new(db.pool.clone())
                .create(
                    None,
                    CreateDomainRequest {
                        hostname: "tenant.example.net".to_string(),
                        org: "test-org".to_string(),
                        controller_domain_id: None,
                        status: DomainStatus::Ready,
                        created_by: TEST_USER_ID,
                    },
                )
                .await
                .unwrap();
            let block = SqlxIpBlockRepository::new(db.pool.clone())
                .create(
                    None,
                    CreateIpBlockRequest {
                        name: "tenant-v4".to_string(),
                        description: None,
                        site_id: TEST_SITE_ID,
                        infrastructure_provider_id: TEST_PROVIDER_ID,
                        tenant_id: Some(TEST_TENANT_ID),
                        routing_type: "Public".to_string(),
                        prefix: "10.0.0.0".to_string(),
                        prefix_length: 16,
                        protocol_version: "IPv4".to_string(),
                        full_grant: false,
                        status: IpBlockStatus::Ready,
                        created_by: Some(TEST_USER_ID),
                    },
                )
                .await
                .unwrap();

            let subnet = repo
                .create(
                    None,
                    CreateSubnetRequest {
                        domain_id: Some(domain.id),
                        ipv4_block_id: Some(block.id),
                        ..request("linked", SubnetStatus::Ready)
                    },
                )
                .await
                .unwrap();

            let fetched = repo
                .get_by_id(
                    None,
                    subnet.id,
                    &[SubnetRelation::Domain, SubnetRelation::Ipv4Block, SubnetRelation::Ipv6Block],
                )
                .await
                .unwrap();
            assert_eq!(fetched.domain.map(|d| d.hostname), Some("tenant.example.net".to_string()));
            assert_eq!(fetched.ipv4_block.map(|b| b.id), Some(block.id));
            assert!(fetched.ipv6_block.is_none());
        }
    }
}
