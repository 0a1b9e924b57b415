//! Network security group repository
//!
//! Security group ids are text. Callers may supply one (site controllers mint their
//! own) or let the repository generate a UUID string.

use super::distinct_ids;
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use crate::domain::{parse_status, status_strings, NetworkSecurityGroupStatus};
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
use std::collections::{BTreeMap, HashMap};
use tracing::instrument;
use uuid::Uuid;

pub const NETWORK_SECURITY_GROUP_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "nsg.name"),
    OrderField::new("status", "nsg.status"),
    OrderField::new("created", "nsg.created"),
    OrderField::new("updated", "nsg.updated"),
];

/// One allow/deny rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSecurityGroupRule {
    pub id: Option<String>,
    pub direction: String,
    pub protocol: String,
    pub action: String,
    pub priority: i32,
    pub ipv6: bool,
    pub src_port_start: Option<u32>,
    pub src_port_end: Option<u32>,
    pub dst_port_start: Option<u32>,
    pub dst_port_end: Option<u32>,
    pub src_prefix: Option<String>,
    pub dst_prefix: Option<String>,
}

/// How far a security group change has propagated to the objects using it.
/// Stored on VPCs and instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSecurityGroupPropagationDetails {
    pub status: String,
    pub details: Option<String>,
    pub related_instance_ids: Vec<String>,
    pub unpropagated_instance_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSecurityGroupRelation {
    Site,
    Tenant,
}

/// Database row structure for network security groups
#[derive(Debug, Clone, FromRow)]
struct NetworkSecurityGroupRow {
    id: String,
    name: String,
    description: Option<String>,
    site_id: Uuid,
    tenant_org: String,
    tenant_id: Uuid,
    version: Option<String>,
    stateful_egress: bool,
    rules: Json<Vec<NetworkSecurityGroupRule>>,
    labels: Json<BTreeMap<String, String>>,
    status: String,
    is_missing_on_site: bool,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSecurityGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub tenant_org: String,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub version: Option<String>,
    pub stateful_egress: bool,
    pub rules: Vec<NetworkSecurityGroupRule>,
    pub labels: BTreeMap<String, String>,
    pub status: NetworkSecurityGroupStatus,
    pub is_missing_on_site: bool,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<NetworkSecurityGroupRow> for NetworkSecurityGroup {
    type Error = ForgeError;

    fn try_from(row: NetworkSecurityGroupRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            site_id: row.site_id,
            site: None,
            tenant_org: row.tenant_org,
            tenant_id: row.tenant_id,
            tenant: None,
            version: row.version,
            stateful_egress: row.stateful_egress,
            rules: row.rules.0,
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
pub struct CreateNetworkSecurityGroupRequest {
    /// Generated when absent
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub site_id: Uuid,
    pub tenant_org: String,
    pub tenant_id: Uuid,
    pub version: Option<String>,
    pub stateful_egress: bool,
    pub rules: Vec<NetworkSecurityGroupRule>,
    pub labels: BTreeMap<String, String>,
    pub status: NetworkSecurityGroupStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateNetworkSecurityGroupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub stateful_egress: Option<bool>,
    pub rules: Option<Vec<NetworkSecurityGroupRule>>,
    pub labels: Option<BTreeMap<String, String>>,
    pub status: Option<NetworkSecurityGroupStatus>,
    pub is_missing_on_site: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSecurityGroupFilter {
    pub ids: Option<Vec<String>>,
    pub names: Option<Vec<String>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub tenant_orgs: Option<Vec<String>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<NetworkSecurityGroupStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait NetworkSecurityGroupRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateNetworkSecurityGroupRequest,
    ) -> Result<NetworkSecurityGroup>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        relations: &[NetworkSecurityGroupRelation],
    ) -> Result<NetworkSecurityGroup>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &NetworkSecurityGroupFilter,
        page: &PageInput,
        relations: &[NetworkSecurityGroupRelation],
    ) -> Result<(Vec<NetworkSecurityGroup>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        request: UpdateNetworkSecurityGroupRequest,
    ) -> Result<NetworkSecurityGroup>;
    async fn delete(&self, tx: Option<&mut Tx>, id: &str) -> Result<()>;
}

pub struct SqlxNetworkSecurityGroupRepository {
    pool: DbPool,
}

impl SqlxNetworkSecurityGroupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load security groups by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[String],
) -> Result<HashMap<String, NetworkSecurityGroup>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, NetworkSecurityGroupRow>(
        "SELECT * FROM network_security_group WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to load network security groups"))?;

    rows.into_iter()
        .map(|row| NetworkSecurityGroup::try_from(row).map(|g| (g.id.clone(), g)))
        .collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    groups: &mut [NetworkSecurityGroup],
    relations: &[NetworkSecurityGroupRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            NetworkSecurityGroupRelation::Site => {
                let ids = distinct_ids(groups.iter().map(|g| g.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for group in groups.iter_mut() {
                    group.site = sites.get(&group.site_id).cloned();
                }
            }
            NetworkSecurityGroupRelation::Tenant => {
                let ids = distinct_ids(groups.iter().map(|g| g.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for group in groups.iter_mut() {
                    group.tenant = tenants.get(&group.tenant_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: &str,
    relations: &[NetworkSecurityGroupRelation],
) -> Result<NetworkSecurityGroup> {
    let row = sqlx::query_as::<_, NetworkSecurityGroupRow>(
        "SELECT * FROM network_security_group WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch network security group {}", id)))?
    .ok_or_else(|| ForgeError::not_found("NetworkSecurityGroup", id))?;

    let mut groups = [NetworkSecurityGroup::try_from(row)?];
    attach_relations(conn, &mut groups, relations).await?;
    let [group] = groups;
    Ok(group)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &NetworkSecurityGroupFilter) {
    push_opt_strings(qb, "nsg.id", &filter.ids);
    push_opt_strings(qb, "nsg.name", &filter.names);
    push_opt_uuids(qb, "nsg.site_id", &filter.site_ids);
    push_opt_strings(qb, "nsg.tenant_org", &filter.tenant_orgs);
    push_opt_uuids(qb, "nsg.tenant_id", &filter.tenant_ids);
    push_opt_strings(qb, "nsg.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["nsg.name", "nsg.description", "nsg.status"],
        &["nsg.name", "nsg.description", "nsg.status", "nsg.labels::text"],
    );
}

#[async_trait]
impl NetworkSecurityGroupRepository for SqlxNetworkSecurityGroupRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, site_id = %request.site_id), name = "db_create_network_security_group")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateNetworkSecurityGroupRequest,
    ) -> Result<NetworkSecurityGroup> {
        let mut conn = acquire(&self.pool, tx).await?;
        let id = request.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let row = sqlx::query_as::<_, NetworkSecurityGroupRow>(
            "INSERT INTO network_security_group (id, name, description, site_id, tenant_org, \
             tenant_id, version, stateful_egress, rules, labels, status, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13) RETURNING *",
        )
        .bind(&id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.site_id)
        .bind(&request.tenant_org)
        .bind(request.tenant_id)
        .bind(&request.version)
        .bind(request.stateful_egress)
        .bind(Json(&request.rules))
        .bind(Json(&request.labels))
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create network security group"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_network_security_group_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        relations: &[NetworkSecurityGroupRelation],
    ) -> Result<NetworkSecurityGroup> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_network_security_groups")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &NetworkSecurityGroupFilter,
        page: &PageInput,
        relations: &[NetworkSecurityGroupRelation],
    ) -> Result<(Vec<NetworkSecurityGroup>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            NETWORK_SECURITY_GROUP_ORDER_FIELDS,
            "nsg.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM network_security_group nsg WHERE nsg.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count network security groups"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT nsg.* FROM network_security_group nsg WHERE nsg.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<NetworkSecurityGroupRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list network security groups"))?;

        let mut groups =
            rows.into_iter().map(NetworkSecurityGroup::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut groups, relations).await?;
        Ok((groups, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_network_security_group")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        request: UpdateNetworkSecurityGroupRequest,
    ) -> Result<NetworkSecurityGroup> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE network_security_group SET ");
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
        if let Some(v) = request.version {
            set.push("version = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.stateful_egress {
            set.push("stateful_egress = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.rules {
            set.push("rules = ").push_bind_unseparated(Json(v));
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
        qb.push(" WHERE id = ").push_bind(id.to_string()).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update network security group {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("NetworkSecurityGroup", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_network_security_group")]
    async fn delete(&self, tx: Option<&mut Tx>, id: &str) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE network_security_group SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to delete network security group {}", id))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_shape() {
        let rule = NetworkSecurityGroupRule {
            direction: "EGRESS".to_string(),
            protocol: "ANY".to_string(),
            action: "DENY".to_string(),
            priority: 55,
            src_port_start: Some(55),
            src_prefix: Some("0.0.0.0/0".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["srcPortStart"], 55);
        assert_eq!(json["srcPrefix"], "0.0.0.0/0");

        let parsed: NetworkSecurityGroupRule =
            serde_json::from_value(serde_json::json!({"priority": 7})).unwrap();
        assert_eq!(parsed.priority, 7);
        assert!(parsed.dst_port_end.is_none());
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::{TestDatabase, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID};

        fn request(id: Option<&str>, name: &str) -> CreateNetworkSecurityGroupRequest {
            CreateNetworkSecurityGroupRequest {
                id: id.map(str::to_string),
                name: name.to_string(),
                description: Some("web tier".to_string()),
                site_id: TEST_SITE_ID,
                tenant_org: "test-org".to_string(),
                tenant_id: TEST_TENANT_ID,
                version: None,
                stateful_egress: true,
                rules: vec![NetworkSecurityGroupRule {
                    id: Some("r1".to_string()),
                    direction: "INGRESS".to_string(),
                    protocol: "TCP".to_string(),
                    action: "PERMIT".to_string(),
                    priority: 10,
                    dst_port_start: Some(443),
                    dst_port_end: Some(443),
                    ..Default::default()
                }],
                labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
                status: NetworkSecurityGroupStatus::Pending,
                created_by: TEST_USER_ID,
            }
        }

        #[tokio::test]
        async fn test_caller_supplied_and_generated_ids() {
            let db = TestDatabase::new("nsg_ids").await;
            let repo = SqlxNetworkSecurityGroupRepository::new(db.pool.clone());

            let named = repo.create(None, request(Some("nsg-web"), "web")).await.unwrap();
            assert_eq!(named.id, "nsg-web");
            assert_eq!(named.rules.len(), 1);
            assert_eq!(named.labels.get("env").map(String::as_str), Some("prod"));

            let generated = repo.create(None, request(None, "db")).await.unwrap();
            assert!(Uuid::parse_str(&generated.id).is_ok());

            let duplicate = repo.create(None, request(Some("nsg-web"), "again")).await.unwrap_err();
            assert!(duplicate.is_unique_violation());

            let fetched = repo
                .get_by_id(
                    None,
                    "nsg-web",
                    &[NetworkSecurityGroupRelation::Site, NetworkSecurityGroupRelation::Tenant],
                )
                .await
                .unwrap();
            assert_eq!(fetched.site.map(|s| s.id), Some(TEST_SITE_ID));
            assert_eq!(fetched.tenant.map(|t| t.id), Some(TEST_TENANT_ID));
        }

        #[tokio::test]
        async fn test_update_rules_and_delete() {
            let db = TestDatabase::new("nsg_update").await;
            let repo = SqlxNetworkSecurityGroupRepository::new(db.pool.clone());

            let group = repo.create(None, request(Some("nsg-a"), "a")).await.unwrap();
            let updated = repo
                .update(
                    None,
                    &group.id,
                    UpdateNetworkSecurityGroupRequest {
                        rules: Some(vec![]),
                        status: Some(NetworkSecurityGroupStatus::Ready),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(updated.rules.is_empty());
            assert_eq!(updated.status, NetworkSecurityGroupStatus::Ready);

            let (rows, total) = repo
                .get_all(
                    None,
                    &NetworkSecurityGroupFilter {
                        statuses: Some(vec![NetworkSecurityGroupStatus::Ready]),
                        tenant_ids: Some(vec![TEST_TENANT_ID]),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].id, "nsg-a");

            repo.delete(None, &group.id).await.unwrap();
            repo.delete(None, &group.id).await.unwrap();
            assert!(repo.get_by_id(None, &group.id, &[]).await.unwrap_err().is_not_found());
        }
    }
}
