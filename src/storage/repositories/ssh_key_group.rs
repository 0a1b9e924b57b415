//! SSH key group repository
//!
//! A key group bundles SSH keys for distribution to sites. Its `version` is a digest
//! over the sites it is deployed to and the keys it holds, so site agents can tell
//! when their copy is stale.

use super::distinct_ids;
use super::ssh_key_association::key_ids_for_group;
use super::ssh_key_group_site_association::association_version;
use super::tenant::{self, Tenant};
use crate::domain::{parse_status, status_strings, SshKeyGroupStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

pub const SSH_KEY_GROUP_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "skg.name"),
    OrderField::new("status", "skg.status"),
    OrderField::new("created", "skg.created"),
    OrderField::new("updated", "skg.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshKeyGroupRelation {
    Tenant,
}

/// Database row structure for SSH key groups
#[derive(Debug, Clone, FromRow)]
struct SshKeyGroupRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    org: String,
    tenant_id: Uuid,
    version: Option<String>,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyGroup {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub version: Option<String>,
    pub status: SshKeyGroupStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<SshKeyGroupRow> for SshKeyGroup {
    type Error = ForgeError;

    fn try_from(row: SshKeyGroupRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            org: row.org,
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
pub struct CreateSshKeyGroupRequest {
    /// Generated when absent
    pub id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub tenant_id: Uuid,
    pub version: Option<String>,
    pub status: SshKeyGroupStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSshKeyGroupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub org: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub version: Option<String>,
    pub status: Option<SshKeyGroupStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshKeyGroupFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub tenant_orgs: Option<Vec<String>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub versions: Option<Vec<String>>,
    pub statuses: Option<Vec<SshKeyGroupStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait SshKeyGroupRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyGroupRequest,
    ) -> Result<SshKeyGroup>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyGroupRelation],
    ) -> Result<SshKeyGroup>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyGroupFilter,
        page: &PageInput,
        relations: &[SshKeyGroupRelation],
    ) -> Result<(Vec<SshKeyGroup>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyGroupRequest,
    ) -> Result<SshKeyGroup>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
    /// Recompute the group version from its sites and keys, and stamp every site
    /// association of the group with the matching key digest.
    async fn generate_and_update_version(&self, tx: Option<&mut Tx>, id: Uuid)
        -> Result<SshKeyGroup>;
}

pub struct SqlxSshKeyGroupRepository {
    pool: DbPool,
}

impl SqlxSshKeyGroupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Digest over the group id, its active site ids, the group id again, then its key ids
pub(crate) fn group_version(group_id: Uuid, site_ids: &[Uuid], key_ids: &[Uuid]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(group_id.to_string().as_bytes());
    for site_id in site_ids {
        hasher.update(site_id.to_string().as_bytes());
    }
    hasher.update(group_id.to_string().as_bytes());
    for key_id in key_ids {
        hasher.update(key_id.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Load key groups by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, SshKeyGroup>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, SshKeyGroupRow>("SELECT * FROM sshkey_group WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load SSH key groups"))?;

    rows.into_iter().map(|row| SshKeyGroup::try_from(row).map(|g| (g.id, g))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    groups: &mut [SshKeyGroup],
    relations: &[SshKeyGroupRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            SshKeyGroupRelation::Tenant => {
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
    id: Uuid,
    relations: &[SshKeyGroupRelation],
) -> Result<SshKeyGroup> {
    let row = sqlx::query_as::<_, SshKeyGroupRow>(
        "SELECT * FROM sshkey_group WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch SSH key group {}", id)))?
    .ok_or_else(|| ForgeError::not_found("SshKeyGroup", id))?;

    let mut groups = [SshKeyGroup::try_from(row)?];
    attach_relations(conn, &mut groups, relations).await?;
    let [group] = groups;
    Ok(group)
}

async fn apply_update(
    conn: &mut PgConnection,
    id: Uuid,
    request: UpdateSshKeyGroupRequest,
) -> Result<()> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE sshkey_group SET ");
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
    if let Some(v) = request.org {
        set.push("org = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.tenant_id {
        set.push("tenant_id = ").push_bind_unseparated(v);
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
        return Ok(());
    }
    set.push("updated = ").push_bind_unseparated(Utc::now());
    qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

    let result = qb
        .build()
        .execute(conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to update SSH key group {}", id)))?;
    if result.rows_affected() == 0 {
        return Err(ForgeError::not_found("SshKeyGroup", id));
    }
    Ok(())
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SshKeyGroupFilter) {
    push_opt_uuids(qb, "skg.id", &filter.ids);
    push_opt_strings(qb, "skg.name", &filter.names);
    push_opt_strings(qb, "skg.org", &filter.tenant_orgs);
    push_opt_uuids(qb, "skg.tenant_id", &filter.tenant_ids);
    push_opt_strings(qb, "skg.version", &filter.versions);
    push_opt_strings(qb, "skg.status", &filter.statuses.as_deref().map(status_strings));
    push_search(qb, filter.search_query.as_deref(), &["skg.name"], &["skg.name"]);
}

#[async_trait]
impl SshKeyGroupRepository for SqlxSshKeyGroupRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, tenant_id = %request.tenant_id), name = "db_create_ssh_key_group")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyGroupRequest,
    ) -> Result<SshKeyGroup> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, SshKeyGroupRow>(
            "INSERT INTO sshkey_group (id, name, description, org, tenant_id, version, status, \
             created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING *",
        )
        .bind(request.id.unwrap_or_else(Uuid::new_v4))
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.org)
        .bind(request.tenant_id)
        .bind(&request.version)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create SSH key group"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_ssh_key_group_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyGroupRelation],
    ) -> Result<SshKeyGroup> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_ssh_key_groups")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyGroupFilter,
        page: &PageInput,
        relations: &[SshKeyGroupRelation],
    ) -> Result<(Vec<SshKeyGroup>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            SSH_KEY_GROUP_ORDER_FIELDS,
            "skg.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM sshkey_group skg WHERE skg.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count SSH key groups"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT skg.* FROM sshkey_group skg WHERE skg.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<SshKeyGroupRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list SSH key groups"))?;

        let mut groups = rows.into_iter().map(SshKeyGroup::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut groups, relations).await?;
        Ok((groups, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_ssh_key_group")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyGroupRequest,
    ) -> Result<SshKeyGroup> {
        let mut conn = acquire(&self.pool, tx).await?;
        apply_update(&mut conn, id, request).await?;
        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_ssh_key_group")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE sshkey_group SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete SSH key group {}", id)))?;

        Ok(())
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_generate_ssh_key_group_version")]
    async fn generate_and_update_version(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
    ) -> Result<SshKeyGroup> {
        let mut conn = acquire(&self.pool, tx).await?;

        let group = fetch_one(&mut conn, id, &[]).await?;

        let site_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT site_id FROM ssh_key_group_site_association \
             WHERE sshkey_group_id = $1 AND deleted IS NULL AND status <> $2 \
             ORDER BY created ASC, id ASC",
        )
        .bind(group.id)
        .bind(SshKeyGroupStatus::Deleting.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to list sites of SSH key group {}", id)))?;
        let key_ids = key_ids_for_group(&mut conn, group.id).await?;

        let version = group_version(group.id, &site_ids, &key_ids);
        let site_version = association_version(group.id, &key_ids);
        debug!(sites = site_ids.len(), keys = key_ids.len(), %version, "Computed SSH key group version");

        apply_update(
            &mut conn,
            group.id,
            UpdateSshKeyGroupRequest { version: Some(version), ..Default::default() },
        )
        .await?;

        sqlx::query(
            "UPDATE ssh_key_group_site_association SET version = $2, updated = $3 \
             WHERE sshkey_group_id = $1 AND deleted IS NULL",
        )
        .bind(group.id)
        .bind(&site_version)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to stamp site versions of SSH key group {}", id))
        })?;

        fetch_one(&mut conn, group.id, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_version_depends_on_order_and_members() {
        let group = Uuid::from_u128(1);
        let (a, b) = (Uuid::from_u128(2), Uuid::from_u128(3));

        let base = group_version(group, &[a], &[b]);
        assert_eq!(base.len(), 64);
        assert_eq!(base, group_version(group, &[a], &[b]));
        assert_ne!(base, group_version(group, &[], &[b]));
        assert_ne!(group_version(group, &[], &[a, b]), group_version(group, &[], &[b, a]));
        assert_ne!(base, association_version(group, &[b]));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::repositories::ssh_key::{
            CreateSshKeyRequest, SqlxSshKeyRepository, SshKeyRepository,
        };
        use crate::storage::repositories::ssh_key_association::{
            CreateSshKeyAssociationRequest, SqlxSshKeyAssociationRepository,
            SshKeyAssociationRepository,
        };
        use crate::storage::repositories::ssh_key_group_site_association::{
            CreateSshKeyGroupSiteAssociationRequest, SqlxSshKeyGroupSiteAssociationRepository,
            SshKeyGroupSiteAssociationRepository,
        };
        use crate::storage::test_helpers::{TestDatabase, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID};
        use crate::storage::Tx;

        fn request(id: Option<Uuid>, name: &str) -> CreateSshKeyGroupRequest {
            CreateSshKeyGroupRequest {
                id,
                name: name.to_string(),
                description: Some("bastion access".to_string()),
                org: "test-org".to_string(),
                tenant_id: TEST_TENANT_ID,
                version: None,
                status: SshKeyGroupStatus::Syncing,
                created_by: TEST_USER_ID,
            }
        }

        #[tokio::test]
        async fn test_caller_id_filters_and_update() {
            let db = TestDatabase::new("ssh_key_group_crud").await;
            let repo = SqlxSshKeyGroupRepository::new(db.pool.clone());

            let fixed = Uuid::new_v4();
            let group = repo.create(None, request(Some(fixed), "ops")).await.unwrap();
            assert_eq!(group.id, fixed);
            repo.create(None, request(None, "dev")).await.unwrap();

            let updated = repo
                .update(
                    None,
                    fixed,
                    UpdateSshKeyGroupRequest {
                        status: Some(SshKeyGroupStatus::Synced),
                        version: Some("v1".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(updated.status, SshKeyGroupStatus::Synced);

            let (rows, total) = repo
                .get_all(
                    None,
                    &SshKeyGroupFilter {
                        versions: Some(vec!["v1".to_string()]),
                        statuses: Some(vec![SshKeyGroupStatus::Synced]),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[SshKeyGroupRelation::Tenant],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].id, fixed);
            assert!(rows[0].tenant.is_some());

            let (_, total) = repo
                .get_all(
                    None,
                    &SshKeyGroupFilter { search_query: Some("dev".to_string()), ..Default::default() },
                    &PageInput::default(),
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
        }

        #[tokio::test]
        async fn test_generate_and_update_version() {
            let db = TestDatabase::new("ssh_key_group_version").await;
            let repo = SqlxSshKeyGroupRepository::new(db.pool.clone());
            let keys = SqlxSshKeyRepository::new(db.pool.clone());
            let memberships = SqlxSshKeyAssociationRepository::new(db.pool.clone());
            let sites = SqlxSshKeyGroupSiteAssociationRepository::new(db.pool.clone());

            let group = repo.create(None, request(None, "fleet")).await.unwrap();
            let site_association = sites
                .create(
                    None,
                    CreateSshKeyGroupSiteAssociationRequest {
                        sshkey_group_id: group.id,
                        site_id: TEST_SITE_ID,
                        version: None,
                        status: SshKeyGroupStatus::Syncing,
                        created_by: TEST_USER_ID,
                    },
                )
                .await
                .unwrap();

            let mut key_ids = Vec::new();
            for name in ["k1", "k2"] {
                let key = keys
                    .create(
                        None,
                        CreateSshKeyRequest {
                            name: name.to_string(),
                            org: "test-org".to_string(),
                            tenant_id: TEST_TENANT_ID,
                            public_key: format!("ssh-ed25519 AAAA {}", name),
                            fingerprint: None,
                            expires: None,
                            created_by: TEST_USER_ID,
                        },
                    )
                    .await
                    .unwrap();
                memberships
                    .create(
                        None,
                        CreateSshKeyAssociationRequest {
                            ssh_key_id: key.id,
                            sshkey_group_id: group.id,
                            created_by: TEST_USER_ID,
                        },
                    )
                    .await
                    .unwrap();
                key_ids.push(key.id);
            }

            let mut tx = Tx::begin(&db.pool).await.unwrap();
            let versioned = repo.generate_and_update_version(Some(&mut tx), group.id).await.unwrap();
            tx.commit().await.unwrap();

            assert_eq!(
                versioned.version.as_deref(),
                Some(group_version(group.id, &[TEST_SITE_ID], &key_ids).as_str())
            );

            let stamped = sites.get_by_id(None, site_association.id, &[]).await.unwrap();
            assert_eq!(
                stamped.version.as_deref(),
                Some(association_version(group.id, &key_ids).as_str())
            );

            // regenerating the association alone agrees with the group's stamp
            let regenerated = sites.generate_and_update_version(None, site_association.id).await.unwrap();
            assert_eq!(regenerated.version, stamped.version);

            let err = repo.generate_and_update_version(None, Uuid::new_v4()).await.unwrap_err();
            assert!(err.is_not_found());
        }
    }
}
