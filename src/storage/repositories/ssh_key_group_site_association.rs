//! SSH key group deployment to a site
//!
//! Each association carries its own `version`: a digest of the keys in the group,
//! which the site agent compares against what it last applied.

use super::distinct_ids;
use super::site::{self, Site};
use super::ssh_key_association::key_ids_for_group;
use super::ssh_key_group::{self, SshKeyGroup};
use crate::domain::{parse_status, status_strings, SshKeyGroupStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_opt_strings, push_opt_uuids};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use tracing::instrument;
use uuid::Uuid;

pub const SSH_KEY_GROUP_SITE_ASSOCIATION_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("status", "skgsa.status"),
    OrderField::new("created", "skgsa.created"),
    OrderField::new("updated", "skgsa.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshKeyGroupSiteAssociationRelation {
    SshKeyGroup,
    Site,
}

/// Database row structure for SSH key group site associations
#[derive(Debug, Clone, FromRow)]
struct SshKeyGroupSiteAssociationRow {
    id: Uuid,
    sshkey_group_id: Uuid,
    site_id: Uuid,
    version: Option<String>,
    status: String,
    is_missing_on_site: bool,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyGroupSiteAssociation {
    pub id: Uuid,
    pub sshkey_group_id: Uuid,
    pub sshkey_group: Option<SshKeyGroup>,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub version: Option<String>,
    pub status: SshKeyGroupStatus,
    pub is_missing_on_site: bool,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<SshKeyGroupSiteAssociationRow> for SshKeyGroupSiteAssociation {
    type Error = ForgeError;

    fn try_from(row: SshKeyGroupSiteAssociationRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            sshkey_group_id: row.sshkey_group_id,
            sshkey_group: None,
            site_id: row.site_id,
            site: None,
            version: row.version,
            is_missing_on_site: row.is_missing_on_site,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSshKeyGroupSiteAssociationRequest {
    pub sshkey_group_id: Uuid,
    pub site_id: Uuid,
    pub version: Option<String>,
    pub status: SshKeyGroupStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSshKeyGroupSiteAssociationRequest {
    pub sshkey_group_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub version: Option<String>,
    pub status: Option<SshKeyGroupStatus>,
    pub is_missing_on_site: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshKeyGroupSiteAssociationFilter {
    pub sshkey_group_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub versions: Option<Vec<String>>,
    pub statuses: Option<Vec<SshKeyGroupStatus>>,
}

#[async_trait]
pub trait SshKeyGroupSiteAssociationRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyGroupSiteAssociationRequest,
    ) -> Result<SshKeyGroupSiteAssociation>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyGroupSiteAssociationRelation],
    ) -> Result<SshKeyGroupSiteAssociation>;
    async fn get_by_group_and_site(
        &self,
        tx: Option<&mut Tx>,
        sshkey_group_id: Uuid,
        site_id: Uuid,
        relations: &[SshKeyGroupSiteAssociationRelation],
    ) -> Result<SshKeyGroupSiteAssociation>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyGroupSiteAssociationFilter,
        page: &PageInput,
        relations: &[SshKeyGroupSiteAssociationRelation],
    ) -> Result<(Vec<SshKeyGroupSiteAssociation>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyGroupSiteAssociationRequest,
    ) -> Result<SshKeyGroupSiteAssociation>;
    /// Store the digest of the group's current keys as this association's version
    async fn generate_and_update_version(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
    ) -> Result<SshKeyGroupSiteAssociation>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxSshKeyGroupSiteAssociationRepository {
    pool: DbPool,
}

impl SqlxSshKeyGroupSiteAssociationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Digest over the group id followed by its key ids
pub(crate) fn association_version(sshkey_group_id: Uuid, key_ids: &[Uuid]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sshkey_group_id.to_string().as_bytes());
    for key_id in key_ids {
        hasher.update(key_id.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

async fn attach_relations(
    conn: &mut PgConnection,
    associations: &mut [SshKeyGroupSiteAssociation],
    relations: &[SshKeyGroupSiteAssociationRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            SshKeyGroupSiteAssociationRelation::SshKeyGroup => {
                let ids = distinct_ids(associations.iter().map(|a| a.sshkey_group_id));
                let groups = ssh_key_group::load_by_ids(conn, &ids).await?;
                for association in associations.iter_mut() {
                    association.sshkey_group = groups.get(&association.sshkey_group_id).cloned();
                }
            }
            SshKeyGroupSiteAssociationRelation::Site => {
                let ids = distinct_ids(associations.iter().map(|a| a.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for association in associations.iter_mut() {
                    association.site = sites.get(&association.site_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[SshKeyGroupSiteAssociationRelation],
) -> Result<SshKeyGroupSiteAssociation> {
    let row = sqlx::query_as::<_, SshKeyGroupSiteAssociationRow>(
        "SELECT * FROM ssh_key_group_site_association WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ForgeError::database(e, format!("Failed to fetch SSH key group site association {}", id))
    })?
    .ok_or_else(|| ForgeError::not_found("SshKeyGroupSiteAssociation", id))?;

    let mut associations = [SshKeyGroupSiteAssociation::try_from(row)?];
    attach_relations(conn, &mut associations, relations).await?;
    let [association] = associations;
    Ok(association)
}

async fn apply_update(
    conn: &mut PgConnection,
    id: Uuid,
    request: UpdateSshKeyGroupSiteAssociationRequest,
) -> Result<()> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE ssh_key_group_site_association SET ");
    let mut set = qb.separated(", ");
    let mut changed = false;
    if let Some(v) = request.sshkey_group_id {
        set.push("sshkey_group_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.site_id {
        set.push("site_id = ").push_bind_unseparated(v);
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
    if let Some(v) = request.is_missing_on_site {
        set.push("is_missing_on_site = ").push_bind_unseparated(v);
        changed = true;
    }
    if !changed {
        return Ok(());
    }
    set.push("updated = ").push_bind_unseparated(Utc::now());
    qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

    let result = qb.build().execute(conn).await.map_err(|e| {
        ForgeError::database(e, format!("Failed to update SSH key group site association {}", id))
    })?;
    if result.rows_affected() == 0 {
        return Err(ForgeError::not_found("SshKeyGroupSiteAssociation", id));
    }
    Ok(())
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SshKeyGroupSiteAssociationFilter) {
    push_opt_uuids(qb, "skgsa.sshkey_group_id", &filter.sshkey_group_ids);
    push_opt_uuids(qb, "skgsa.site_id", &filter.site_ids);
    push_opt_strings(qb, "skgsa.version", &filter.versions);
    push_opt_strings(qb, "skgsa.status", &filter.statuses.as_deref().map(status_strings));
}

#[async_trait]
impl SshKeyGroupSiteAssociationRepository for SqlxSshKeyGroupSiteAssociationRepository {
    #[instrument(skip(self, tx, request), fields(sshkey_group_id = %request.sshkey_group_id, site_id = %request.site_id), name = "db_create_ssh_key_group_site_association")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyGroupSiteAssociationRequest,
    ) -> Result<SshKeyGroupSiteAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, SshKeyGroupSiteAssociationRow>(
            "INSERT INTO ssh_key_group_site_association \
             (id, sshkey_group_id, site_id, version, status, is_missing_on_site, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7, $7) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(request.sshkey_group_id)
        .bind(request.site_id)
        .bind(&request.version)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create SSH key group site association"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_ssh_key_group_site_association_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyGroupSiteAssociationRelation],
    ) -> Result<SshKeyGroupSiteAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx), fields(sshkey_group_id = %sshkey_group_id, site_id = %site_id), name = "db_get_ssh_key_group_site_association_by_group_and_site")]
    async fn get_by_group_and_site(
        &self,
        tx: Option<&mut Tx>,
        sshkey_group_id: Uuid,
        site_id: Uuid,
        relations: &[SshKeyGroupSiteAssociationRelation],
    ) -> Result<SshKeyGroupSiteAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, SshKeyGroupSiteAssociationRow>(
            "SELECT * FROM ssh_key_group_site_association \
             WHERE sshkey_group_id = $1 AND site_id = $2 AND deleted IS NULL \
             ORDER BY created ASC LIMIT 1",
        )
        .bind(sshkey_group_id)
        .bind(site_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, "Failed to fetch SSH key group site association by group and site")
        })?
        .ok_or_else(|| {
            ForgeError::not_found(
                "SshKeyGroupSiteAssociation",
                format!("group {} site {}", sshkey_group_id, site_id),
            )
        })?;

        let mut associations = [SshKeyGroupSiteAssociation::try_from(row)?];
        attach_relations(&mut conn, &mut associations, relations).await?;
        let [association] = associations;
        Ok(association)
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_ssh_key_group_site_associations")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyGroupSiteAssociationFilter,
        page: &PageInput,
        relations: &[SshKeyGroupSiteAssociationRelation],
    ) -> Result<(Vec<SshKeyGroupSiteAssociation>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            SSH_KEY_GROUP_SITE_ASSOCIATION_ORDER_FIELDS,
            "skgsa.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM ssh_key_group_site_association skgsa WHERE skgsa.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count SSH key group site associations"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT skgsa.* FROM ssh_key_group_site_association skgsa WHERE skgsa.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<SshKeyGroupSiteAssociationRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list SSH key group site associations"))?;

        let mut associations = rows
            .into_iter()
            .map(SshKeyGroupSiteAssociation::try_from)
            .collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut associations, relations).await?;
        Ok((associations, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_ssh_key_group_site_association")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyGroupSiteAssociationRequest,
    ) -> Result<SshKeyGroupSiteAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;
        apply_update(&mut conn, id, request).await?;
        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_generate_ssh_key_group_site_association_version")]
    async fn generate_and_update_version(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
    ) -> Result<SshKeyGroupSiteAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;

        let association = fetch_one(&mut conn, id, &[]).await?;
        let key_ids = key_ids_for_group(&mut conn, association.sshkey_group_id).await?;
        let version = association_version(association.sshkey_group_id, &key_ids);

        apply_update(
            &mut conn,
            id,
            UpdateSshKeyGroupSiteAssociationRequest { version: Some(version), ..Default::default() },
        )
        .await?;
        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_ssh_key_group_site_association")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE ssh_key_group_site_association SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to delete SSH key group site association {}", id))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_association_version_of_empty_group_is_seeded() {
        let group = Uuid::from_u128(7);
        let empty = association_version(group, &[]);

        assert_eq!(empty.len(), 64);
        assert_ne!(empty, association_version(Uuid::from_u128(8), &[]));
        assert_ne!(empty, association_version(group, &[Uuid::from_u128(9)]));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::repositories::ssh_key_group::{
            CreateSshKeyGroupRequest, SqlxSshKeyGroupRepository, SshKeyGroupRepository,
        };
        use crate::storage::test_helpers::{TestDatabase, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID};

        async fn seed_group(db: &TestDatabase) -> Uuid {
            SqlxSshKeyGroupRepository::new(db.pool.clone())
                .create(
                    None,
                    CreateSshKeyGroupRequest {
                        id: None,
                        name: "edge".to_string(),
                        description: None,
                        org: "test-org".to_string(),
                        tenant_id: TEST_TENANT_ID,
                        version: None,
                        status: SshKeyGroupStatus::Syncing,
                        created_by: TEST_USER_ID,
                    },
                )
                .await
                .unwrap()
                .id
        }

        #[tokio::test]
        async fn test_lookup_by_group_and_site() {
            let db = TestDatabase::new("skgsa_lookup").await;
            let repo = SqlxSshKeyGroupSiteAssociationRepository::new(db.pool.clone());
            let group_id = seed_group(&db).await;

            let created = repo
                .create(
                    None,
                    CreateSshKeyGroupSiteAssociationRequest {
                        sshkey_group_id: group_id,
                        site_id: TEST_SITE_ID,
                        version: None,
                        status: SshKeyGroupStatus::Syncing,
                        created_by: TEST_USER_ID,
                    },
                )
                .await
                .unwrap();
            assert!(!created.is_missing_on_site);

            let found = repo
                .get_by_group_and_site(
                    None,
                    group_id,
                    TEST_SITE_ID,
                    &[
                        SshKeyGroupSiteAssociationRelation::SshKeyGroup,
                        SshKeyGroupSiteAssociationRelation::Site,
                    ],
                )
                .await
                .unwrap();
            assert_eq!(found.id, created.id);
            assert_eq!(found.sshkey_group.map(|g| g.id), Some(group_id));
            assert_eq!(found.site.map(|s| s.id), Some(TEST_SITE_ID));

            let missing = repo
                .get_by_group_and_site(None, Uuid::new_v4(), TEST_SITE_ID, &[])
                .await
                .unwrap_err();
            assert!(missing.is_not_found());

            let versioned = repo.generate_and_update_version(None, created.id).await.unwrap();
            assert_eq!(versioned.version, Some(association_version(group_id, &[])));

            let (rows, total) = repo
                .get_all(
                    None,
                    &SshKeyGroupSiteAssociationFilter {
                        versions: versioned.version.clone().map(|v| vec![v]),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].id, created.id);

            repo.update(
                None,
                created.id,
                UpdateSshKeyGroupSiteAssociationRequest {
                    status: Some(SshKeyGroupStatus::Deleting),
                    is_missing_on_site: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            repo.delete(None, created.id).await.unwrap();
            repo.delete(None, created.id).await.unwrap();
            assert!(repo.get_by_id(None, created.id, &[]).await.unwrap_err().is_not_found());
        }
    }
}
