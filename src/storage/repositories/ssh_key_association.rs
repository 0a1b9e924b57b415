//! SSH key to key group membership

use super::distinct_ids;
use super::ssh_key::{self, SshKey};
use super::ssh_key_group::{self, SshKeyGroup};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::push_opt_uuids;
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use tracing::instrument;
use uuid::Uuid;

pub const SSH_KEY_ASSOCIATION_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("created", "ska.created"),
    OrderField::new("updated", "ska.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshKeyAssociationRelation {
    SshKey,
    SshKeyGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SshKeyAssociation {
    pub id: Uuid,
    pub ssh_key_id: Uuid,
    #[sqlx(skip)]
    pub ssh_key: Option<SshKey>,
    pub sshkey_group_id: Uuid,
    #[sqlx(skip)]
    pub sshkey_group: Option<SshKeyGroup>,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSshKeyAssociationRequest {
    pub ssh_key_id: Uuid,
    pub sshkey_group_id: Uuid,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSshKeyAssociationRequest {
    pub ssh_key_id: Option<Uuid>,
    pub sshkey_group_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshKeyAssociationFilter {
    pub ssh_key_ids: Option<Vec<Uuid>>,
    pub sshkey_group_ids: Option<Vec<Uuid>>,
}

#[async_trait]
pub trait SshKeyAssociationRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyAssociationRequest,
    ) -> Result<SshKeyAssociation>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyAssociationRelation],
    ) -> Result<SshKeyAssociation>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyAssociationFilter,
        page: &PageInput,
        relations: &[SshKeyAssociationRelation],
    ) -> Result<(Vec<SshKeyAssociation>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyAssociationRequest,
    ) -> Result<SshKeyAssociation>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxSshKeyAssociationRepository {
    pool: DbPool,
}

impl SqlxSshKeyAssociationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Ids of the keys currently in a group, oldest membership first
pub(crate) async fn key_ids_for_group(conn: &mut PgConnection, group_id: Uuid) -> Result<Vec<Uuid>> {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT ssh_key_id FROM ssh_key_association \
         WHERE sshkey_group_id = $1 AND deleted IS NULL ORDER BY created ASC, id ASC",
    )
    .bind(group_id)
    .fetch_all(conn)
    .await
    .map_err(|e| {
        ForgeError::database(e, format!("Failed to list SSH keys of group {}", group_id))
    })
}

async fn attach_relations(
    conn: &mut PgConnection,
    associations: &mut [SshKeyAssociation],
    relations: &[SshKeyAssociationRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            SshKeyAssociationRelation::SshKey => {
                let ids = distinct_ids(associations.iter().map(|a| a.ssh_key_id));
                let keys = ssh_key::load_by_ids(conn, &ids).await?;
                for association in associations.iter_mut() {
                    association.ssh_key = keys.get(&association.ssh_key_id).cloned();
                }
            }
            SshKeyAssociationRelation::SshKeyGroup => {
                let ids = distinct_ids(associations.iter().map(|a| a.sshkey_group_id));
                let groups = ssh_key_group::load_by_ids(conn, &ids).await?;
                for association in associations.iter_mut() {
                    association.sshkey_group = groups.get(&association.sshkey_group_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[SshKeyAssociationRelation],
) -> Result<SshKeyAssociation> {
    let association = sqlx::query_as::<_, SshKeyAssociation>(
        "SELECT * FROM ssh_key_association WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch SSH key association {}", id)))?
    .ok_or_else(|| ForgeError::not_found("SshKeyAssociation", id))?;

    let mut associations = [association];
    attach_relations(conn, &mut associations, relations).await?;
    let [association] = associations;
    Ok(association)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SshKeyAssociationFilter) {
    push_opt_uuids(qb, "ska.ssh_key_id", &filter.ssh_key_ids);
    push_opt_uuids(qb, "ska.sshkey_group_id", &filter.sshkey_group_ids);
}

#[async_trait]
impl SshKeyAssociationRepository for SqlxSshKeyAssociationRepository {
    #[instrument(skip(self, tx, request), fields(ssh_key_id = %request.ssh_key_id, sshkey_group_id = %request.sshkey_group_id), name = "db_create_ssh_key_association")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyAssociationRequest,
    ) -> Result<SshKeyAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query_as::<_, SshKeyAssociation>(
            "INSERT INTO ssh_key_association (id, ssh_key_id, sshkey_group_id, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $5) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(request.ssh_key_id)
        .bind(request.sshkey_group_id)
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create SSH key association"))
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_ssh_key_association_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyAssociationRelation],
    ) -> Result<SshKeyAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_ssh_key_associations")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyAssociationFilter,
        page: &PageInput,
        relations: &[SshKeyAssociationRelation],
    ) -> Result<(Vec<SshKeyAssociation>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            SSH_KEY_ASSOCIATION_ORDER_FIELDS,
            "ska.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM ssh_key_association ska WHERE ska.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count SSH key associations"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT ska.* FROM ssh_key_association ska WHERE ska.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let mut associations = qb
            .build_query_as::<SshKeyAssociation>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list SSH key associations"))?;

        attach_relations(&mut conn, &mut associations, relations).await?;
        Ok((associations, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_ssh_key_association")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyAssociationRequest,
    ) -> Result<SshKeyAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ssh_key_association SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.ssh_key_id {
            set.push("ssh_key_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.sshkey_group_id {
            set.push("sshkey_group_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update SSH key association {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("SshKeyAssociation", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_ssh_key_association")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE ssh_key_association SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to delete SSH key association {}", id))
        })?;

        Ok(())
    }
}

#[cfg(all(test, feature = "postgres_tests"))]
mod tests {
    use super::*;
    use crate::domain::SshKeyGroupStatus;
    use crate::storage::repositories::ssh_key::{
        CreateSshKeyRequest, SqlxSshKeyRepository, SshKeyRepository,
    };
    use crate::storage::repositories::ssh_key_group::{
        CreateSshKeyGroupRequest, SqlxSshKeyGroupRepository, SshKeyGroupRepository,
    };
    use crate::storage::test_helpers::{TestDatabase, TEST_TENANT_ID, TEST_USER_ID};

    #[tokio::test]
    async fn test_membership_lifecycle() {
        let db = TestDatabase::new("ssh_key_association").await;
        let keys = SqlxSshKeyRepository::new(db.pool.clone());
        let groups = SqlxSshKeyGroupRepository::new(db.pool.clone());
        let repo = SqlxSshKeyAssociationRepository::new(db.pool.clone());

        let group = groups
            .create(
                None,
                CreateSshKeyGroupRequest {
                    id: None,
                    name: "admins".to_string(),
                    description: None,
                    org: "test-org".to_string(),
                    tenant_id: TEST_TENANT_ID,
                    version: None,
                    status: SshKeyGroupStatus::Syncing,
                    created_by: TEST_USER_ID,
                },
            )
            .await
            .unwrap();

        let mut key_ids = Vec::new();
        for name in ["first", "second"] {
            let key = keys
                .create(
                    None,
                    CreateSshKeyRequest {
                        name: name.to_string(),
                        org: "test-org".to_string(),
                        tenant_id: TEST_TENANT_ID,
                        public_key: format!("ssh-rsa AAAAB3 {}", name),
                        fingerprint: None,
                        expires: None,
                        created_by: TEST_USER_ID,
                    },
                )
                .await
                .unwrap();
            repo.create(
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

        let (rows, total) = repo
            .get_all(
                None,
                &SshKeyAssociationFilter {
                    sshkey_group_ids: Some(vec![group.id]),
                    ..Default::default()
                },
                &PageInput::default(),
                &[SshKeyAssociationRelation::SshKey, SshKeyAssociationRelation::SshKeyGroup],
            )
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].ssh_key.as_ref().map(|k| k.name.as_str()), Some("first"));
        assert_eq!(rows[1].sshkey_group.as_ref().map(|g| g.id), Some(group.id));

        let mut conn = db.pool.acquire().await.unwrap();
        assert_eq!(key_ids_for_group(&mut conn, group.id).await.unwrap(), key_ids);

        repo.delete(None, rows[0].id).await.unwrap();
        assert_eq!(key_ids_for_group(&mut conn, group.id).await.unwrap(), vec![key_ids[1]]);
    }
}
