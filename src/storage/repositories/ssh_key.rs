//! SSH public key repository

use super::distinct_ids;
use super::tenant::{self, Tenant};
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

pub const SSH_KEY_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "sk.name"),
    OrderField::new("org", "sk.org"),
    OrderField::new("tenant_id", "sk.tenant_id"),
    OrderField::new("created", "sk.created"),
    OrderField::new("updated", "sk.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshKeyRelation {
    Tenant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SshKey {
    pub id: Uuid,
    pub name: String,
    pub org: String,
    pub tenant_id: Uuid,
    #[sqlx(skip)]
    pub tenant: Option<Tenant>,
    pub public_key: String,
    pub fingerprint: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSshKeyRequest {
    pub name: String,
    pub org: String,
    pub tenant_id: Uuid,
    pub public_key: String,
    pub fingerprint: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSshKeyRequest {
    pub name: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshKeyFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub tenant_orgs: Option<Vec<String>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    /// Keys with a live association to any of these groups
    pub ssh_key_group_ids: Option<Vec<Uuid>>,
    pub fingerprints: Option<Vec<String>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait SshKeyRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateSshKeyRequest) -> Result<SshKey>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyRelation],
    ) -> Result<SshKey>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyFilter,
        page: &PageInput,
        relations: &[SshKeyRelation],
    ) -> Result<(Vec<SshKey>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyRequest,
    ) -> Result<SshKey>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxSshKeyRepository {
    pool: DbPool,
}

impl SqlxSshKeyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load SSH keys by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, SshKey>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let keys = sqlx::query_as::<_, SshKey>("SELECT * FROM ssh_key WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load SSH keys"))?;

    Ok(keys.into_iter().map(|k| (k.id, k)).collect())
}

async fn attach_relations(
    conn: &mut PgConnection,
    keys: &mut [SshKey],
    relations: &[SshKeyRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            SshKeyRelation::Tenant => {
                let ids = distinct_ids(keys.iter().map(|k| k.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for key in keys.iter_mut() {
                    key.tenant = tenants.get(&key.tenant_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[SshKeyRelation],
) -> Result<SshKey> {
    let key =
        sqlx::query_as::<_, SshKey>("SELECT * FROM ssh_key WHERE id = $1 AND deleted IS NULL")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to fetch SSH key {}", id)))?
            .ok_or_else(|| ForgeError::not_found("SshKey", id))?;

    let mut keys = [key];
    attach_relations(conn, &mut keys, relations).await?;
    let [key] = keys;
    Ok(key)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SshKeyFilter) {
    push_opt_uuids(qb, "sk.id", &filter.ids);
    push_opt_strings(qb, "sk.name", &filter.names);
    push_opt_strings(qb, "sk.org", &filter.tenant_orgs);
    push_opt_uuids(qb, "sk.tenant_id", &filter.tenant_ids);
    if let Some(group_ids) = &filter.ssh_key_group_ids {
        // EXISTS keeps one row per key however many groups match
        qb.push(
            " AND EXISTS (SELECT 1 FROM ssh_key_association ska \
             WHERE ska.ssh_key_id = sk.id AND ska.deleted IS NULL",
        );
        push_opt_uuids(qb, "ska.sshkey_group_id", &Some(group_ids.clone()));
        qb.push(")");
    }
    push_opt_strings(qb, "sk.fingerprint", &filter.fingerprints);
    push_search(qb, filter.search_query.as_deref(), &["sk.name"], &["sk.name"]);
}

#[async_trait]
impl SshKeyRepository for SqlxSshKeyRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, tenant_id = %request.tenant_id), name = "db_create_ssh_key")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateSshKeyRequest) -> Result<SshKey> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query_as::<_, SshKey>(
            "INSERT INTO ssh_key (id, name, org, tenant_id, public_key, fingerprint, expires, \
             created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.org)
        .bind(request.tenant_id)
        .bind(&request.public_key)
        .bind(&request.fingerprint)
        .bind(request.expires)
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create SSH key"))
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_ssh_key_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyRelation],
    ) -> Result<SshKey> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_ssh_keys")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyFilter,
        page: &PageInput,
        relations: &[SshKeyRelation],
    ) -> Result<(Vec<SshKey>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), SSH_KEY_ORDER_FIELDS, "sk.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM ssh_key sk WHERE sk.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count SSH keys"))?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT sk.* FROM ssh_key sk WHERE sk.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let mut keys = qb
            .build_query_as::<SshKey>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list SSH keys"))?;

        attach_relations(&mut conn, &mut keys, relations).await?;
        Ok((keys, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_ssh_key")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyRequest,
    ) -> Result<SshKey> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ssh_key SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.name {
            set.push("name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.expires {
            set.push("expires = ").push_bind_unseparated(v);
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
            .map_err(|e| ForgeError::database(e, format!("Failed to update SSH key {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("SshKey", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_ssh_key")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE ssh_key SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete SSH key {}", id)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_filter_uses_exists() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT sk.* FROM ssh_key sk WHERE TRUE");
        push_filter(
            &mut qb,
            &SshKeyFilter { ssh_key_group_ids: Some(vec![Uuid::new_v4()]), ..Default::default() },
        );
        assert!(qb.sql().ends_with(
            " AND EXISTS (SELECT 1 FROM ssh_key_association ska WHERE ska.ssh_key_id = sk.id \
             AND ska.deleted IS NULL AND ska.sshkey_group_id = $1)"
        ));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::{TestDatabase, TEST_TENANT_ID, TEST_USER_ID};

        fn key_request(name: &str) -> CreateSshKeyRequest {
            CreateSshKeyRequest {
                name: name.to_string(),
                org: "test-org".to_string(),
                tenant_id: TEST_TENANT_ID,
                public_key: format!("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA {}", name),
                fingerprint: Some(format!("SHA256:{}", name)),
                expires: None,
                created_by: TEST_USER_ID,
            }
        }

        #[tokio::test]
        async fn test_crud_and_group_filter() {
            let db = TestDatabase::new("ssh_key_crud").await;
            let repo = SqlxSshKeyRepository::new(db.pool.clone());

            let laptop = repo.create(None, key_request("laptop")).await.unwrap();
            let ci = repo.create(None, key_request("ci-runner")).await.unwrap();

            let group_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO sshkey_group (id, name, org, tenant_id, status, created_by) \
                 VALUES ($1, 'ops', 'test-org', $2, 'Syncing', $3)",
            )
            .bind(group_id)
            .bind(TEST_TENANT_ID)
            .bind(TEST_USER_ID)
            .execute(&db.pool)
            .await
            .unwrap();
            for deleted in [None, Some(Utc::now())] {
                sqlx::query(
                    "INSERT INTO ssh_key_association (id, ssh_key_id, sshkey_group_id, created_by, deleted) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(Uuid::new_v4())
                .bind(if deleted.is_none() { laptop.id } else { ci.id })
                .bind(group_id)
                .bind(TEST_USER_ID)
                .bind(deleted)
                .execute(&db.pool)
                .await
                .unwrap();
            }

            let (rows, total) = repo
                .get_all(
                    None,
                    &SshKeyFilter { ssh_key_group_ids: Some(vec![group_id]), ..Default::default() },
                    &PageInput::default(),
                    &[SshKeyRelation::Tenant],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].id, laptop.id);
            assert_eq!(rows[0].tenant.as_ref().map(|t| t.id), Some(TEST_TENANT_ID));

            let expires = Utc::now();
            let updated = repo
                .update(None, ci.id, UpdateSshKeyRequest { expires: Some(expires), ..Default::default() })
                .await
                .unwrap();
            assert_eq!(updated.expires.map(|e| e.timestamp()), Some(expires.timestamp()));

            let (rows, _) = repo
                .get_all(
                    None,
                    &SshKeyFilter { search_query: Some("runner".to_string()), ..Default::default() },
                    &PageInput::default(),
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].name, "ci-runner");

            repo.delete(None, ci.id).await.unwrap();
            assert!(repo.get_by_id(None, ci.id, &[]).await.unwrap_err().is_not_found());
        }
    }
}
