//! SSH key group attachment to an instance

use super::distinct_ids;
use super::instance::{self, Instance};
use super::site::{self, Site};
use super::ssh_key_group::{self, SshKeyGroup};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{check_batch_size, order_by_input, push_opt_uuids, record_batch_ids};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use tracing::{field, instrument, Span};
use uuid::Uuid;

pub const SSH_KEY_GROUP_INSTANCE_ASSOCIATION_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("created", "skgia.created"),
    OrderField::new("updated", "skgia.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshKeyGroupInstanceAssociationRelation {
    SshKeyGroup,
    Site,
    Instance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SshKeyGroupInstanceAssociation {
    pub id: Uuid,
    pub sshkey_group_id: Uuid,
    #[sqlx(skip)]
    pub sshkey_group: Option<SshKeyGroup>,
    pub site_id: Uuid,
    #[sqlx(skip)]
    pub site: Option<Site>,
    pub instance_id: Uuid,
    #[sqlx(skip)]
    pub instance: Option<Instance>,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSshKeyGroupInstanceAssociationRequest {
    pub sshkey_group_id: Uuid,
    pub site_id: Uuid,
    pub instance_id: Uuid,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSshKeyGroupInstanceAssociationRequest {
    pub sshkey_group_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshKeyGroupInstanceAssociationFilter {
    pub sshkey_group_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub instance_ids: Option<Vec<Uuid>>,
}

#[async_trait]
pub trait SshKeyGroupInstanceAssociationRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyGroupInstanceAssociationRequest,
    ) -> Result<SshKeyGroupInstanceAssociation>;
    /// Insert all rows in one statement; results follow input order
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateSshKeyGroupInstanceAssociationRequest>,
    ) -> Result<Vec<SshKeyGroupInstanceAssociation>>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyGroupInstanceAssociationRelation],
    ) -> Result<SshKeyGroupInstanceAssociation>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyGroupInstanceAssociationFilter,
        page: &PageInput,
        relations: &[SshKeyGroupInstanceAssociationRelation],
    ) -> Result<(Vec<SshKeyGroupInstanceAssociation>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyGroupInstanceAssociationRequest,
    ) -> Result<SshKeyGroupInstanceAssociation>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxSshKeyGroupInstanceAssociationRepository {
    pool: DbPool,
}

impl SqlxSshKeyGroupInstanceAssociationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn attach_relations(
    conn: &mut PgConnection,
    associations: &mut [SshKeyGroupInstanceAssociation],
    relations: &[SshKeyGroupInstanceAssociationRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            SshKeyGroupInstanceAssociationRelation::SshKeyGroup => {
                let ids = distinct_ids(associations.iter().map(|a| a.sshkey_group_id));
                let groups = ssh_key_group::load_by_ids(conn, &ids).await?;
                for association in associations.iter_mut() {
                    association.sshkey_group = groups.get(&association.sshkey_group_id).cloned();
                }
            }
            SshKeyGroupInstanceAssociationRelation::Site => {
                let ids = distinct_ids(associations.iter().map(|a| a.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for association in associations.iter_mut() {
                    association.site = sites.get(&association.site_id).cloned();
                }
            }
            SshKeyGroupInstanceAssociationRelation::Instance => {
                let ids = distinct_ids(associations.iter().map(|a| a.instance_id));
                let instances = instance::load_by_ids(conn, &ids).await?;
                for association in associations.iter_mut() {
                    association.instance = instances.get(&association.instance_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[SshKeyGroupInstanceAssociationRelation],
) -> Result<SshKeyGroupInstanceAssociation> {
    let association = sqlx::query_as::<_, SshKeyGroupInstanceAssociation>(
        "SELECT * FROM ssh_key_group_instance_association WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ForgeError::database(e, format!("Failed to fetch SSH key group instance association {}", id))
    })?
    .ok_or_else(|| ForgeError::not_found("SshKeyGroupInstanceAssociation", id))?;

    let mut associations = [association];
    attach_relations(conn, &mut associations, relations).await?;
    let [association] = associations;
    Ok(association)
}

async fn insert_rows(
    conn: &mut PgConnection,
    requests: Vec<CreateSshKeyGroupInstanceAssociationRequest>,
    ids: &[Uuid],
) -> Result<Vec<SshKeyGroupInstanceAssociation>> {
    let now = Utc::now();

    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO ssh_key_group_instance_association \
         (id, sshkey_group_id, site_id, instance_id, created_by, created, updated) ",
    );
    qb.push_values(ids.iter().zip(requests), |mut b, (id, r)| {
        b.push_bind(*id)
            .push_bind(r.sshkey_group_id)
            .push_bind(r.site_id)
            .push_bind(r.instance_id)
            .push_bind(r.created_by)
            .push_bind(now)
            .push_bind(now);
    });
    qb.push(" RETURNING *");

    let inserted = qb
        .build_query_as::<SshKeyGroupInstanceAssociation>()
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create SSH key group instance associations"))?;

    order_by_input(ids, inserted, |a| &a.id)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SshKeyGroupInstanceAssociationFilter) {
    push_opt_uuids(qb, "skgia.sshkey_group_id", &filter.sshkey_group_ids);
    push_opt_uuids(qb, "skgia.site_id", &filter.site_ids);
    push_opt_uuids(qb, "skgia.instance_id", &filter.instance_ids);
}

#[async_trait]
impl SshKeyGroupInstanceAssociationRepository for SqlxSshKeyGroupInstanceAssociationRepository {
    #[instrument(skip(self, tx, request), fields(sshkey_group_id = %request.sshkey_group_id, instance_id = %request.instance_id), name = "db_create_ssh_key_group_instance_association")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateSshKeyGroupInstanceAssociationRequest,
    ) -> Result<SshKeyGroupInstanceAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, vec![request], &[Uuid::new_v4()])
            .await?
            .pop()
            .ok_or_else(|| ForgeError::internal("insert returned no SSH key group instance association"))
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_create_multiple_ssh_key_group_instance_associations"
    )]
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateSshKeyGroupInstanceAssociationRequest>,
    ) -> Result<Vec<SshKeyGroupInstanceAssociation>> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = requests.iter().map(|_| Uuid::new_v4()).collect();
        record_batch_ids(&Span::current(), &ids);

        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, requests, &ids).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_ssh_key_group_instance_association_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SshKeyGroupInstanceAssociationRelation],
    ) -> Result<SshKeyGroupInstanceAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_ssh_key_group_instance_associations")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SshKeyGroupInstanceAssociationFilter,
        page: &PageInput,
        relations: &[SshKeyGroupInstanceAssociationRelation],
    ) -> Result<(Vec<SshKeyGroupInstanceAssociation>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            SSH_KEY_GROUP_INSTANCE_ASSOCIATION_ORDER_FIELDS,
            "skgia.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM ssh_key_group_instance_association skgia WHERE skgia.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                ForgeError::database(e, "Failed to count SSH key group instance associations")
            })?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT skgia.* FROM ssh_key_group_instance_association skgia WHERE skgia.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let mut associations = qb
            .build_query_as::<SshKeyGroupInstanceAssociation>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| {
                ForgeError::database(e, "Failed to list SSH key group instance associations")
            })?;

        attach_relations(&mut conn, &mut associations, relations).await?;
        Ok((associations, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_ssh_key_group_instance_association")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSshKeyGroupInstanceAssociationRequest,
    ) -> Result<SshKeyGroupInstanceAssociation> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ssh_key_group_instance_association SET ");
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
        if let Some(v) = request.instance_id {
            set.push("instance_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update SSH key group instance association {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("SshKeyGroupInstanceAssociation", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_ssh_key_group_instance_association")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE ssh_key_group_instance_association SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to delete SSH key group instance association {}", id))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{lazy_pool, TEST_SITE_ID, TEST_USER_ID};
    use crate::storage::MAX_BATCH_ITEMS;

    fn request(sshkey_group_id: Uuid, instance_id: Uuid) -> CreateSshKeyGroupInstanceAssociationRequest {
        CreateSshKeyGroupInstanceAssociationRequest {
            sshkey_group_id,
            site_id: TEST_SITE_ID,
            instance_id,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_batch_limit_checked_before_connecting() {
        let repo = SqlxSshKeyGroupInstanceAssociationRepository::new(lazy_pool());
        let group = Uuid::new_v4();

        let requests = (0..=MAX_BATCH_ITEMS).map(|_| request(group, Uuid::new_v4())).collect();
        let err = repo.create_multiple(None, requests).await.unwrap_err();
        assert!(matches!(err, ForgeError::BatchTooLarge { size: 101, max: 100 }));

        assert!(repo.create_multiple(None, Vec::new()).await.unwrap().is_empty());
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::domain::SshKeyGroupStatus;
        use crate::storage::repositories::ssh_key_group::{
            CreateSshKeyGroupRequest, SqlxSshKeyGroupRepository, SshKeyGroupRepository,
        };
        use crate::storage::test_helpers::{TestDatabase, TEST_TENANT_ID};

        #[tokio::test]
        async fn test_create_multiple_and_filter_by_instance() {
            let db = TestDatabase::new("skgia_batch").await;
            let repo = SqlxSshKeyGroupInstanceAssociationRepository::new(db.pool.clone());
            let group = SqlxSshKeyGroupRepository::new(db.pool.clone())
                .create(
                    None,
                    CreateSshKeyGroupRequest {
                        id: None,
                        name: "admins".to_string(),
                        description: None,
                        org: "test-org".to_string(),
                        tenant_id: TEST_TENANT_ID,
                        version: None,
                        status: SshKeyGroupStatus::Synced,
                        created_by: TEST_USER_ID,
                    },
                )
                .await
                .unwrap();

            let mut instance_ids = Vec::new();
            for name in ["a", "b", "c"] {
                instance_ids.push(db.seed_instance(name).await);
            }

            let created = repo
                .create_multiple(
                    None,
                    instance_ids.iter().map(|instance_id| request(group.id, *instance_id)).collect(),
                )
                .await
                .unwrap();
            let created_instances: Vec<Uuid> = created.iter().map(|a| a.instance_id).collect();
            assert_eq!(created_instances, instance_ids);

            let (rows, total) = repo
                .get_all(
                    None,
                    &SshKeyGroupInstanceAssociationFilter {
                        instance_ids: Some(vec![instance_ids[1]]),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[
                        SshKeyGroupInstanceAssociationRelation::SshKeyGroup,
                        SshKeyGroupInstanceAssociationRelation::Instance,
                    ],
                )
                .await
                .unwrap();
            assert_eq!(total, 1);
            assert_eq!(rows[0].id, created[1].id);
            assert_eq!(rows[0].sshkey_group.as_ref().map(|g| g.id), Some(group.id));
            assert_eq!(rows[0].instance.as_ref().map(|i| i.name.as_str()), Some("b"));

            let moved = repo
                .update(
                    None,
                    created[0].id,
                    UpdateSshKeyGroupInstanceAssociationRequest {
                        instance_id: Some(instance_ids[2]),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(moved.instance_id, instance_ids[2]);

            let bad_instance = repo.create(None, request(group.id, Uuid::new_v4())).await.unwrap_err();
            assert!(bad_instance.is_foreign_key_violation());

            repo.delete(None, created[2].id).await.unwrap();
            let (_, total) = repo
                .get_all(
                    None,
                    &SshKeyGroupInstanceAssociationFilter {
                        sshkey_group_ids: Some(vec![group.id]),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(total, 2);
        }
    }
}
