//! Infrastructure provider repository
//!
//! Providers own sites. They are looked up by id or by org and soft deleted.

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

pub const INFRASTRUCTURE_PROVIDER_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "ip.name"),
    OrderField::new("org", "ip.org"),
    OrderField::new("created", "ip.created"),
    OrderField::new("updated", "ip.updated"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InfrastructureProvider {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub org: String,
    pub org_display_name: Option<String>,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInfrastructureProviderRequest {
    pub name: String,
    pub display_name: Option<String>,
    pub org: String,
    pub org_display_name: Option<String>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInfrastructureProviderRequest {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub org_display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfrastructureProviderFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub orgs: Option<Vec<String>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait InfrastructureProviderRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateInfrastructureProviderRequest,
    ) -> Result<InfrastructureProvider>;
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<InfrastructureProvider>;
    async fn get_all_by_org(
        &self,
        tx: Option<&mut Tx>,
        org: &str,
    ) -> Result<Vec<InfrastructureProvider>>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InfrastructureProviderFilter,
        page: &PageInput,
    ) -> Result<(Vec<InfrastructureProvider>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInfrastructureProviderRequest,
    ) -> Result<InfrastructureProvider>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxInfrastructureProviderRepository {
    pool: DbPool,
}

impl SqlxInfrastructureProviderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load providers by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, InfrastructureProvider>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, InfrastructureProvider>(
        "SELECT * FROM infrastructure_provider WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to load infrastructure providers"))?;

    Ok(rows.into_iter().map(|p| (p.id, p)).collect())
}

async fn fetch_one(conn: &mut PgConnection, id: Uuid) -> Result<InfrastructureProvider> {
    sqlx::query_as::<_, InfrastructureProvider>(
        "SELECT * FROM infrastructure_provider WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(|e| {
        ForgeError::database(e, format!("Failed to fetch infrastructure provider {}", id))
    })?
    .ok_or_else(|| ForgeError::not_found("InfrastructureProvider", id))
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &InfrastructureProviderFilter) {
    push_opt_uuids(qb, "ip.id", &filter.ids);
    push_opt_strings(qb, "ip.name", &filter.names);
    push_opt_strings(qb, "ip.org", &filter.orgs);
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["ip.name", "ip.display_name"],
        &["ip.name", "ip.display_name"],
    );
}

#[async_trait]
impl InfrastructureProviderRepository for SqlxInfrastructureProviderRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, org = %request.org), name = "db_create_infrastructure_provider")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateInfrastructureProviderRequest,
    ) -> Result<InfrastructureProvider> {
        let mut conn = acquire(&self.pool, tx).await?;
        let now = Utc::now();

        sqlx::query_as::<_, InfrastructureProvider>(
            "INSERT INTO infrastructure_provider \
             (id, name, display_name, org, org_display_name, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.display_name)
        .bind(&request.org)
        .bind(&request.org_display_name)
        .bind(request.created_by)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create infrastructure provider"))
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_infrastructure_provider_by_id")]
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<InfrastructureProvider> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id).await
    }

    #[instrument(skip(self, tx), fields(org = %org), name = "db_get_all_infrastructure_providers_by_org")]
    async fn get_all_by_org(
        &self,
        tx: Option<&mut Tx>,
        org: &str,
    ) -> Result<Vec<InfrastructureProvider>> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query_as::<_, InfrastructureProvider>(
            "SELECT * FROM infrastructure_provider WHERE org = $1 AND deleted IS NULL \
             ORDER BY created ASC, id ASC",
        )
        .bind(org)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to list infrastructure providers for {}", org))
        })
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_infrastructure_providers")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InfrastructureProviderFilter,
        page: &PageInput,
    ) -> Result<(Vec<InfrastructureProvider>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            INFRASTRUCTURE_PROVIDER_ORDER_FIELDS,
            "ip.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM infrastructure_provider ip WHERE ip.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count infrastructure providers"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT ip.* FROM infrastructure_provider ip WHERE ip.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let providers = qb
            .build_query_as::<InfrastructureProvider>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list infrastructure providers"))?;

        Ok((providers, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_infrastructure_provider")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInfrastructureProviderRequest,
    ) -> Result<InfrastructureProvider> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE infrastructure_provider SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(name) = request.name {
            set.push("name = ").push_bind_unseparated(name);
            changed = true;
        }
        if let Some(display_name) = request.display_name {
            set.push("display_name = ").push_bind_unseparated(display_name);
            changed = true;
        }
        if let Some(org_display_name) = request.org_display_name {
            set.push("org_display_name = ").push_bind_unseparated(org_display_name);
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update infrastructure provider {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("InfrastructureProvider", id));
        }

        fetch_one(&mut conn, id).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_infrastructure_provider")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE infrastructure_provider SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ForgeError::database(e, format!("Failed to delete infrastructure provider {}", id))
        })?;

        Ok(())
    }
}

#[cfg(all(test, feature = "postgres_tests"))]
mod tests {
    use super::*;
    use crate::storage::paginator::{OrderBy, TOTAL_LIMIT};
    use crate::storage::test_helpers::{TestDatabase, TEST_PROVIDER_ID, TEST_USER_ID};

    fn request(name: &str, org: &str) -> CreateInfrastructureProviderRequest {
        CreateInfrastructureProviderRequest {
            name: name.to_string(),
            display_name: Some(format!("{} display", name)),
            org: org.to_string(),
            org_display_name: None,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let db = TestDatabase::new("ip_crud").await;
        let repo = SqlxInfrastructureProviderRepository::new(db.pool.clone());

        let created = repo.create(None, request("nvidia", "org-a")).await.expect("create");
        let fetched = repo.get_by_id(None, created.id).await.expect("get");
        assert_eq!(fetched, created);

        let updated = repo
            .update(
                None,
                created.id,
                UpdateInfrastructureProviderRequest {
                    org_display_name: Some("Org A".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.name, "nvidia");
        assert_eq!(updated.org_display_name.as_deref(), Some("Org A"));
        assert!(updated.updated > created.updated);

        repo.delete(None, created.id).await.expect("delete");
        assert!(repo.get_by_id(None, created.id).await.unwrap_err().is_not_found());
        // Deleting again is not an error
        repo.delete(None, created.id).await.expect("second delete");
        repo.delete(None, Uuid::new_v4()).await.expect("delete missing");
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let db = TestDatabase::new("ip_update_missing").await;
        let repo = SqlxInfrastructureProviderRepository::new(db.pool.clone());

        let err = repo
            .update(
                None,
                Uuid::new_v4(),
                UpdateInfrastructureProviderRequest {
                    name: Some("x".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_all_filters_and_pages() {
        let db = TestDatabase::new("ip_get_all").await;
        let repo = SqlxInfrastructureProviderRepository::new(db.pool.clone());

        for i in 0..5 {
            repo.create(None, request(&format!("provider-{}", i), "org-b")).await.unwrap();
        }

        let filter = InfrastructureProviderFilter {
            orgs: Some(vec!["org-b".to_string()]),
            ..Default::default()
        };
        let page = PageInput::default().with_limit(2).ordered_by(OrderBy::desc("name"));
        let (first, total) = repo.get_all(None, &filter, &page).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(first.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), [
            "provider-4",
            "provider-3"
        ]);

        let (again, _) = repo.get_all(None, &filter, &page).await.unwrap();
        assert_eq!(first, again);

        let (all, _) = repo
            .get_all(None, &filter, &PageInput::default().with_limit(TOTAL_LIMIT))
            .await
            .unwrap();
        assert_eq!(all.len(), 5);

        let none = InfrastructureProviderFilter {
            orgs: Some(vec!["org-b".to_string()]),
            names: Some(vec!["test-provider".to_string()]),
            ..Default::default()
        };
        let (rows, total) = repo.get_all(None, &none, &PageInput::default()).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);

        let search = InfrastructureProviderFilter {
            search_query: Some("provider-3".to_string()),
            ..Default::default()
        };
        let (rows, _) = repo.get_all(None, &search, &PageInput::default()).await.unwrap();
        assert!(rows.iter().any(|p| p.name == "provider-3"));

        let by_org = repo.get_all_by_org(None, "test-org").await.unwrap();
        assert_eq!(by_org.len(), 1);
        assert_eq!(by_org[0].id, TEST_PROVIDER_ID);
    }

    #[tokio::test]
    async fn test_invalid_order_field() {
        let db = TestDatabase::new("ip_bad_order").await;
        let repo = SqlxInfrastructureProviderRepository::new(db.pool.clone());

        let page = PageInput::default().ordered_by(OrderBy::default_for("display_name"));
        let err = repo.get_all(None, &Default::default(), &page).await.unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_create_inside_rolled_back_transaction() {
        let db = TestDatabase::new("ip_tx_rollback").await;
        let repo = SqlxInfrastructureProviderRepository::new(db.pool.clone());

        let mut tx = Tx::begin(&db.pool).await.unwrap();
        let created = repo.create(Some(&mut tx), request("ephemeral", "org-c")).await.unwrap();
        let seen = repo.get_by_id(Some(&mut tx), created.id).await.unwrap();
        assert_eq!(seen.id, created.id);
        tx.rollback().await.unwrap();

        assert!(repo.get_by_id(None, created.id).await.unwrap_err().is_not_found());
    }
}
