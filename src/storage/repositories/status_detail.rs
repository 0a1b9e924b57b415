//! Status history
//!
//! Every entity that reports progress (sites, VPCs, instances, ...) gets a trail
//! of status detail rows keyed by its id as text. Rows are never soft deleted.
//! An update that repeats the current status and message is a no-op; anything
//! else bumps `count`.

use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{check_batch_size, order_by_input, push_in_strings, record_batch_ids};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use tracing::{debug, field, instrument, Span};
use uuid::Uuid;

pub const STATUS_DETAIL_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("status", "sd.status"),
    OrderField::new("created", "sd.created"),
    OrderField::new("updated", "sd.updated"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StatusDetail {
    pub id: Uuid,
    pub entity_id: String,
    pub status: String,
    pub message: Option<String>,
    pub count: i32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStatusDetailRequest {
    pub entity_id: String,
    pub status: String,
    pub message: Option<String>,
}

/// Status is always supplied; `message` replaces the stored message, `None` clears it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusDetailRequest {
    pub status: String,
    pub message: Option<String>,
}

#[async_trait]
pub trait StatusDetailRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateStatusDetailRequest,
    ) -> Result<StatusDetail>;
    /// Insert all rows in one statement; results follow input order
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateStatusDetailRequest>,
    ) -> Result<Vec<StatusDetail>>;
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<StatusDetail>;
    /// Newest first unless `page` says otherwise
    async fn get_all_by_entity_id(
        &self,
        tx: Option<&mut Tx>,
        entity_id: &str,
        page: &PageInput,
    ) -> Result<(Vec<StatusDetail>, i64)>;
    /// Newest first unless `page` says otherwise. No ids means no rows.
    async fn get_all_by_entity_ids(
        &self,
        tx: Option<&mut Tx>,
        entity_ids: &[String],
        page: &PageInput,
    ) -> Result<(Vec<StatusDetail>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateStatusDetailRequest,
    ) -> Result<StatusDetail>;
    /// Up to `recent_count` newest rows for each entity
    async fn get_recent_by_entity_ids(
        &self,
        tx: Option<&mut Tx>,
        entity_ids: &[String],
        recent_count: i64,
    ) -> Result<Vec<StatusDetail>>;
}

pub struct SqlxStatusDetailRepository {
    pool: DbPool,
}

impl SqlxStatusDetailRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn fetch_one(conn: &mut PgConnection, id: Uuid) -> Result<StatusDetail> {
    sqlx::query_as::<_, StatusDetail>("SELECT * FROM status_detail WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to fetch status detail {}", id)))?
        .ok_or_else(|| ForgeError::not_found("StatusDetail", id))
}

async fn insert_rows(
    conn: &mut PgConnection,
    requests: Vec<CreateStatusDetailRequest>,
    ids: &[Uuid],
) -> Result<Vec<StatusDetail>> {
    let now = Utc::now();

    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO status_detail (id, entity_id, status, message, count, created, updated) ",
    );
    qb.push_values(ids.iter().zip(requests), |mut b, (id, r)| {
        b.push_bind(*id)
            .push_bind(r.entity_id)
            .push_bind(r.status)
            .push_bind(r.message)
            .push_bind(1_i32)
            .push_bind(now)
            .push_bind(now);
    });
    qb.push(" RETURNING *");

    let inserted = qb
        .build_query_as::<StatusDetail>()
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create status details"))?;

    order_by_input(ids, inserted, |d| &d.id)
}

async fn list_for_entities(
    conn: &mut PgConnection,
    entity_ids: &[String],
    page: &PageInput,
) -> Result<(Vec<StatusDetail>, i64)> {
    let paginator =
        Paginator::new(page, OrderBy::desc("created"), STATUS_DETAIL_ORDER_FIELDS, "sd.id")?;

    let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM status_detail sd WHERE TRUE");
    push_in_strings(&mut count_qb, "sd.entity_id", entity_ids);
    let total = count_qb
        .build_query_scalar::<i64>()
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to count status details"))?;

    let mut qb = QueryBuilder::<Postgres>::new("SELECT sd.* FROM status_detail sd WHERE TRUE");
    push_in_strings(&mut qb, "sd.entity_id", entity_ids);
    paginator.push_order_and_limit(&mut qb);
    let details = qb
        .build_query_as::<StatusDetail>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to list status details"))?;

    Ok((details, total))
}

#[async_trait]
impl StatusDetailRepository for SqlxStatusDetailRepository {
    #[instrument(skip(self, tx, request), fields(entity_id = %request.entity_id, status = %request.status), name = "db_create_status_detail")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateStatusDetailRequest,
    ) -> Result<StatusDetail> {
        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, vec![request], &[Uuid::new_v4()])
            .await?
            .pop()
            .ok_or_else(|| ForgeError::internal("insert returned no status detail"))
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_create_multiple_status_details"
    )]
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateStatusDetailRequest>,
    ) -> Result<Vec<StatusDetail>> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = requests.iter().map(|_| Uuid::new_v4()).collect();
        record_batch_ids(&Span::current(), &ids);

        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, requests, &ids).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_status_detail_by_id")]
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<StatusDetail> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id).await
    }

    #[instrument(skip(self, tx), fields(entity_id = %entity_id, offset = ?page.offset, limit = ?page.limit), name = "db_get_all_status_details_by_entity_id")]
    async fn get_all_by_entity_id(
        &self,
        tx: Option<&mut Tx>,
        entity_id: &str,
        page: &PageInput,
    ) -> Result<(Vec<StatusDetail>, i64)> {
        let mut conn = acquire(&self.pool, tx).await?;
        list_for_entities(&mut conn, &[entity_id.to_string()], page).await
    }

    #[instrument(skip(self, tx, entity_ids), fields(entities = entity_ids.len(), offset = ?page.offset, limit = ?page.limit), name = "db_get_all_status_details_by_entity_ids")]
    async fn get_all_by_entity_ids(
        &self,
        tx: Option<&mut Tx>,
        entity_ids: &[String],
        page: &PageInput,
    ) -> Result<(Vec<StatusDetail>, i64)> {
        if entity_ids.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let mut conn = acquire(&self.pool, tx).await?;
        list_for_entities(&mut conn, entity_ids, page).await
    }

    #[instrument(skip(self, tx, request), fields(id = %id, status = %request.status), name = "db_update_status_detail")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateStatusDetailRequest,
    ) -> Result<StatusDetail> {
        if request.status.is_empty() {
            return Err(ForgeError::validation_field("status must not be empty", "status"));
        }

        let mut conn = acquire(&self.pool, tx).await?;
        let current = fetch_one(&mut conn, id).await?;
        if current.status == request.status && current.message == request.message {
            debug!("Status detail unchanged");
            return Ok(current);
        }

        sqlx::query_as::<_, StatusDetail>(
            "UPDATE status_detail SET status = $2, message = $3, count = count + 1, updated = $4 \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(&request.status)
        .bind(&request.message)
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to update status detail {}", id)))?
        .ok_or_else(|| ForgeError::not_found("StatusDetail", id))
    }

    #[instrument(skip(self, tx, entity_ids), fields(entities = entity_ids.len(), recent_count = recent_count), name = "db_get_recent_status_details")]
    async fn get_recent_by_entity_ids(
        &self,
        tx: Option<&mut Tx>,
        entity_ids: &[String],
        recent_count: i64,
    ) -> Result<Vec<StatusDetail>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query_as::<_, StatusDetail>(
            "SELECT id, entity_id, status, message, count, created, updated FROM ( \
                 SELECT sd.*, row_number() OVER (PARTITION BY entity_id ORDER BY created DESC, id ASC) AS rn \
                 FROM status_detail sd WHERE entity_id = ANY($1) \
             ) ranked WHERE rn <= $2 ORDER BY entity_id ASC, created DESC, id ASC",
        )
        .bind(entity_ids)
        .bind(recent_count)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to fetch recent status details"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::lazy_pool;

    #[tokio::test]
    async fn test_empty_inputs_never_touch_the_database() {
        let repo = SqlxStatusDetailRepository::new(lazy_pool());

        let (rows, total) = repo.get_all_by_entity_ids(None, &[], &PageInput::default()).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
        assert!(repo.get_recent_by_entity_ids(None, &[], 5).await.unwrap().is_empty());
        assert!(repo.create_multiple(None, Vec::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_rejects_empty_status() {
        let repo = SqlxStatusDetailRepository::new(lazy_pool());
        let err = repo
            .update(
                None,
                Uuid::new_v4(),
                UpdateStatusDetailRequest { status: String::new(), message: None },
            )
            .await
            .unwrap_err();

        match err {
            ForgeError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("status")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::TestDatabase;

        fn request(entity_id: &str, status: &str) -> CreateStatusDetailRequest {
            CreateStatusDetailRequest {
                entity_id: entity_id.to_string(),
                status: status.to_string(),
                message: Some(format!("{} reported {}", entity_id, status)),
            }
        }

        #[tokio::test]
        async fn test_update_counts_changes_only() {
            let db = TestDatabase::new("status_detail_update").await;
            let repo = SqlxStatusDetailRepository::new(db.pool.clone());

            let detail = repo.create(None, request("site-1", "Pending")).await.unwrap();
            assert_eq!(detail.count, 1);

            let same = repo
                .update(
                    None,
                    detail.id,
                    UpdateStatusDetailRequest {
                        status: "Pending".to_string(),
                        message: detail.message.clone(),
                    },
                )
                .await
                .unwrap();
            assert_eq!(same, detail);

            let changed = repo
                .update(
                    None,
                    detail.id,
                    UpdateStatusDetailRequest { status: "Registered".to_string(), message: None },
                )
                .await
                .unwrap();
            assert_eq!(changed.count, 2);
            assert_eq!(changed.message, None);
            assert!(changed.updated >= detail.updated);

            let missing = repo
                .update(
                    None,
                    Uuid::new_v4(),
                    UpdateStatusDetailRequest { status: "Error".to_string(), message: None },
                )
                .await
                .unwrap_err();
            assert!(missing.is_not_found());
        }

        #[tokio::test]
        async fn test_entity_listing_and_recent() {
            let db = TestDatabase::new("status_detail_recent").await;
            let repo = SqlxStatusDetailRepository::new(db.pool.clone());

            // created timestamps are taken per statement, so insert one at a time
            for status in ["Pending", "Provisioning", "Ready"] {
                repo.create(None, request("vpc-1", status)).await.unwrap();
            }
            let batch = repo
                .create_multiple(None, vec![request("vpc-2", "Pending"), request("vpc-3", "Error")])
                .await
                .unwrap();
            assert_eq!(batch[1].entity_id, "vpc-3");

            let (rows, total) =
                repo.get_all_by_entity_id(None, "vpc-1", &PageInput::default()).await.unwrap();
            assert_eq!(total, 3);
            assert_eq!(rows[0].status, "Ready");

            let (rows, total) = repo
                .get_all_by_entity_ids(
                    None,
                    &["vpc-1".to_string(), "vpc-3".to_string()],
                    &PageInput::default().with_limit(2).ordered_by(OrderBy::default_for("created")),
                )
                .await
                .unwrap();
            assert_eq!(total, 4);
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].status, "Pending");

            let recent = repo
                .get_recent_by_entity_ids(None, &["vpc-1".to_string(), "vpc-2".to_string()], 2)
                .await
                .unwrap();
            let summary: Vec<(&str, &str)> =
                recent.iter().map(|d| (d.entity_id.as_str(), d.status.as_str())).collect();
            assert_eq!(
                summary,
                [("vpc-1", "Ready"), ("vpc-1", "Provisioning"), ("vpc-2", "Pending")]
            );
        }
    }
}
