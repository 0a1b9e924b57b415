//! Site repository
//!
//! A site is a datacenter location run by an infrastructure provider. Sites carry
//! registration and serial console settings alongside their lifecycle status.

use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use crate::domain::{parse_status, status_strings, SiteStatus};
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

pub const SITE_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "st.name"),
    OrderField::new("status", "st.status"),
    OrderField::new("created", "st.created"),
    OrderField::new("updated", "st.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRelation {
    InfrastructureProvider,
}

/// Database row structure for sites
#[derive(Debug, Clone, FromRow)]
struct SiteRow {
    id: Uuid,
    name: String,
    display_name: Option<String>,
    description: Option<String>,
    org: String,
    infrastructure_provider_id: Uuid,
    site_controller_version: Option<String>,
    site_agent_version: Option<String>,
    registration_token: Option<String>,
    registration_token_expiration: Option<DateTime<Utc>>,
    is_infinity_enabled: bool,
    serial_console_hostname: Option<String>,
    is_serial_console_enabled: bool,
    serial_console_idle_timeout: Option<i32>,
    serial_console_max_session_length: Option<i32>,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub org: String,
    pub infrastructure_provider_id: Uuid,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub site_controller_version: Option<String>,
    pub site_agent_version: Option<String>,
    pub registration_token: Option<String>,
    pub registration_token_expiration: Option<DateTime<Utc>>,
    pub is_infinity_enabled: bool,
    pub serial_console_hostname: Option<String>,
    pub is_serial_console_enabled: bool,
    pub serial_console_idle_timeout: Option<i32>,
    pub serial_console_max_session_length: Option<i32>,
    pub status: SiteStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<SiteRow> for Site {
    type Error = ForgeError;

    fn try_from(row: SiteRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            org: row.org,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            site_controller_version: row.site_controller_version,
            site_agent_version: row.site_agent_version,
            registration_token: row.registration_token,
            registration_token_expiration: row.registration_token_expiration,
            is_infinity_enabled: row.is_infinity_enabled,
            serial_console_hostname: row.serial_console_hostname,
            is_serial_console_enabled: row.is_serial_console_enabled,
            serial_console_idle_timeout: row.serial_console_idle_timeout,
            serial_console_max_session_length: row.serial_console_max_session_length,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSiteRequest {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub org: String,
    pub infrastructure_provider_id: Uuid,
    pub site_controller_version: Option<String>,
    pub site_agent_version: Option<String>,
    pub registration_token: Option<String>,
    pub registration_token_expiration: Option<DateTime<Utc>>,
    pub is_infinity_enabled: bool,
    pub serial_console_hostname: Option<String>,
    pub is_serial_console_enabled: bool,
    pub serial_console_idle_timeout: Option<i32>,
    pub serial_console_max_session_length: Option<i32>,
    pub status: SiteStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSiteRequest {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub site_controller_version: Option<String>,
    pub site_agent_version: Option<String>,
    pub registration_token: Option<String>,
    pub registration_token_expiration: Option<DateTime<Utc>>,
    pub is_infinity_enabled: Option<bool>,
    pub serial_console_hostname: Option<String>,
    pub is_serial_console_enabled: Option<bool>,
    pub serial_console_idle_timeout: Option<i32>,
    pub serial_console_max_session_length: Option<i32>,
    pub status: Option<SiteStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub orgs: Option<Vec<String>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<SiteStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait SiteRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateSiteRequest) -> Result<Site>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SiteRelation],
    ) -> Result<Site>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SiteFilter,
        page: &PageInput,
        relations: &[SiteRelation],
    ) -> Result<(Vec<Site>, i64)>;
    async fn update(&self, tx: Option<&mut Tx>, id: Uuid, request: UpdateSiteRequest)
        -> Result<Site>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxSiteRepository {
    pool: DbPool,
}

impl SqlxSiteRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load sites by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Site>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, SiteRow>("SELECT * FROM site WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load sites"))?;

    rows.into_iter().map(|row| Site::try_from(row).map(|s| (s.id, s))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    sites: &mut [Site],
    relations: &[SiteRelation],
) -> Result<()> {
    if relations.contains(&SiteRelation::InfrastructureProvider) {
        let ids = distinct_ids(sites.iter().map(|s| s.infrastructure_provider_id));
        let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
        for site in sites.iter_mut() {
            site.infrastructure_provider = providers.get(&site.infrastructure_provider_id).cloned();
        }
    }
    Ok(())
}

async fn fetch_one(conn: &mut PgConnection, id: Uuid, relations: &[SiteRelation]) -> Result<Site> {
    let row = sqlx::query_as::<_, SiteRow>("SELECT * FROM site WHERE id = $1 AND deleted IS NULL")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to fetch site {}", id)))?
        .ok_or_else(|| ForgeError::not_found("Site", id))?;

    let mut sites = [Site::try_from(row)?];
    attach_relations(conn, &mut sites, relations).await?;
    let [site] = sites;
    Ok(site)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SiteFilter) {
    push_opt_uuids(qb, "st.id", &filter.ids);
    push_opt_strings(qb, "st.name", &filter.names);
    push_opt_strings(qb, "st.org", &filter.orgs);
    push_opt_uuids(qb, "st.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_strings(qb, "st.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["st.name", "st.description", "st.status"],
        &["st.name", "st.description", "st.status"],
    );
}

#[async_trait]
impl SiteRepository for SqlxSiteRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, org = %request.org), name = "db_create_site")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateSiteRequest) -> Result<Site> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, SiteRow>(
            "INSERT INTO site (id, name, display_name, description, org, infrastructure_provider_id, \
             site_controller_version, site_agent_version, registration_token, \
             registration_token_expiration, is_infinity_enabled, serial_console_hostname, \
             is_serial_console_enabled, serial_console_idle_timeout, \
             serial_console_max_session_length, status, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $18) \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.display_name)
        .bind(&request.description)
        .bind(&request.org)
        .bind(request.infrastructure_provider_id)
        .bind(&request.site_controller_version)
        .bind(&request.site_agent_version)
        .bind(&request.registration_token)
        .bind(request.registration_token_expiration)
        .bind(request.is_infinity_enabled)
        .bind(&request.serial_console_hostname)
        .bind(request.is_serial_console_enabled)
        .bind(request.serial_console_idle_timeout)
        .bind(request.serial_console_max_session_length)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create site"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_site_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[SiteRelation],
    ) -> Result<Site> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_sites")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &SiteFilter,
        page: &PageInput,
        relations: &[SiteRelation],
    ) -> Result<(Vec<Site>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), SITE_ORDER_FIELDS, "st.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM site st WHERE st.deleted IS NULL");
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count sites"))?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT st.* FROM site st WHERE st.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<SiteRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list sites"))?;

        let mut sites = rows.into_iter().map(Site::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut sites, relations).await?;
        Ok((sites, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_site")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateSiteRequest,
    ) -> Result<Site> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE site SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.name {
            set.push("name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.display_name {
            set.push("display_name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.description {
            set.push("description = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.site_controller_version {
            set.push("site_controller_version = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.site_agent_version {
            set.push("site_agent_version = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.registration_token {
            set.push("registration_token = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.registration_token_expiration {
            set.push("registration_token_expiration = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.is_infinity_enabled {
            set.push("is_infinity_enabled = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.serial_console_hostname {
            set.push("serial_console_hostname = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.is_serial_console_enabled {
            set.push("is_serial_console_enabled = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.serial_console_idle_timeout {
            set.push("serial_console_idle_timeout = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.serial_console_max_session_length {
            set.push("serial_console_max_session_length = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.status {
            set.push("status = ").push_bind_unseparated(v.as_str());
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
            .map_err(|e| ForgeError::database(e, format!("Failed to update site {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Site", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_site")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query("UPDATE site SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to delete site {}", id)))?;

        Ok(())
    }
}

#[cfg(all(test, feature = "postgres_tests"))]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{TestDatabase, TEST_PROVIDER_ID, TEST_SITE_ID, TEST_USER_ID};

    fn request(name: &str) -> CreateSiteRequest {
        CreateSiteRequest {
            name: name.to_string(),
            display_name: None,
            description: Some(format!("{} datacenter", name)),
            org: "test-org".to_string(),
            infrastructure_provider_id: TEST_PROVIDER_ID,
            site_controller_version: None,
            site_agent_version: None,
            registration_token: Some("token".to_string()),
            registration_token_expiration: None,
            is_infinity_enabled: false,
            serial_console_hostname: None,
            is_serial_console_enabled: false,
            serial_console_idle_timeout: None,
            serial_console_max_session_length: None,
            status: SiteStatus::Pending,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_relation_loading() {
        let db = TestDatabase::new("site_relations").await;
        let repo = SqlxSiteRepository::new(db.pool.clone());

        let plain = repo.get_by_id(None, TEST_SITE_ID, &[]).await.unwrap();
        assert!(plain.infrastructure_provider.is_none());

        let site = repo
            .get_by_id(None, TEST_SITE_ID, &[SiteRelation::InfrastructureProvider])
            .await
            .unwrap();
        assert_eq!(site.infrastructure_provider.as_ref().map(|p| p.id), Some(TEST_PROVIDER_ID));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_foreign_key_violation() {
        let db = TestDatabase::new("site_fk").await;
        let repo = SqlxSiteRepository::new(db.pool.clone());

        let mut bad = request("orphan");
        bad.infrastructure_provider_id = Uuid::new_v4();
        let err = repo.create(None, bad).await.unwrap_err();
        assert!(err.is_foreign_key_violation());
    }

    #[tokio::test]
    async fn test_filter_by_status_and_search() {
        let db = TestDatabase::new("site_filter").await;
        let repo = SqlxSiteRepository::new(db.pool.clone());

        let created = repo.create(None, request("santa-clara")).await.unwrap();
        let registered = repo
            .update(
                None,
                created.id,
                UpdateSiteRequest { status: Some(SiteStatus::Registered), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(registered.status, SiteStatus::Registered);

        let filter = SiteFilter {
            statuses: Some(vec![SiteStatus::Registered]),
            infrastructure_provider_ids: Some(vec![TEST_PROVIDER_ID]),
            ..Default::default()
        };
        let (sites, total) = repo
            .get_all(None, &filter, &PageInput::default(), &[SiteRelation::InfrastructureProvider])
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert!(sites.iter().all(|s| s.infrastructure_provider.is_some()));

        let search = SiteFilter { search_query: Some("datacenter".to_string()), ..Default::default() };
        let (sites, total) = repo.get_all(None, &search, &PageInput::default(), &[]).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(sites[0].id, created.id);

        let empty = SiteFilter { ids: Some(vec![]), ..Default::default() };
        let (sites, total) = repo.get_all(None, &empty, &PageInput::default(), &[]).await.unwrap();
        assert!(sites.is_empty());
        assert_eq!(total, 0);
    }
}
