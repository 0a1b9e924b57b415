//! Operating system repository
//!
//! Operating systems are either provider-wide (`infrastructure_provider_id` set) or
//! owned by a tenant (`tenant_id` set). Image based entries carry the image location
//! and checksum; iPXE based entries carry a script. `is_active` gates whether new
//! instances may use the entry.

use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use super::tenant::{self, Tenant};
use crate::domain::{parse_status, status_strings, OperatingSystemStatus, OperatingSystemType};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_eq, push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const OPERATING_SYSTEM_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "os.name"),
    OrderField::new("version", "os.version"),
    OrderField::new("status", "os.status"),
    OrderField::new("is_cloud_init", "os.is_cloud_init"),
    OrderField::new("created", "os.created"),
    OrderField::new("updated", "os.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingSystemRelation {
    InfrastructureProvider,
    Tenant,
}

/// Database row structure for operating systems
#[derive(Debug, Clone, FromRow)]
struct OperatingSystemRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    org: String,
    infrastructure_provider_id: Option<Uuid>,
    tenant_id: Option<Uuid>,
    controller_operating_system_id: Option<Uuid>,
    version: Option<String>,
    #[sqlx(rename = "type")]
    os_type: String,
    image_url: Option<String>,
    image_sha: Option<String>,
    image_auth_type: Option<String>,
    image_auth_token: Option<String>,
    image_disk: Option<String>,
    root_fs_id: Option<String>,
    root_fs_label: Option<String>,
    ipxe_script: Option<String>,
    user_data: Option<String>,
    is_cloud_init: bool,
    allow_override: bool,
    enable_block_storage: bool,
    phone_home_enabled: bool,
    is_active: bool,
    deactivation_note: Option<String>,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingSystem {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub infrastructure_provider_id: Option<Uuid>,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub tenant_id: Option<Uuid>,
    pub tenant: Option<Tenant>,
    pub controller_operating_system_id: Option<Uuid>,
    pub version: Option<String>,
    pub os_type: OperatingSystemType,
    pub image_url: Option<String>,
    pub image_sha: Option<String>,
    pub image_auth_type: Option<String>,
    #[serde(skip_serializing)]
    pub image_auth_token: Option<String>,
    pub image_disk: Option<String>,
    pub root_fs_id: Option<String>,
    pub root_fs_label: Option<String>,
    pub ipxe_script: Option<String>,
    pub user_data: Option<String>,
    pub is_cloud_init: bool,
    pub allow_override: bool,
    pub enable_block_storage: bool,
    pub phone_home_enabled: bool,
    pub is_active: bool,
    pub deactivation_note: Option<String>,
    pub status: OperatingSystemStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<OperatingSystemRow> for OperatingSystem {
    type Error = ForgeError;

    fn try_from(row: OperatingSystemRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            os_type: parse_status(&row.os_type)?,
            id: row.id,
            name: row.name,
            description: row.description,
            org: row.org,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            tenant_id: row.tenant_id,
            tenant: None,
            controller_operating_system_id: row.controller_operating_system_id,
            version: row.version,
            image_url: row.image_url,
            image_sha: row.image_sha,
            image_auth_type: row.image_auth_type,
            image_auth_token: row.image_auth_token,
            image_disk: row.image_disk,
            root_fs_id: row.root_fs_id,
            root_fs_label: row.root_fs_label,
            ipxe_script: row.ipxe_script,
            user_data: row.user_data,
            is_cloud_init: row.is_cloud_init,
            allow_override: row.allow_override,
            enable_block_storage: row.enable_block_storage,
            phone_home_enabled: row.phone_home_enabled,
            is_active: row.is_active,
            deactivation_note: row.deactivation_note,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOperatingSystemRequest {
    pub name: String,
    pub description: Option<String>,
    pub org: String,
    pub infrastructure_provider_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub controller_operating_system_id: Option<Uuid>,
    pub version: Option<String>,
    pub os_type: OperatingSystemType,
    pub image_url: Option<String>,
    pub image_sha: Option<String>,
    pub image_auth_type: Option<String>,
    pub image_auth_token: Option<String>,
    pub image_disk: Option<String>,
    pub root_fs_id: Option<String>,
    pub root_fs_label: Option<String>,
    pub ipxe_script: Option<String>,
    pub user_data: Option<String>,
    pub is_cloud_init: bool,
    pub allow_override: bool,
    pub enable_block_storage: bool,
    pub phone_home_enabled: bool,
    pub status: OperatingSystemStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateOperatingSystemRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub org: Option<String>,
    pub controller_operating_system_id: Option<Uuid>,
    pub version: Option<String>,
    pub os_type: Option<OperatingSystemType>,
    pub image_url: Option<String>,
    pub image_sha: Option<String>,
    pub image_auth_type: Option<String>,
    pub image_auth_token: Option<String>,
    pub image_disk: Option<String>,
    pub root_fs_id: Option<String>,
    pub root_fs_label: Option<String>,
    pub ipxe_script: Option<String>,
    pub user_data: Option<String>,
    pub is_cloud_init: Option<bool>,
    pub allow_override: Option<bool>,
    pub enable_block_storage: Option<bool>,
    pub phone_home_enabled: Option<bool>,
    pub is_active: Option<bool>,
    pub deactivation_note: Option<String>,
    pub status: Option<OperatingSystemStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearOperatingSystemRequest {
    pub description: bool,
    pub controller_operating_system_id: bool,
    pub version: bool,
    pub image_url: bool,
    pub image_sha: bool,
    pub image_auth_type: bool,
    pub image_auth_token: bool,
    pub image_disk: bool,
    pub root_fs_id: bool,
    pub root_fs_label: bool,
    pub ipxe_script: bool,
    pub user_data: bool,
    pub deactivation_note: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatingSystemFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub orgs: Option<Vec<String>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub os_types: Option<Vec<OperatingSystemType>>,
    pub statuses: Option<Vec<OperatingSystemStatus>>,
    pub is_active: Option<bool>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait OperatingSystemRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateOperatingSystemRequest,
    ) -> Result<OperatingSystem>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[OperatingSystemRelation],
    ) -> Result<OperatingSystem>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &OperatingSystemFilter,
        page: &PageInput,
        relations: &[OperatingSystemRelation],
    ) -> Result<(Vec<OperatingSystem>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateOperatingSystemRequest,
    ) -> Result<OperatingSystem>;
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearOperatingSystemRequest,
    ) -> Result<OperatingSystem>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxOperatingSystemRepository {
    pool: DbPool,
}

impl SqlxOperatingSystemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load operating systems by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, OperatingSystem>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, OperatingSystemRow>(
        "SELECT * FROM operating_system WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to load operating systems"))?;

    rows.into_iter().map(|row| OperatingSystem::try_from(row).map(|os| (os.id, os))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    systems: &mut [OperatingSystem],
    relations: &[OperatingSystemRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            OperatingSystemRelation::InfrastructureProvider => {
                let ids =
                    distinct_ids(systems.iter().filter_map(|os| os.infrastructure_provider_id));
                let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
                for os in systems.iter_mut() {
                    os.infrastructure_provider =
                        os.infrastructure_provider_id.and_then(|id| providers.get(&id)).cloned();
                }
            }
            OperatingSystemRelation::Tenant => {
                let ids = distinct_ids(systems.iter().filter_map(|os| os.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for os in systems.iter_mut() {
                    os.tenant = os.tenant_id.and_then(|id| tenants.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[OperatingSystemRelation],
) -> Result<OperatingSystem> {
    let row = sqlx::query_as::<_, OperatingSystemRow>(
        "SELECT * FROM operating_system WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch operating system {}", id)))?
    .ok_or_else(|| ForgeError::not_found("OperatingSystem", id))?;

    let mut systems = [OperatingSystem::try_from(row)?];
    attach_relations(conn, &mut systems, relations).await?;
    let [os] = systems;
    Ok(os)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &OperatingSystemFilter) {
    push_opt_uuids(qb, "os.id", &filter.ids);
    push_opt_strings(qb, "os.name", &filter.names);
    push_opt_strings(qb, "os.org", &filter.orgs);
    push_opt_uuids(qb, "os.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_uuids(qb, "os.tenant_id", &filter.tenant_ids);
    push_opt_strings(qb, "os.type", &filter.os_types.as_deref().map(status_strings));
    push_opt_strings(qb, "os.status", &filter.statuses.as_deref().map(status_strings));
    if let Some(is_active) = filter.is_active {
        push_eq(qb, "os.is_active", is_active);
    }
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["os.name", "os.description", "os.version", "os.status"],
        &["os.name", "os.description", "os.version"],
    );
}

#[async_trait]
impl OperatingSystemRepository for SqlxOperatingSystemRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, org = %request.org), name = "db_create_operating_system")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateOperatingSystemRequest,
    ) -> Result<OperatingSystem> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, OperatingSystemRow>(
            "INSERT INTO operating_system (id, name, description, org, infrastructure_provider_id, \
             tenant_id, controller_operating_system_id, version, type, image_url, image_sha, \
             image_auth_type, image_auth_token, image_disk, root_fs_id, root_fs_label, \
             ipxe_script, user_data, is_cloud_init, allow_override, enable_block_storage, \
             phone_home_enabled, is_active, status, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20, $21, $22, TRUE, $23, $24, $25, $25) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.org)
        .bind(request.infrastructure_provider_id)
        .bind(request.tenant_id)
        .bind(request.controller_operating_system_id)
        .bind(&request.version)
        .bind(request.os_type.as_str())
        .bind(&request.image_url)
        .bind(&request.image_sha)
        .bind(&request.image_auth_type)
        .bind(&request.image_auth_token)
        .bind(&request.image_disk)
        .bind(&request.root_fs_id)
        .bind(&request.root_fs_label)
        .bind(&request.ipxe_script)
        .bind(&request.user_data)
        .bind(request.is_cloud_init)
        .bind(request.allow_override)
        .bind(request.enable_block_storage)
        .bind(request.phone_home_enabled)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create operating system"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_operating_system_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[OperatingSystemRelation],
    ) -> Result<OperatingSystem> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_operating_systems")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &OperatingSystemFilter,
        page: &PageInput,
        relations: &[OperatingSystemRelation],
    ) -> Result<(Vec<OperatingSystem>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            OPERATING_SYSTEM_ORDER_FIELDS,
            "os.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM operating_system os WHERE os.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count operating systems"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT os.* FROM operating_system os WHERE os.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<OperatingSystemRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list operating systems"))?;

        let mut systems =
            rows.into_iter().map(OperatingSystem::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut systems, relations).await?;
        Ok((systems, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_operating_system")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateOperatingSystemRequest,
    ) -> Result<OperatingSystem> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE operating_system SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;

        let text_columns = [
            ("name", request.name),
            ("description", request.description),
            ("org", request.org),
            ("version", request.version),
            ("type", request.os_type.map(|t| t.as_str().to_string())),
            ("image_url", request.image_url),
            ("image_sha", request.image_sha),
            ("image_auth_type", request.image_auth_type),
            ("image_auth_token", request.image_auth_token),
            ("image_disk", request.image_disk),
            ("root_fs_id", request.root_fs_id),
            ("root_fs_label", request.root_fs_label),
            ("ipxe_script", request.ipxe_script),
            ("user_data", request.user_data),
            ("deactivation_note", request.deactivation_note),
            ("status", request.status.map(|s| s.as_str().to_string())),
        ];
        for (column, value) in text_columns {
            if let Some(v) = value {
                set.push(column).push_unseparated(" = ").push_bind_unseparated(v);
                changed = true;
            }
        }

        let flag_columns = [
            ("is_cloud_init", request.is_cloud_init),
            ("allow_override", request.allow_override),
            ("enable_block_storage", request.enable_block_storage),
            ("phone_home_enabled", request.phone_home_enabled),
            ("is_active", request.is_active),
        ];
        for (column, value) in flag_columns {
            if let Some(v) = value {
                set.push(column).push_unseparated(" = ").push_bind_unseparated(v);
                changed = true;
            }
        }

        if let Some(v) = request.controller_operating_system_id {
            set.push("controller_operating_system_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update operating system {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("OperatingSystem", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_clear_operating_system")]
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearOperatingSystemRequest,
    ) -> Result<OperatingSystem> {
        let mut conn = acquire(&self.pool, tx).await?;

        let columns = [
            (request.description, "description"),
            (request.controller_operating_system_id, "controller_operating_system_id"),
            (request.version, "version"),
            (request.image_url, "image_url"),
            (request.image_sha, "image_sha"),
            (request.image_auth_type, "image_auth_type"),
            (request.image_auth_token, "image_auth_token"),
            (request.image_disk, "image_disk"),
            (request.root_fs_id, "root_fs_id"),
            (request.root_fs_label, "root_fs_label"),
            (request.ipxe_script, "ipxe_script"),
            (request.user_data, "user_data"),
            (request.deactivation_note, "deactivation_note"),
        ];

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE operating_system SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        for (clear, column) in columns {
            if clear {
                set.push(column).push_unseparated(" = NULL");
                changed = true;
            }
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to clear operating system {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("OperatingSystem", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_operating_system")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE operating_system SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete operating system {}", id)))?;

        Ok(())
    }
}
