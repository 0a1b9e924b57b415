//! Machine interface repository
//!
//! Network interfaces reported by a site controller for a machine. Rows are owned
//! by the controller sync, so there is no `created_by`.

use super::distinct_ids;
use super::machine::{self, Machine};
use super::subnet::{self, Subnet};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_eq, push_opt_strings, push_opt_uuids};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const MACHINE_INTERFACE_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("hostname", "mi.hostname"),
    OrderField::new("created", "mi.created"),
    OrderField::new("updated", "mi.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineInterfaceRelation {
    Machine,
    Subnet,
}

/// Database row structure for machine interfaces
#[derive(Debug, Clone, FromRow)]
struct MachineInterfaceRow {
    id: Uuid,
    machine_id: String,
    controller_interface_id: Option<Uuid>,
    controller_segment_id: Option<Uuid>,
    attached_dpu_machine_id: Option<String>,
    subnet_id: Option<Uuid>,
    hostname: Option<String>,
    is_primary: bool,
    mac_address: Option<String>,
    ip_addresses: Vec<String>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInterface {
    pub id: Uuid,
    pub machine_id: String,
    pub machine: Option<Machine>,
    pub controller_interface_id: Option<Uuid>,
    pub controller_segment_id: Option<Uuid>,
    pub attached_dpu_machine_id: Option<String>,
    pub subnet_id: Option<Uuid>,
    pub subnet: Option<Subnet>,
    pub hostname: Option<String>,
    pub is_primary: bool,
    pub mac_address: Option<String>,
    pub ip_addresses: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl From<MachineInterfaceRow> for MachineInterface {
    fn from(row: MachineInterfaceRow) -> Self {
        Self {
            id: row.id,
            machine_id: row.machine_id,
            machine: None,
            controller_interface_id: row.controller_interface_id,
            controller_segment_id: row.controller_segment_id,
            attached_dpu_machine_id: row.attached_dpu_machine_id,
            subnet_id: row.subnet_id,
            subnet: None,
            hostname: row.hostname,
            is_primary: row.is_primary,
            mac_address: row.mac_address,
            ip_addresses: row.ip_addresses,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMachineInterfaceRequest {
    pub machine_id: String,
    pub controller_interface_id: Option<Uuid>,
    pub controller_segment_id: Option<Uuid>,
    pub attached_dpu_machine_id: Option<String>,
    pub subnet_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub is_primary: bool,
    pub mac_address: Option<String>,
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMachineInterfaceRequest {
    pub controller_interface_id: Option<Uuid>,
    pub controller_segment_id: Option<Uuid>,
    pub attached_dpu_machine_id: Option<String>,
    pub subnet_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub is_primary: Option<bool>,
    pub mac_address: Option<String>,
    pub ip_addresses: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearMachineInterfaceRequest {
    pub controller_interface_id: bool,
    pub controller_segment_id: bool,
    pub attached_dpu_machine_id: bool,
    pub subnet_id: bool,
    pub hostname: bool,
    pub mac_address: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineInterfaceFilter {
    pub machine_ids: Option<Vec<String>>,
    pub controller_interface_ids: Option<Vec<Uuid>>,
    pub controller_segment_ids: Option<Vec<Uuid>>,
    pub attached_dpu_machine_ids: Option<Vec<String>>,
    pub subnet_ids: Option<Vec<Uuid>>,
    pub hostnames: Option<Vec<String>>,
    pub is_primary: Option<bool>,
}

#[async_trait]
pub trait MachineInterfaceRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateMachineInterfaceRequest,
    ) -> Result<MachineInterface>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[MachineInterfaceRelation],
    ) -> Result<MachineInterface>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &MachineInterfaceFilter,
        page: &PageInput,
        relations: &[MachineInterfaceRelation],
    ) -> Result<(Vec<MachineInterface>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateMachineInterfaceRequest,
    ) -> Result<MachineInterface>;
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearMachineInterfaceRequest,
    ) -> Result<MachineInterface>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxMachineInterfaceRepository {
    pool: DbPool,
}

impl SqlxMachineInterfaceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, MachineInterface>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, MachineInterfaceRow>(
        "SELECT * FROM machine_interface WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to load machine interfaces"))?;

    Ok(rows.into_iter().map(|row| (row.id, MachineInterface::from(row))).collect())
}

async fn attach_relations(
    conn: &mut PgConnection,
    interfaces: &mut [MachineInterface],
    relations: &[MachineInterfaceRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            MachineInterfaceRelation::Machine => {
                let ids = distinct_ids(interfaces.iter().map(|i| i.machine_id.clone()));
                let machines = machine::load_by_ids(conn, &ids).await?;
                for interface in interfaces.iter_mut() {
                    interface.machine = machines.get(&interface.machine_id).cloned();
                }
            }
            MachineInterfaceRelation::Subnet => {
                let ids = distinct_ids(interfaces.iter().filter_map(|i| i.subnet_id));
                let subnets = subnet::load_by_ids(conn, &ids).await?;
                for interface in interfaces.iter_mut() {
                    interface.subnet = interface.subnet_id.and_then(|id| subnets.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[MachineInterfaceRelation],
) -> Result<MachineInterface> {
    let row = sqlx::query_as::<_, MachineInterfaceRow>(
        "SELECT * FROM machine_interface WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch machine interface {}", id)))?
    .ok_or_else(|| ForgeError::not_found("MachineInterface", id))?;

    let mut interfaces = [MachineInterface::from(row)];
    attach_relations(conn, &mut interfaces, relations).await?;
    let [interface] = interfaces;
    Ok(interface)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &MachineInterfaceFilter) {
    push_opt_strings(qb, "mi.machine_id", &filter.machine_ids);
    push_opt_uuids(qb, "mi.controller_interface_id", &filter.controller_interface_ids);
    push_opt_uuids(qb, "mi.controller_segment_id", &filter.controller_segment_ids);
    push_opt_strings(qb, "mi.attached_dpu_machine_id", &filter.attached_dpu_machine_ids);
    push_opt_uuids(qb, "mi.subnet_id", &filter.subnet_ids);
    push_opt_strings(qb, "mi.hostname", &filter.hostnames);
    if let Some(is_primary) = filter.is_primary {
        push_eq(qb, "mi.is_primary", is_primary);
    }
}

#[async_trait]
impl MachineInterfaceRepository for SqlxMachineInterfaceRepository {
    #[instrument(skip(self, tx, request), fields(machine_id = %request.machine_id), name = "db_create_machine_interface")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateMachineInterfaceRequest,
    ) -> Result<MachineInterface> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, MachineInterfaceRow>(
            "INSERT INTO machine_interface (id, machine_id, controller_interface_id, \
             controller_segment_id, attached_dpu_machine_id, subnet_id, hostname, is_primary, \
             mac_address, ip_addresses, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.machine_id)
        .bind(request.controller_interface_id)
        .bind(request.controller_segment_id)
        .bind(&request.attached_dpu_machine_id)
        .bind(request.subnet_id)
        .bind(&request.hostname)
        .bind(request.is_primary)
        .bind(&request.mac_address)
        .bind(&request.ip_addresses)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create machine interface"))?;

        Ok(row.into())
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_machine_interface_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[MachineInterfaceRelation],
    ) -> Result<MachineInterface> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_machine_interfaces")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &MachineInterfaceFilter,
        page: &PageInput,
        relations: &[MachineInterfaceRelation],
    ) -> Result<(Vec<MachineInterface>, i64)> {
        let paginator = Paginator::new(
            page,
            OrderBy::default_for("created"),
            MACHINE_INTERFACE_ORDER_FIELDS,
            "mi.id",
        )?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM machine_interface mi WHERE mi.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count machine interfaces"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT mi.* FROM machine_interface mi WHERE mi.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<MachineInterfaceRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list machine interfaces"))?;

        let mut interfaces: Vec<MachineInterface> = rows.into_iter().map(Into::into).collect();
        attach_relations(&mut conn, &mut interfaces, relations).await?;
        Ok((interfaces, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_machine_interface")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateMachineInterfaceRequest,
    ) -> Result<MachineInterface> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE machine_interface SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        for (column, value) in [
            ("controller_interface_id", request.controller_interface_id),
            ("controller_segment_id", request.controller_segment_id),
            ("subnet_id", request.subnet_id),
        ] {
            if let Some(v) = value {
                set.push(column).push_unseparated(" = ").push_bind_unseparated(v);
                changed = true;
            }
        }
        for (column, value) in [
            ("attached_dpu_machine_id", request.attached_dpu_machine_id),
            ("hostname", request.hostname),
            ("mac_address", request.mac_address),
        ] {
            if let Some(v) = value {
                set.push(column).push_unseparated(" = ").push_bind_unseparated(v);
                changed = true;
            }
        }
        if let Some(v) = request.is_primary {
            set.push("is_primary = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ip_addresses {
            set.push("ip_addresses = ").push_bind_unseparated(v);
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to update machine interface {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("MachineInterface", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_clear_machine_interface")]
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearMachineInterfaceRequest,
    ) -> Result<MachineInterface> {
        let mut conn = acquire(&self.pool, tx).await?;

        let columns = [
            (request.controller_interface_id, "controller_interface_id = NULL"),
            (request.controller_segment_id, "controller_segment_id = NULL"),
            (request.attached_dpu_machine_id, "attached_dpu_machine_id = NULL"),
            (request.subnet_id, "subnet_id = NULL"),
            (request.hostname, "hostname = NULL"),
            (request.mac_address, "mac_address = NULL"),
        ];

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE machine_interface SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        for (clear, assignment) in columns {
            if clear {
                set.push(assignment);
                changed = true;
            }
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            ForgeError::database(e, format!("Failed to clear machine interface {}", id))
        })?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("MachineInterface", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_machine_interface")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE machine_interface SET deleted = $2, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete machine interface {}", id)))?;

        Ok(())
    }
}
