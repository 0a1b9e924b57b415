//! Machine repository
//!
//! Machines are bare metal hosts discovered by a site controller. Their ids are the
//! controller's text machine ids rather than uuids. A machine may be bound to an
//! instance type, and `is_assigned` marks machines currently backing an instance.

use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use super::instance_type::{self, InstanceType};
use super::site::{self, Site};
use crate::domain::{parse_status, status_strings, MachineStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_eq, push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use tracing::instrument;
use uuid::Uuid;

pub const MACHINE_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("id", "m.id"),
    OrderField::new("hostname", "m.hostname"),
    OrderField::new("status", "m.status"),
    OrderField::new("created", "m.created"),
    OrderField::new("updated", "m.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineRelation {
    InfrastructureProvider,
    Site,
    InstanceType,
}

/// Database row structure for machines; labels are jsonb
#[derive(Debug, Clone, FromRow)]
struct MachineRow {
    id: String,
    infrastructure_provider_id: Uuid,
    site_id: Uuid,
    instance_type_id: Option<Uuid>,
    controller_machine_id: String,
    controller_machine_type: Option<String>,
    vendor: Option<String>,
    product_name: Option<String>,
    serial_number: Option<String>,
    hostname: Option<String>,
    default_mac_address: Option<String>,
    is_in_maintenance: bool,
    maintenance_message: Option<String>,
    is_network_degraded: bool,
    network_health_message: Option<String>,
    labels: Json<BTreeMap<String, String>>,
    is_assigned: bool,
    is_missing_on_site: bool,
    status: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub infrastructure_provider_id: Uuid,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub instance_type_id: Option<Uuid>,
    pub instance_type: Option<InstanceType>,
    pub controller_machine_id: String,
    pub controller_machine_type: Option<String>,
    pub vendor: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub hostname: Option<String>,
    pub default_mac_address: Option<String>,
    pub is_in_maintenance: bool,
    pub maintenance_message: Option<String>,
    pub is_network_degraded: bool,
    pub network_health_message: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub is_assigned: bool,
    pub is_missing_on_site: bool,
    pub status: MachineStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<MachineRow> for Machine {
    type Error = ForgeError;

    fn try_from(row: MachineRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            site_id: row.site_id,
            site: None,
            instance_type_id: row.instance_type_id,
            instance_type: None,
            controller_machine_id: row.controller_machine_id,
            controller_machine_type: row.controller_machine_type,
            vendor: row.vendor,
            product_name: row.product_name,
            serial_number: row.serial_number,
            hostname: row.hostname,
            default_mac_address: row.default_mac_address,
            is_in_maintenance: row.is_in_maintenance,
            maintenance_message: row.maintenance_message,
            is_network_degraded: row.is_network_degraded,
            network_health_message: row.network_health_message,
            labels: row.labels.0,
            is_assigned: row.is_assigned,
            is_missing_on_site: row.is_missing_on_site,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMachineRequest {
    pub id: String,
    pub infrastructure_provider_id: Uuid,
    pub site_id: Uuid,
    pub instance_type_id: Option<Uuid>,
    pub controller_machine_id: String,
    pub controller_machine_type: Option<String>,
    pub vendor: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub hostname: Option<String>,
    pub default_mac_address: Option<String>,
    pub is_in_maintenance: bool,
    pub maintenance_message: Option<String>,
    pub is_network_degraded: bool,
    pub network_health_message: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub status: MachineStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMachineRequest {
    pub instance_type_id: Option<Uuid>,
    pub controller_machine_type: Option<String>,
    pub vendor: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub hostname: Option<String>,
    pub default_mac_address: Option<String>,
    pub is_in_maintenance: Option<bool>,
    pub maintenance_message: Option<String>,
    pub is_network_degraded: Option<bool>,
    pub network_health_message: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
    pub is_assigned: Option<bool>,
    pub is_missing_on_site: Option<bool>,
    pub status: Option<MachineStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearMachineRequest {
    pub instance_type_id: bool,
    pub maintenance_message: bool,
    pub network_health_message: bool,
    pub labels: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineFilter {
    pub ids: Option<Vec<String>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub instance_type_ids: Option<Vec<Uuid>>,
    /// `Some(false)` selects machines with no instance type
    pub has_instance_type: Option<bool>,
    pub is_assigned: Option<bool>,
    pub hostnames: Option<Vec<String>>,
    pub statuses: Option<Vec<MachineStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait MachineRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateMachineRequest) -> Result<Machine>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        relations: &[MachineRelation],
    ) -> Result<Machine>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &MachineFilter,
        page: &PageInput,
        relations: &[MachineRelation],
    ) -> Result<(Vec<Machine>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        request: UpdateMachineRequest,
    ) -> Result<Machine>;
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        request: ClearMachineRequest,
    ) -> Result<Machine>;
    async fn delete(&self, tx: Option<&mut Tx>, id: &str) -> Result<()>;
}

pub struct SqlxMachineRepository {
    pool: DbPool,
}

impl SqlxMachineRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load machines by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[String],
) -> Result<HashMap<String, Machine>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, MachineRow>("SELECT * FROM machine WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load machines"))?;

    rows.into_iter().map(|row| Machine::try_from(row).map(|m| (m.id.clone(), m))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    machines: &mut [Machine],
    relations: &[MachineRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            MachineRelation::InfrastructureProvider => {
                let ids = distinct_ids(machines.iter().map(|m| m.infrastructure_provider_id));
                let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
                for machine in machines.iter_mut() {
                    machine.infrastructure_provider =
                        providers.get(&machine.infrastructure_provider_id).cloned();
                }
            }
            MachineRelation::Site => {
                let ids = distinct_ids(machines.iter().map(|m| m.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for machine in machines.iter_mut() {
                    machine.site = sites.get(&machine.site_id).cloned();
                }
            }
            MachineRelation::InstanceType => {
                let ids = distinct_ids(machines.iter().filter_map(|m| m.instance_type_id));
                let types = instance_type::load_by_ids(conn, &ids).await?;
                for machine in machines.iter_mut() {
                    machine.instance_type =
                        machine.instance_type_id.and_then(|id| types.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: &str,
    relations: &[MachineRelation],
) -> Result<Machine> {
    let row = sqlx::query_as::<_, MachineRow>(
        "SELECT * FROM machine WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch machine {}", id)))?
    .ok_or_else(|| ForgeError::not_found("Machine", id))?;

    let mut machines = [Machine::try_from(row)?];
    attach_relations(conn, &mut machines, relations).await?;
    let [machine] = machines;
    Ok(machine)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &MachineFilter) {
    push_opt_strings(qb, "m.id", &filter.ids);
    push_opt_uuids(qb, "m.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_uuids(qb, "m.site_id", &filter.site_ids);
    push_opt_uuids(qb, "m.instance_type_id", &filter.instance_type_ids);
    match filter.has_instance_type {
        Some(true) => {
            qb.push(" AND m.instance_type_id IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND m.instance_type_id IS NULL");
        }
        None => {}
    }
    if let Some(is_assigned) = filter.is_assigned {
        push_eq(qb, "m.is_assigned", is_assigned);
    }
    push_opt_strings(qb, "m.hostname", &filter.hostnames);
    push_opt_strings(qb, "m.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["m.id", "m.hostname", "m.vendor", "m.product_name", "m.status"],
        &["m.id", "m.hostname", "m.serial_number", "m.default_mac_address"],
    );
}

#[async_trait]
impl MachineRepository for SqlxMachineRepository {
    #[instrument(skip(self, tx, request), fields(id = %request.id, site_id = %request.site_id), name = "db_create_machine")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateMachineRequest) -> Result<Machine> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, MachineRow>(
            "INSERT INTO machine (id, infrastructure_provider_id, site_id, instance_type_id, \
             controller_machine_id, controller_machine_type, vendor, product_name, serial_number, \
             hostname, default_mac_address, is_in_maintenance, maintenance_message, \
             is_network_degraded, network_health_message, labels, status, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $18) \
             RETURNING *",
        )
        .bind(&request.id)
        .bind(request.infrastructure_provider_id)
        .bind(request.site_id)
        .bind(request.instance_type_id)
        .bind(&request.controller_machine_id)
        .bind(&request.controller_machine_type)
        .bind(&request.vendor)
        .bind(&request.product_name)
        .bind(&request.serial_number)
        .bind(&request.hostname)
        .bind(&request.default_mac_address)
        .bind(request.is_in_maintenance)
        .bind(&request.maintenance_message)
        .bind(request.is_network_degraded)
        .bind(&request.network_health_message)
        .bind(Json(&request.labels))
        .bind(request.status.as_str())
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create machine"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_machine_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        relations: &[MachineRelation],
    ) -> Result<Machine> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_machines")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &MachineFilter,
        page: &PageInput,
        relations: &[MachineRelation],
    ) -> Result<(Vec<Machine>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), MACHINE_ORDER_FIELDS, "m.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM machine m WHERE m.deleted IS NULL");
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count machines"))?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT m.* FROM machine m WHERE m.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<MachineRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list machines"))?;

        let mut machines = rows.into_iter().map(Machine::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut machines, relations).await?;
        Ok((machines, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_machine")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        request: UpdateMachineRequest,
    ) -> Result<Machine> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE machine SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;

        let text_columns = [
            ("controller_machine_type", request.controller_machine_type),
            ("vendor", request.vendor),
            ("product_name", request.product_name),
            ("serial_number", request.serial_number),
            ("hostname", request.hostname),
            ("default_mac_address", request.default_mac_address),
            ("maintenance_message", request.maintenance_message),
            ("network_health_message", request.network_health_message),
            ("status", request.status.map(|s| s.as_str().to_string())),
        ];
        for (column, value) in text_columns {
            if let Some(v) = value {
                set.push(column).push_unseparated(" = ").push_bind_unseparated(v);
                changed = true;
            }
        }

        let flag_columns = [
            ("is_in_maintenance", request.is_in_maintenance),
            ("is_network_degraded", request.is_network_degraded),
            ("is_assigned", request.is_assigned),
            ("is_missing_on_site", request.is_missing_on_site),
        ];
        for (column, value) in flag_columns {
            if let Some(v) = value {
                set.push(column).push_unseparated(" = ").push_bind_unseparated(v);
                changed = true;
            }
        }

        if let Some(v) = request.instance_type_id {
            set.push("instance_type_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.labels {
            set.push("labels = ").push_bind_unseparated(Json(v));
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id.to_string()).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to update machine {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Machine", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_clear_machine")]
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: &str,
        request: ClearMachineRequest,
    ) -> Result<Machine> {
        let mut conn = acquire(&self.pool, tx).await?;

        let columns = [
            (request.instance_type_id, "instance_type_id = NULL"),
            (request.maintenance_message, "maintenance_message = NULL"),
            (request.network_health_message, "network_health_message = NULL"),
            (request.labels, "labels = '{}'::jsonb"),
        ];

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE machine SET ");
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
        qb.push(" WHERE id = ").push_bind(id.to_string()).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to clear machine {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Machine", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_machine")]
    async fn delete(&self, tx: Option<&mut Tx>, id: &str) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query("UPDATE machine SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to delete machine {}", id)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_instance_type_filter() {
        let unbound = MachineFilter { has_instance_type: Some(false), ..Default::default() };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT m.* FROM machine m WHERE TRUE");
        push_filter(&mut qb, &unbound);
        assert!(qb.sql().ends_with(" AND m.instance_type_id IS NULL"));

        let mut qb = QueryBuilder::<Postgres>::new("SELECT m.* FROM machine m WHERE TRUE");
        push_filter(&mut qb, &MachineFilter::default());
        assert!(!qb.sql().contains("instance_type_id"));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres {
        use super::*;
        use crate::storage::test_helpers::{TestDatabase, TEST_PROVIDER_ID, TEST_SITE_ID};

        fn request(id: &str, instance_type_id: Option<Uuid>) -> CreateMachineRequest {
            CreateMachineRequest {
                id: id.to_string(),
                infrastructure_provider_id: TEST_PROVIDER_ID,
                site_id: TEST_SITE_ID,
                instance_type_id,
                controller_machine_id: id.to_string(),
                controller_machine_type: Some("x86_64".to_string()),
                vendor: Some("testvendor".to_string()),
                product_name: Some("testproduct".to_string()),
                serial_number: Some(Uuid::new_v4().to_string()),
                hostname: Some(format!("{}.example.com", id)),
                default_mac_address: Some("00:1B:44:11:3A:B7".to_string()),
                is_in_maintenance: false,
                maintenance_message: None,
                is_network_degraded: false,
                network_health_message: None,
                labels: BTreeMap::from([("rack".to_string(), "r12".to_string())]),
                status: MachineStatus::Initializing,
            }
        }

        #[tokio::test]
        async fn test_machine_lifecycle() {
            let db = TestDatabase::new("machine_crud").await;
            let repo = SqlxMachineRepository::new(db.pool.clone());
            let instance_type_id = db.seed_instance_type("sm.x86").await;

            let bound = repo.create(None, request("fm100a", Some(instance_type_id))).await.unwrap();
            let spare = repo.create(None, request("fm100b", None)).await.unwrap();
            assert_eq!(bound.labels.get("rack").map(String::as_str), Some("r12"));

            let loaded = repo
                .get_by_id(None, "fm100a", &[MachineRelation::InstanceType, MachineRelation::Site])
                .await
                .unwrap();
            assert_eq!(loaded.instance_type.as_ref().map(|t| t.id), Some(instance_type_id));
            assert_eq!(loaded.site.as_ref().map(|s| s.id), Some(TEST_SITE_ID));

            let unbound = MachineFilter { has_instance_type: Some(false), ..Default::default() };
            let (found, total) =
                repo.get_all(None, &unbound, &PageInput::default(), &[]).await.unwrap();
            assert_eq!(total, 1);
            assert_eq!(found[0].id, spare.id);

            let assigned = repo
                .update(
                    None,
                    &bound.id,
                    UpdateMachineRequest {
                        is_assigned: Some(true),
                        status: Some(MachineStatus::InUse),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(assigned.is_assigned);
            assert_eq!(assigned.status, MachineStatus::InUse);

            let cleared = repo
                .clear(
                    None,
                    &bound.id,
                    ClearMachineRequest { instance_type_id: true, labels: true, ..Default::default() },
                )
                .await
                .unwrap();
            assert!(cleared.instance_type_id.is_none());
            assert!(cleared.labels.is_empty());

            let search = MachineFilter {
                search_query: Some("fm100b.example".to_string()),
                ..Default::default()
            };
            let (found, _) = repo.get_all(None, &search, &PageInput::default(), &[]).await.unwrap();
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].id, "fm100b");

            repo.delete(None, "fm100b").await.unwrap();
            assert!(repo.get_by_id(None, "fm100b", &[]).await.unwrap_err().is_not_found());
        }

        #[tokio::test]
        async fn test_duplicate_id_is_unique_violation() {
            let db = TestDatabase::new("machine_unique").await;
            let repo = SqlxMachineRepository::new(db.pool.clone());

            repo.create(None, request("fm200", None)).await.unwrap();
            let err = repo.create(None, request("fm200", None)).await.unwrap_err();
            assert!(err.is_unique_violation());
        }
    }
}
