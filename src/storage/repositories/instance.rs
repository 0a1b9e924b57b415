//! Instance repository
//!
//! Instances are tenant workloads placed on a machine within a site and VPC. Besides
//! the usual CRUD surface this repository supports batched creates and updates, capped
//! at [`MAX_BATCH_ITEMS`](crate::storage::MAX_BATCH_ITEMS) rows per call. A batch
//! either applies in full or not at all: without a caller transaction the repository
//! opens its own.

use super::allocation::{self, Allocation};
use super::allocation_constraint::{self, AllocationConstraint};
use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use super::instance_type::{self, InstanceType};
use super::machine::{self, Machine};
use super::network_security_group::{
    self, NetworkSecurityGroup, NetworkSecurityGroupPropagationDetails,
};
use super::operating_system::{self, OperatingSystem};
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use super::vpc::{self, Vpc};
use crate::domain::{parse_status, status_strings, InstanceStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{
    check_batch_size, check_unique_ids, ensure_live_row, order_by_input, push_eq,
    push_opt_strings, push_opt_uuids, push_search, record_batch_ids, status_counts,
};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use tracing::{field, instrument, Span};
use uuid::Uuid;

/// Orderable fields. The joined columns come from the `tn` and `nsg` joins in `get_all`.
pub const INSTANCE_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "i.name"),
    OrderField::new("status", "i.status"),
    OrderField::new("created", "i.created"),
    OrderField::new("updated", "i.updated"),
    OrderField::new("machine_id", "i.machine_id"),
    OrderField::new("tenant_org_display_name", "tn.org_display_name"),
    OrderField::new("network_security_group_name", "nsg.name"),
];

const INSERT_COLUMNS: &str = "INSERT INTO instance (id, name, description, allocation_id, \
    allocation_constraint_id, tenant_id, infrastructure_provider_id, site_id, instance_type_id, \
    network_security_group_id, network_security_group_propagation_details, vpc_id, machine_id, \
    controller_instance_id, hostname, operating_system_id, ipxe_script, \
    always_boot_with_custom_ipxe, phone_home_enabled, user_data, labels, is_update_pending, \
    infinity_rcr_status, tpm_ek_certificate, status, power_status, created_by, created, updated) ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRelation {
    Tenant,
    InfrastructureProvider,
    Site,
    Vpc,
    NetworkSecurityGroup,
    InstanceType,
    Allocation,
    AllocationConstraint,
    Machine,
    OperatingSystem,
}

/// Database row structure for instances; labels and propagation details are jsonb
#[derive(Debug, Clone, FromRow)]
struct InstanceRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    allocation_id: Option<Uuid>,
    allocation_constraint_id: Option<Uuid>,
    tenant_id: Uuid,
    infrastructure_provider_id: Uuid,
    site_id: Uuid,
    instance_type_id: Option<Uuid>,
    network_security_group_id: Option<String>,
    network_security_group_propagation_details: Option<Json<NetworkSecurityGroupPropagationDetails>>,
    vpc_id: Uuid,
    machine_id: Option<String>,
    controller_instance_id: Option<Uuid>,
    hostname: Option<String>,
    operating_system_id: Option<Uuid>,
    ipxe_script: Option<String>,
    always_boot_with_custom_ipxe: bool,
    phone_home_enabled: bool,
    user_data: Option<String>,
    labels: Json<BTreeMap<String, String>>,
    is_update_pending: bool,
    infinity_rcr_status: Option<String>,
    tpm_ek_certificate: Option<String>,
    status: String,
    power_status: Option<String>,
    is_missing_on_site: bool,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub allocation_id: Option<Uuid>,
    pub allocation: Option<Allocation>,
    pub allocation_constraint_id: Option<Uuid>,
    pub allocation_constraint: Option<AllocationConstraint>,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub infrastructure_provider_id: Uuid,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub instance_type_id: Option<Uuid>,
    pub instance_type: Option<InstanceType>,
    pub network_security_group_id: Option<String>,
    pub network_security_group: Option<NetworkSecurityGroup>,
    pub network_security_group_propagation_details: Option<NetworkSecurityGroupPropagationDetails>,
    pub vpc_id: Uuid,
    pub vpc: Option<Vpc>,
    pub machine_id: Option<String>,
    pub machine: Option<Machine>,
    pub controller_instance_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub operating_system_id: Option<Uuid>,
    pub operating_system: Option<OperatingSystem>,
    pub ipxe_script: Option<String>,
    pub always_boot_with_custom_ipxe: bool,
    pub phone_home_enabled: bool,
    pub user_data: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub is_update_pending: bool,
    pub infinity_rcr_status: Option<String>,
    pub tpm_ek_certificate: Option<String>,
    pub status: InstanceStatus,
    pub power_status: Option<String>,
    pub is_missing_on_site: bool,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = ForgeError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            allocation_id: row.allocation_id,
            allocation: None,
            allocation_constraint_id: row.allocation_constraint_id,
            allocation_constraint: None,
            tenant_id: row.tenant_id,
            tenant: None,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            site_id: row.site_id,
            site: None,
            instance_type_id: row.instance_type_id,
            instance_type: None,
            network_security_group_id: row.network_security_group_id,
            network_security_group: None,
            network_security_group_propagation_details: row
                .network_security_group_propagation_details
                .map(|d| d.0),
            vpc_id: row.vpc_id,
            vpc: None,
            machine_id: row.machine_id,
            machine: None,
            controller_instance_id: row.controller_instance_id,
            hostname: row.hostname,
            operating_system_id: row.operating_system_id,
            operating_system: None,
            ipxe_script: row.ipxe_script,
            always_boot_with_custom_ipxe: row.always_boot_with_custom_ipxe,
            phone_home_enabled: row.phone_home_enabled,
            user_data: row.user_data,
            labels: row.labels.0,
            is_update_pending: row.is_update_pending,
            infinity_rcr_status: row.infinity_rcr_status,
            tpm_ek_certificate: row.tpm_ek_certificate,
            power_status: row.power_status,
            is_missing_on_site: row.is_missing_on_site,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub description: Option<String>,
    pub allocation_id: Option<Uuid>,
    pub allocation_constraint_id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub infrastructure_provider_id: Uuid,
    pub site_id: Uuid,
    pub instance_type_id: Option<Uuid>,
    pub network_security_group_id: Option<String>,
    pub network_security_group_propagation_details: Option<NetworkSecurityGroupPropagationDetails>,
    pub vpc_id: Uuid,
    pub machine_id: Option<String>,
    pub controller_instance_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub operating_system_id: Option<Uuid>,
    pub ipxe_script: Option<String>,
    pub always_boot_with_custom_ipxe: bool,
    pub phone_home_enabled: bool,
    pub user_data: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub is_update_pending: bool,
    pub infinity_rcr_status: Option<String>,
    pub tpm_ek_certificate: Option<String>,
    pub status: InstanceStatus,
    pub power_status: Option<String>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInstanceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub allocation_id: Option<Uuid>,
    pub allocation_constraint_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub infrastructure_provider_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub instance_type_id: Option<Uuid>,
    pub network_security_group_id: Option<String>,
    pub network_security_group_propagation_details: Option<NetworkSecurityGroupPropagationDetails>,
    pub vpc_id: Option<Uuid>,
    pub machine_id: Option<String>,
    pub controller_instance_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub operating_system_id: Option<Uuid>,
    pub ipxe_script: Option<String>,
    pub always_boot_with_custom_ipxe: Option<bool>,
    pub phone_home_enabled: Option<bool>,
    pub user_data: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
    pub is_update_pending: Option<bool>,
    pub infinity_rcr_status: Option<String>,
    pub tpm_ek_certificate: Option<String>,
    pub status: Option<InstanceStatus>,
    pub power_status: Option<String>,
    pub is_missing_on_site: Option<bool>,
}

/// Columns to reset. Labels reset to an empty map, the rest to NULL.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClearInstanceRequest {
    pub description: bool,
    pub machine_id: bool,
    pub controller_instance_id: bool,
    pub network_security_group_id: bool,
    pub network_security_group_propagation_details: bool,
    pub hostname: bool,
    pub operating_system_id: bool,
    pub ipxe_script: bool,
    pub user_data: bool,
    pub labels: bool,
    pub tpm_ek_certificate: bool,
}

impl ClearInstanceRequest {
    fn assignments(&self) -> Vec<&'static str> {
        [
            (self.description, "description = NULL"),
            (self.machine_id, "machine_id = NULL"),
            (self.controller_instance_id, "controller_instance_id = NULL"),
            (self.network_security_group_id, "network_security_group_id = NULL"),
            (
                self.network_security_group_propagation_details,
                "network_security_group_propagation_details = NULL",
            ),
            (self.hostname, "hostname = NULL"),
            (self.operating_system_id, "operating_system_id = NULL"),
            (self.ipxe_script, "ipxe_script = NULL"),
            (self.user_data, "user_data = NULL"),
            (self.labels, "labels = '{}'::jsonb"),
            (self.tpm_ek_certificate, "tpm_ek_certificate = NULL"),
        ]
        .into_iter()
        .filter_map(|(clear, assignment)| clear.then_some(assignment))
        .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub allocation_ids: Option<Vec<Uuid>>,
    pub allocation_constraint_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub instance_type_ids: Option<Vec<Uuid>>,
    pub network_security_group_ids: Option<Vec<String>>,
    pub vpc_ids: Option<Vec<Uuid>>,
    pub machine_ids: Option<Vec<String>>,
    pub controller_instance_ids: Option<Vec<Uuid>>,
    pub operating_system_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<InstanceStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateInstanceRequest)
        -> Result<Instance>;
    /// Insert several instances, returned in input order
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateInstanceRequest>,
    ) -> Result<Vec<Instance>>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[InstanceRelation],
    ) -> Result<Instance>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InstanceFilter,
        page: &PageInput,
        relations: &[InstanceRelation],
    ) -> Result<(Vec<Instance>, i64)>;
    async fn get_count(&self, tx: Option<&mut Tx>, filter: &InstanceFilter) -> Result<i64>;
    /// Count live instances per status. Every status is present, plus a `total` key.
    async fn get_count_by_status(
        &self,
        tx: Option<&mut Tx>,
        tenant_id: Option<Uuid>,
        site_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInstanceRequest,
    ) -> Result<Instance>;
    /// Apply several updates, returned in input order
    async fn update_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<(Uuid, UpdateInstanceRequest)>,
    ) -> Result<Vec<Instance>>;
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearInstanceRequest,
    ) -> Result<Instance>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxInstanceRepository {
    pool: DbPool,
}

impl SqlxInstanceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load instances by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Instance>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instance WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load instances"))?;

    rows.into_iter().map(|row| Instance::try_from(row).map(|i| (i.id, i))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    instances: &mut [Instance],
    relations: &[InstanceRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            InstanceRelation::Tenant => {
                let ids = distinct_ids(instances.iter().map(|i| i.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.tenant = tenants.get(&instance.tenant_id).cloned();
                }
            }
            InstanceRelation::InfrastructureProvider => {
                let ids = distinct_ids(instances.iter().map(|i| i.infrastructure_provider_id));
                let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.infrastructure_provider =
                        providers.get(&instance.infrastructure_provider_id).cloned();
                }
            }
            InstanceRelation::Site => {
                let ids = distinct_ids(instances.iter().map(|i| i.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.site = sites.get(&instance.site_id).cloned();
                }
            }
            InstanceRelation::Vpc => {
                let ids = distinct_ids(instances.iter().map(|i| i.vpc_id));
                let vpcs = vpc::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.vpc = vpcs.get(&instance.vpc_id).cloned();
                }
            }
            InstanceRelation::NetworkSecurityGroup => {
                let mut ids: Vec<String> = instances
                    .iter()
                    .filter_map(|i| i.network_security_group_id.clone())
                    .collect();
                ids.sort();
                ids.dedup();
                let groups = network_security_group::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.network_security_group = instance
                        .network_security_group_id
                        .as_ref()
                        .and_then(|id| groups.get(id))
                        .cloned();
                }
            }
            InstanceRelation::InstanceType => {
                let ids = distinct_ids(instances.iter().filter_map(|i| i.instance_type_id));
                let types = instance_type::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.instance_type =
                        instance.instance_type_id.and_then(|id| types.get(&id)).cloned();
                }
            }
            InstanceRelation::Allocation => {
                let ids = distinct_ids(instances.iter().filter_map(|i| i.allocation_id));
                let allocations = allocation::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.allocation =
                        instance.allocation_id.and_then(|id| allocations.get(&id)).cloned();
                }
            }
            InstanceRelation::AllocationConstraint => {
                let ids = distinct_ids(instances.iter().filter_map(|i| i.allocation_constraint_id));
                let constraints = allocation_constraint::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.allocation_constraint = instance
                        .allocation_constraint_id
                        .and_then(|id| constraints.get(&id))
                        .cloned();
                }
            }
            InstanceRelation::Machine => {
                let ids = distinct_ids(instances.iter().filter_map(|i| i.machine_id.clone()));
                let machines = machine::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.machine =
                        instance.machine_id.as_ref().and_then(|id| machines.get(id)).cloned();
                }
            }
            InstanceRelation::OperatingSystem => {
                let ids = distinct_ids(instances.iter().filter_map(|i| i.operating_system_id));
                let systems = operating_system::load_by_ids(conn, &ids).await?;
                for instance in instances.iter_mut() {
                    instance.operating_system =
                        instance.operating_system_id.and_then(|id| systems.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[InstanceRelation],
) -> Result<Instance> {
    let row = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM instance WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch instance {}", id)))?
    .ok_or_else(|| ForgeError::not_found("Instance", id))?;

    let mut instances = [Instance::try_from(row)?];
    attach_relations(conn, &mut instances, relations).await?;
    let [instance] = instances;
    Ok(instance)
}

/// Insert rows with pre-assigned ids and return them in input order
async fn insert_rows(
    conn: &mut PgConnection,
    rows: Vec<(Uuid, CreateInstanceRequest)>,
) -> Result<Vec<Instance>> {
    let ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
    let now = Utc::now();

    let mut qb = QueryBuilder::<Postgres>::new(INSERT_COLUMNS);
    qb.push_values(rows, |mut b, (id, r)| {
        b.push_bind(id)
            .push_bind(r.name)
            .push_bind(r.description)
            .push_bind(r.allocation_id)
            .push_bind(r.allocation_constraint_id)
            .push_bind(r.tenant_id)
            .push_bind(r.infrastructure_provider_id)
            .push_bind(r.site_id)
            .push_bind(r.instance_type_id)
            .push_bind(r.network_security_group_id)
            .push_bind(r.network_security_group_propagation_details.map(Json))
            .push_bind(r.vpc_id)
            .push_bind(r.machine_id)
            .push_bind(r.controller_instance_id)
            .push_bind(r.hostname)
            .push_bind(r.operating_system_id)
            .push_bind(r.ipxe_script)
            .push_bind(r.always_boot_with_custom_ipxe)
            .push_bind(r.phone_home_enabled)
            .push_bind(r.user_data)
            .push_bind(Json(r.labels))
            .push_bind(r.is_update_pending)
            .push_bind(r.infinity_rcr_status)
            .push_bind(r.tpm_ek_certificate)
            .push_bind(r.status.as_str())
            .push_bind(r.power_status)
            .push_bind(r.created_by)
            .push_bind(now)
            .push_bind(now);
    });
    qb.push(" RETURNING *");

    let inserted = qb
        .build_query_as::<InstanceRow>()
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create instances"))?;

    let instances = inserted.into_iter().map(Instance::try_from).collect::<Result<Vec<_>>>()?;
    order_by_input(&ids, instances, |i| &i.id)
}

/// Apply one update. Returns whether a statement ran.
async fn apply_update(
    conn: &mut PgConnection,
    id: Uuid,
    request: UpdateInstanceRequest,
) -> Result<bool> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE instance SET ");
    let mut set = qb.separated(", ");
    let mut changed = false;
    if let Some(v) = request.name {
        set.push("name = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.description {
        set.push("description = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.allocation_id {
        set.push("allocation_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.allocation_constraint_id {
        set.push("allocation_constraint_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.tenant_id {
        set.push("tenant_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.infrastructure_provider_id {
        set.push("infrastructure_provider_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.site_id {
        set.push("site_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.instance_type_id {
        set.push("instance_type_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.network_security_group_id {
        set.push("network_security_group_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.network_security_group_propagation_details {
        set.push("network_security_group_propagation_details = ")
            .push_bind_unseparated(Json(v));
        changed = true;
    }
    if let Some(v) = request.vpc_id {
        set.push("vpc_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.machine_id {
        set.push("machine_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.controller_instance_id {
        set.push("controller_instance_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.hostname {
        set.push("hostname = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.operating_system_id {
        set.push("operating_system_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.ipxe_script {
        set.push("ipxe_script = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.always_boot_with_custom_ipxe {
        set.push("always_boot_with_custom_ipxe = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.phone_home_enabled {
        set.push("phone_home_enabled = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.user_data {
        set.push("user_data = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.labels {
        set.push("labels = ").push_bind_unseparated(Json(v));
        changed = true;
    }
    if let Some(v) = request.is_update_pending {
        set.push("is_update_pending = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.infinity_rcr_status {
        set.push("infinity_rcr_status = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.tpm_ek_certificate {
        set.push("tpm_ek_certificate = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.status {
        set.push("status = ").push_bind_unseparated(v.as_str());
        changed = true;
    }
    if let Some(v) = request.power_status {
        set.push("power_status = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.is_missing_on_site {
        set.push("is_missing_on_site = ").push_bind_unseparated(v);
        changed = true;
    }
    if !changed {
        ensure_live_row(conn, "instance", "Instance", id).await?;
        return Ok(false);
    }
    set.push("updated = ").push_bind_unseparated(Utc::now());
    qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

    let result = qb
        .build()
        .execute(conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to update instance {}", id)))?;
    if result.rows_affected() == 0 {
        return Err(ForgeError::not_found("Instance", id));
    }
    Ok(true)
}

/// Apply every update of a batch on one connection, then read the rows back in input order
async fn update_batch(
    conn: &mut PgConnection,
    requests: Vec<(Uuid, UpdateInstanceRequest)>,
    ids: &[Uuid],
) -> Result<Vec<Instance>> {
    for (id, request) in requests {
        apply_update(conn, id, request).await?;
    }

    let rows = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM instance WHERE id = ANY($1) AND deleted IS NULL",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to fetch updated instances"))?;

    let instances = rows.into_iter().map(Instance::try_from).collect::<Result<Vec<_>>>()?;
    order_by_input(ids, instances, |i| &i.id)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &InstanceFilter) {
    push_opt_uuids(qb, "i.id", &filter.ids);
    push_opt_strings(qb, "i.name", &filter.names);
    push_opt_uuids(qb, "i.allocation_id", &filter.allocation_ids);
    push_opt_uuids(qb, "i.allocation_constraint_id", &filter.allocation_constraint_ids);
    push_opt_uuids(qb, "i.tenant_id", &filter.tenant_ids);
    push_opt_uuids(qb, "i.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_uuids(qb, "i.site_id", &filter.site_ids);
    push_opt_uuids(qb, "i.instance_type_id", &filter.instance_type_ids);
    push_opt_strings(qb, "i.network_security_group_id", &filter.network_security_group_ids);
    push_opt_uuids(qb, "i.vpc_id", &filter.vpc_ids);
    push_opt_strings(qb, "i.machine_id", &filter.machine_ids);
    push_opt_uuids(qb, "i.controller_instance_id", &filter.controller_instance_ids);
    push_opt_uuids(qb, "i.operating_system_id", &filter.operating_system_ids);
    push_opt_strings(qb, "i.status", &filter.statuses.as_deref().map(status_strings));
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["i.name", "i.status", "i.labels::text"],
        &["i.name", "i.status", "i.description", "i.labels::text"],
    );
}

async fn count(conn: &mut PgConnection, filter: &InstanceFilter) -> Result<i64> {
    let mut qb =
        QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM instance i WHERE i.deleted IS NULL");
    push_filter(&mut qb, filter);
    qb.build_query_scalar::<i64>()
        .fetch_one(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to count instances"))
}

#[async_trait]
impl InstanceRepository for SqlxInstanceRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, site_id = %request.site_id), name = "db_create_instance")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateInstanceRequest,
    ) -> Result<Instance> {
        let mut conn = acquire(&self.pool, tx).await?;
        let [instance] = <[Instance; 1]>::try_from(
            insert_rows(&mut conn, vec![(Uuid::new_v4(), request)]).await?,
        )
        .map_err(|rows| ForgeError::internal(format!("expected 1 row, got {}", rows.len())))?;
        Ok(instance)
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_create_multiple_instances"
    )]
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateInstanceRequest>,
    ) -> Result<Vec<Instance>> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(Uuid, CreateInstanceRequest)> =
            requests.into_iter().map(|r| (Uuid::new_v4(), r)).collect();
        let ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        record_batch_ids(&Span::current(), &ids);

        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, rows).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_instance_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[InstanceRelation],
    ) -> Result<Instance> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_instances")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InstanceFilter,
        page: &PageInput,
        relations: &[InstanceRelation],
    ) -> Result<(Vec<Instance>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), INSTANCE_ORDER_FIELDS, "i.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let total = count(&mut conn, filter).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT i.* FROM instance i \
             LEFT JOIN tenant tn ON tn.id = i.tenant_id \
             LEFT JOIN network_security_group nsg ON nsg.id = i.network_security_group_id \
             WHERE i.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<InstanceRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list instances"))?;

        let mut instances = rows.into_iter().map(Instance::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut instances, relations).await?;
        Ok((instances, total))
    }

    #[instrument(skip(self, tx, filter), name = "db_get_instance_count")]
    async fn get_count(&self, tx: Option<&mut Tx>, filter: &InstanceFilter) -> Result<i64> {
        let mut conn = acquire(&self.pool, tx).await?;
        count(&mut conn, filter).await
    }

    #[instrument(skip(self, tx), name = "db_get_instance_count_by_status")]
    async fn get_count_by_status(
        &self,
        tx: Option<&mut Tx>,
        tenant_id: Option<Uuid>,
        site_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT i.status, COUNT(*) FROM instance i WHERE i.deleted IS NULL",
        );
        if let Some(id) = tenant_id {
            push_eq(&mut qb, "i.tenant_id", id);
        }
        if let Some(id) = site_id {
            push_eq(&mut qb, "i.site_id", id);
        }
        qb.push(" GROUP BY i.status");

        let rows = qb
            .build_query_as::<(String, i64)>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count instances by status"))?;

        Ok(status_counts(InstanceStatus::ALL, rows))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_instance")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInstanceRequest,
    ) -> Result<Instance> {
        let mut conn = acquire(&self.pool, tx).await?;
        apply_update(&mut conn, id, request).await?;
        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_update_multiple_instances"
    )]
    async fn update_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<(Uuid, UpdateInstanceRequest)>,
    ) -> Result<Vec<Instance>> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = requests.iter().map(|(id, _)| *id).collect();
        check_unique_ids(&ids)?;
        record_batch_ids(&Span::current(), &ids);

        match tx {
            Some(tx) => update_batch(tx.connection(), requests, &ids).await,
            None => {
                let mut tx = Tx::begin(&self.pool).await?;
                let instances = update_batch(tx.connection(), requests, &ids).await?;
                tx.commit().await?;
                Ok(instances)
            }
        }
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_clear_instance")]
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearInstanceRequest,
    ) -> Result<Instance> {
        let mut conn = acquire(&self.pool, tx).await?;

        let assignments = request.assignments();
        if assignments.is_empty() {
            return fetch_one(&mut conn, id, &[]).await;
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE instance SET ");
        let mut set = qb.separated(", ");
        for assignment in assignments {
            set.push(assignment);
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to clear instance {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Instance", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_instance")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE instance SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete instance {}", id)))?;

        Ok(())
    }
}
