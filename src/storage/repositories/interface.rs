//! Instance network interface repository

use super::distinct_ids;
use super::instance::{self, Instance};
use super::machine_interface::{self, MachineInterface};
use super::subnet::{self, Subnet};
use super::vpc_prefix::{self, VpcPrefix};
use crate::domain::{parse_status, status_strings, InterfaceStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{
    check_batch_size, check_unique_ids, ensure_live_row, order_by_input, push_eq,
    push_opt_strings, push_opt_uuids, record_batch_ids,
};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use tracing::{field, instrument, Span};
use uuid::Uuid;

pub const INTERFACE_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("status", "ifc.status"),
    OrderField::new("created", "ifc.created"),
    OrderField::new("updated", "ifc.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceRelation {
    Instance,
    Subnet,
    VpcPrefix,
    MachineInterface,
}

/// Database row structure for interfaces
#[derive(Debug, Clone, FromRow)]
struct InterfaceRow {
    id: Uuid,
    instance_id: Uuid,
    subnet_id: Option<Uuid>,
    vpc_prefix_id: Option<Uuid>,
    machine_interface_id: Option<Uuid>,
    device: Option<String>,
    device_instance: Option<i32>,
    is_physical: bool,
    virtual_function_id: Option<i32>,
    mac_address: Option<String>,
    ip_addresses: Vec<String>,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub instance: Option<Instance>,
    pub subnet_id: Option<Uuid>,
    pub subnet: Option<Subnet>,
    pub vpc_prefix_id: Option<Uuid>,
    pub vpc_prefix: Option<VpcPrefix>,
    pub machine_interface_id: Option<Uuid>,
    pub machine_interface: Option<MachineInterface>,
    pub device: Option<String>,
    pub device_instance: Option<i32>,
    pub is_physical: bool,
    pub virtual_function_id: Option<i32>,
    pub mac_address: Option<String>,
    pub ip_addresses: Vec<String>,
    pub status: InterfaceStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<InterfaceRow> for Interface {
    type Error = ForgeError;

    fn try_from(row: InterfaceRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            instance_id: row.instance_id,
            instance: None,
            subnet_id: row.subnet_id,
            subnet: None,
            vpc_prefix_id: row.vpc_prefix_id,
            vpc_prefix: None,
            machine_interface_id: row.machine_interface_id,
            machine_interface: None,
            device: row.device,
            device_instance: row.device_instance,
            is_physical: row.is_physical,
            virtual_function_id: row.virtual_function_id,
            mac_address: row.mac_address,
            ip_addresses: row.ip_addresses,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInterfaceRequest {
    pub instance_id: Uuid,
    pub subnet_id: Option<Uuid>,
    pub vpc_prefix_id: Option<Uuid>,
    pub machine_interface_id: Option<Uuid>,
    pub device: Option<String>,
    pub device_instance: Option<i32>,
    pub is_physical: bool,
    pub virtual_function_id: Option<i32>,
    pub mac_address: Option<String>,
    pub ip_addresses: Vec<String>,
    pub status: InterfaceStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInterfaceRequest {
    pub subnet_id: Option<Uuid>,
    pub vpc_prefix_id: Option<Uuid>,
    pub machine_interface_id: Option<Uuid>,
    pub device: Option<String>,
    pub device_instance: Option<i32>,
    pub is_physical: Option<bool>,
    pub virtual_function_id: Option<i32>,
    pub mac_address: Option<String>,
    pub ip_addresses: Option<Vec<String>>,
    pub status: Option<InterfaceStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceFilter {
    pub instance_ids: Option<Vec<Uuid>>,
    pub subnet_id: Option<Uuid>,
    pub vpc_prefix_id: Option<Uuid>,
    pub device: Option<String>,
    pub device_instance: Option<i32>,
    pub is_physical: Option<bool>,
    pub statuses: Option<Vec<InterfaceStatus>>,
    /// Matches interfaces holding any of these addresses
    pub ip_addresses: Option<Vec<String>>,
}

#[async_trait]
pub trait InterfaceRepository: Send + Sync {
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateInterfaceRequest,
    ) -> Result<Interface>;
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateInterfaceRequest>,
    ) -> Result<Vec<Interface>>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[InterfaceRelation],
    ) -> Result<Interface>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InterfaceFilter,
        page: &PageInput,
        relations: &[InterfaceRelation],
    ) -> Result<(Vec<Interface>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInterfaceRequest,
    ) -> Result<Interface>;
    async fn update_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<(Uuid, UpdateInterfaceRequest)>,
    ) -> Result<Vec<Interface>>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxInterfaceRepository {
    pool: DbPool,
}

impl SqlxInterfaceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn attach_relations(
    conn: &mut PgConnection,
    interfaces: &mut [Interface],
    relations: &[InterfaceRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            InterfaceRelation::Instance => {
                let ids = distinct_ids(interfaces.iter().map(|i| i.instance_id));
                let instances = instance::load_by_ids(conn, &ids).await?;
                for interface in interfaces.iter_mut() {
                    interface.instance = instances.get(&interface.instance_id).cloned();
                }
            }
            InterfaceRelation::Subnet => {
                let ids = distinct_ids(interfaces.iter().filter_map(|i| i.subnet_id));
                let subnets = subnet::load_by_ids(conn, &ids).await?;
                for interface in interfaces.iter_mut() {
                    interface.subnet = interface.subnet_id.and_then(|id| subnets.get(&id)).cloned();
                }
            }
            InterfaceRelation::VpcPrefix => {
                let ids = distinct_ids(interfaces.iter().filter_map(|i| i.vpc_prefix_id));
                let prefixes = vpc_prefix::load_by_ids(conn, &ids).await?;
                for interface in interfaces.iter_mut() {
                    interface.vpc_prefix =
                        interface.vpc_prefix_id.and_then(|id| prefixes.get(&id)).cloned();
                }
            }
            InterfaceRelation::MachineInterface => {
                let ids = distinct_ids(interfaces.iter().filter_map(|i| i.machine_interface_id));
                let machine_interfaces = machine_interface::load_by_ids(conn, &ids).await?;
                for interface in interfaces.iter_mut() {
                    interface.machine_interface = interface
                        .machine_interface_id
                        .and_then(|id| machine_interfaces.get(&id))
                        .cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[InterfaceRelation],
) -> Result<Interface> {
    let row = sqlx::query_as::<_, InterfaceRow>(
        "SELECT * FROM interface WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch interface {}", id)))?
    .ok_or_else(|| ForgeError::not_found("Interface", id))?;

    let mut interfaces = [Interface::try_from(row)?];
    attach_relations(conn, &mut interfaces, relations).await?;
    let [interface] = interfaces;
    Ok(interface)
}

async fn insert_rows(
    conn: &mut PgConnection,
    rows: Vec<(Uuid, CreateInterfaceRequest)>,
) -> Result<Vec<Interface>> {
    let ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
    let now = Utc::now();

    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO interface (id, instance_id, subnet_id, vpc_prefix_id, machine_interface_id, \
         device, device_instance, is_physical, virtual_function_id, mac_address, ip_addresses, \
         status, created_by, created, updated) ",
    );
    qb.push_values(rows, |mut b, (id, r)| {
        b.push_bind(id)
            .push_bind(r.instance_id)
            .push_bind(r.subnet_id)
            .push_bind(r.vpc_prefix_id)
            .push_bind(r.machine_interface_id)
            .push_bind(r.device)
            .push_bind(r.device_instance)
            .push_bind(r.is_physical)
            .push_bind(r.virtual_function_id)
            .push_bind(r.mac_address)
            .push_bind(r.ip_addresses)
            .push_bind(r.status.as_str())
            .push_bind(r.created_by)
            .push_bind(now)
            .push_bind(now);
    });
    qb.push(" RETURNING *");

    let inserted = qb
        .build_query_as::<InterfaceRow>()
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create interfaces"))?;

    let interfaces = inserted.into_iter().map(Interface::try_from).collect::<Result<Vec<_>>>()?;
    order_by_input(&ids, interfaces, |i| &i.id)
}

async fn apply_update(
    conn: &mut PgConnection,
    id: Uuid,
    request: UpdateInterfaceRequest,
) -> Result<()> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE interface SET ");
    let mut set = qb.separated(", ");
    let mut changed = false;
    if let Some(v) = request.subnet_id {
        set.push("subnet_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.vpc_prefix_id {
        set.push("vpc_prefix_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.machine_interface_id {
        set.push("machine_interface_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.device {
        set.push("device = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.device_instance {
        set.push("device_instance = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.is_physical {
        set.push("is_physical = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.virtual_function_id {
        set.push("virtual_function_id = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.mac_address {
        set.push("mac_address = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.ip_addresses {
        set.push("ip_addresses = ").push_bind_unseparated(v);
        changed = true;
    }
    if let Some(v) = request.status {
        set.push("status = ").push_bind_unseparated(v.as_str());
        changed = true;
    }
    if !changed {
        return ensure_live_row(conn, "interface", "Interface", id).await;
    }
    set.push("updated = ").push_bind_unseparated(Utc::now());
    qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

    let result = qb
        .build()
        .execute(conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to update interface {}", id)))?;
    if result.rows_affected() == 0 {
        return Err(ForgeError::not_found("Interface", id));
    }
    Ok(())
}

async fn update_batch(
    conn: &mut PgConnection,
    requests: Vec<(Uuid, UpdateInterfaceRequest)>,
    ids: &[Uuid],
) -> Result<Vec<Interface>> {
    for (id, request) in requests {
        apply_update(conn, id, request).await?;
    }

    let rows = sqlx::query_as::<_, InterfaceRow>(
        "SELECT * FROM interface WHERE id = ANY($1) AND deleted IS NULL",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to fetch updated interfaces"))?;

    let interfaces = rows.into_iter().map(Interface::try_from).collect::<Result<Vec<_>>>()?;
    order_by_input(ids, interfaces, |i| &i.id)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &InterfaceFilter) {
    push_opt_uuids(qb, "ifc.instance_id", &filter.instance_ids);
    if let Some(id) = filter.subnet_id {
        push_eq(qb, "ifc.subnet_id", id);
    }
    if let Some(id) = filter.vpc_prefix_id {
        push_eq(qb, "ifc.vpc_prefix_id", id);
    }
    if let Some(device) = &filter.device {
        push_eq(qb, "ifc.device", device.clone());
    }
    if let Some(device_instance) = filter.device_instance {
        push_eq(qb, "ifc.device_instance", device_instance);
    }
    if let Some(is_physical) = filter.is_physical {
        push_eq(qb, "ifc.is_physical", is_physical);
    }
    push_opt_strings(qb, "ifc.status", &filter.statuses.as_deref().map(status_strings));
    if let Some(addresses) = &filter.ip_addresses {
        qb.push(" AND ifc.ip_addresses && ").push_bind(addresses.clone()).push("::text[]");
    }
}

#[async_trait]
impl InterfaceRepository for SqlxInterfaceRepository {
    #[instrument(skip(self, tx, request), fields(instance_id = %request.instance_id), name = "db_create_interface")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateInterfaceRequest,
    ) -> Result<Interface> {
        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, vec![(Uuid::new_v4(), request)])
            .await?
            .pop()
            .ok_or_else(|| ForgeError::internal("insert returned no interface"))
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_create_multiple_interfaces"
    )]
    async fn create_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<CreateInterfaceRequest>,
    ) -> Result<Vec<Interface>> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(Uuid, CreateInterfaceRequest)> =
            requests.into_iter().map(|r| (Uuid::new_v4(), r)).collect();
        let ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        record_batch_ids(&Span::current(), &ids);

        let mut conn = acquire(&self.pool, tx).await?;
        insert_rows(&mut conn, rows).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_interface_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[InterfaceRelation],
    ) -> Result<Interface> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_interfaces")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &InterfaceFilter,
        page: &PageInput,
        relations: &[InterfaceRelation],
    ) -> Result<(Vec<Interface>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), INTERFACE_ORDER_FIELDS, "ifc.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM interface ifc WHERE ifc.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count interfaces"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT ifc.* FROM interface ifc WHERE ifc.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<InterfaceRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list interfaces"))?;

        let mut interfaces = rows.into_iter().map(Interface::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut interfaces, relations).await?;
        Ok((interfaces, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_interface")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateInterfaceRequest,
    ) -> Result<Interface> {
        let mut conn = acquire(&self.pool, tx).await?;
        apply_update(&mut conn, id, request).await?;
        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(
        skip_all,
        fields(batch_size = field::Empty, ids = field::Empty, items_truncated = field::Empty),
        name = "db_update_multiple_interfaces"
    )]
    async fn update_multiple(
        &self,
        tx: Option<&mut Tx>,
        requests: Vec<(Uuid, UpdateInterfaceRequest)>,
    ) -> Result<Vec<Interface>> {
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
                let interfaces = update_batch(tx.connection(), requests, &ids).await?;
                tx.commit().await?;
                Ok(interfaces)
            }
        }
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_interface")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE interface SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete interface {}", id)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{lazy_pool, TEST_USER_ID};
    use crate::storage::MAX_BATCH_ITEMS;

    fn request(instance_id: Uuid, addresses: &[&str]) -> CreateInterfaceRequest {
        CreateInterfaceRequest {
            instance_id,
            subnet_id: None,
            vpc_prefix_id: None,
            machine_interface_id: None,
            device: Some("MT43244 BlueField-3".to_string()),
            device_instance: Some(0),
            is_physical: true,
            virtual_function_id: None,
            mac_address: None,
            ip_addresses: addresses.iter().map(|a| a.to_string()).collect(),
            status: InterfaceStatus::Pending,
            created_by: TEST_USER_ID,
        }
    }

    #[tokio::test]
    async fn test_create_multiple_over_limit() {
        let repo = SqlxInterfaceRepository::new(lazy_pool());
        let instance_id = Uuid::new_v4();
        let requests = (0..MAX_BATCH_ITEMS + 3).map(|_| request(instance_id, &[])).collect();

        let err = repo.create_multiple(None, requests).await.unwrap_err();
        assert_eq!(err.to_string(), "batch size 103 exceeds maximum allowed 100");
    }

    #[tokio::test]
    async fn test_update_multiple_repeated_id_is_rejected() {
        let repo = SqlxInterfaceRepository::new(lazy_pool());
        let id = Uuid::new_v4();
        let requests = vec![
            (id, UpdateInterfaceRequest::default()),
            (Uuid::new_v4(), UpdateInterfaceRequest::default()),
            (id, UpdateInterfaceRequest::default()),
        ];

        let err = repo.update_multiple(None, requests).await.unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));
    }

    #[test]
    fn test_ip_address_filter_uses_overlap() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ifc.* FROM interface ifc WHERE TRUE");
        push_filter(
            &mut qb,
            &InterfaceFilter {
                ip_addresses: Some(vec!["10.0.0.5".to_string()]),
                is_physical: Some(true),
                ..Default::default()
            },
        );
        assert!(qb.sql().ends_with(" AND ifc.is_physical = $1 AND ifc.ip_addresses && $2::text[]"));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::TestDatabase;

        #[tokio::test]
        async fn test_batch_and_address_overlap() {
            let db = TestDatabase::new("interface_batch").await;
            let repo = SqlxInterfaceRepository::new(db.pool.clone());
            let instance_id = db.seed_instance("host").await;

            let created = repo
                .create_multiple(
                    None,
                    vec![
                        request(instance_id, &["10.0.0.5", "10.0.0.6"]),
                        request(instance_id, &["10.0.1.5"]),
                        request(instance_id, &[]),
                    ],
                )
                .await
                .unwrap();
            assert_eq!(created[0].ip_addresses, vec!["10.0.0.5", "10.0.0.6"]);
            assert!(created[2].ip_addresses.is_empty());

            let (rows, total) = repo
                .get_all(
                    None,
                    &InterfaceFilter {
                        ip_addresses: Some(vec!["10.0.0.6".to_string(), "10.0.1.5".to_string()]),
                        ..Default::default()
                    },
                    &PageInput::default(),
                    &[InterfaceRelation::Instance],
                )
                .await
                .unwrap();
            assert_eq!(total, 2);
            assert!(rows.iter().all(|r| r.instance.as_ref().map(|i| i.id) == Some(instance_id)));

            let updated = repo
                .update_multiple(
                    None,
                    vec![
                        (
                            created[1].id,
                            UpdateInterfaceRequest {
                                status: Some(InterfaceStatus::Ready),
                                ..Default::default()
                            },
                        ),
                        (
                            created[0].id,
                            UpdateInterfaceRequest {
                                mac_address: Some("00:11:22:33:44:55".to_string()),
                                ..Default::default()
                            },
                        ),
                    ],
                )
                .await
                .unwrap();
            assert_eq!(updated[0].status, InterfaceStatus::Ready);
            assert_eq!(updated[1].mac_address.as_deref(), Some("00:11:22:33:44:55"));

            let err = repo
                .update_multiple(
                    None,
                    vec![
                        (
                            created[2].id,
                            UpdateInterfaceRequest {
                                status: Some(InterfaceStatus::Error),
                                ..Default::default()
                            },
                        ),
                        (Uuid::new_v4(), UpdateInterfaceRequest::default()),
                    ],
                )
                .await
                .unwrap_err();
            assert!(err.is_not_found());
            let untouched = repo.get_by_id(None, created[2].id, &[]).await.unwrap();
            assert_eq!(untouched.status, InterfaceStatus::Pending);

            let err = repo
                .create(None, request(Uuid::new_v4(), &[]))
                .await
                .unwrap_err();
            assert!(err.is_foreign_key_violation());
        }

        #[tokio::test]
        async fn test_machine_interface_relation() {
            use crate::storage::repositories::machine_interface::{
                CreateMachineInterfaceRequest, MachineInterfaceRepository,
                SqlxMachineInterfaceRepository,
            };

            let db = TestDatabase::new("interface_machine").await;
            let repo = SqlxInterfaceRepository::new(db.pool.clone());
            let instance_id = db.seed_instance("host").await;
            let machine_id = db.seed_machine(None).await;
            let machine_interface = SqlxMachineInterfaceRepository::new(db.pool.clone())
                .create(
                    None,
                    CreateMachineInterfaceRequest {
                        machine_id: machine_id.clone(),
                        controller_interface_id: None,
                        controller_segment_id: None,
                        attached_dpu_machine_id: None,
                        subnet_id: None,
                        hostname: Some("host-dpu".to_string()),
                        is_primary: true,
                        mac_address: None,
                        ip_addresses: Vec::new(),
                    },
                )
                .await
                .unwrap();

            let interface = repo
                .create(
                    None,
                    CreateInterfaceRequest {
                        machine_interface_id: Some(machine_interface.id),
                        ..request(instance_id, &[])
                    },
                )
                .await
                .unwrap();

            let fetched = repo
                .get_by_id(
                    None,
                    interface.id,
                    &[InterfaceRelation::MachineInterface, InterfaceRelation::VpcPrefix],
                )
                .await
                .unwrap();
            let loaded = fetched.machine_interface.unwrap();
            assert_eq!(loaded.id, machine_interface.id);
            assert_eq!(loaded.machine_id, machine_id);
            assert!(fetched.vpc_prefix.is_none());
        }
    }
}
