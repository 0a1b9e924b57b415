//! Repository modules for data access
//!
//! One repository per table. Each exposes an async trait and a `Sqlx*` implementation
//! backed by the shared pool; every method also accepts the caller's [`Tx`].
//!
//! [`Tx`]: crate::storage::Tx

pub mod allocation;
pub mod allocation_constraint;
pub mod domain;
pub mod dpu_extension_service;
pub mod dpu_extension_service_deployment;
pub mod infrastructure_provider;
pub mod instance;
pub mod instance_type;
pub mod interface;
pub mod ip_block;
pub mod machine;
pub mod machine_interface;
pub mod network_security_group;
pub mod operating_system;
pub mod site;
pub mod ssh_key;
pub mod ssh_key_association;
pub mod ssh_key_group;
pub mod ssh_key_group_instance_association;
pub mod ssh_key_group_site_association;
pub mod status_detail;
pub mod subnet;
pub mod tenant;
pub mod vpc;
pub mod vpc_prefix;

pub use allocation::{
    Allocation, AllocationFilter, AllocationRelation, AllocationRepository,
    ClearAllocationRequest, CreateAllocationRequest, SqlxAllocationRepository,
    UpdateAllocationRequest,
};
pub use allocation_constraint::{
    AllocationConstraint, AllocationConstraintFilter, AllocationConstraintRelation,
    AllocationConstraintRepository, CreateAllocationConstraintRequest,
    SqlxAllocationConstraintRepository, UpdateAllocationConstraintRequest,
};
pub use domain::{
    CreateDomainRequest, Domain, DomainFilter, DomainRepository, SqlxDomainRepository,
    UpdateDomainRequest,
};
pub use dpu_extension_service::{
    CreateDpuExtensionServiceRequest, DpuExtensionService, DpuExtensionServiceFilter,
    DpuExtensionServiceRelation, DpuExtensionServiceRepository, SqlxDpuExtensionServiceRepository,
    UpdateDpuExtensionServiceRequest,
};
pub use dpu_extension_service_deployment::{
    CreateDpuExtensionServiceDeploymentRequest, DpuExtensionServiceDeployment,
    DpuExtensionServiceDeploymentFilter, DpuExtensionServiceDeploymentRelation,
    DpuExtensionServiceDeploymentRepository, SqlxDpuExtensionServiceDeploymentRepository,
    UpdateDpuExtensionServiceDeploymentRequest,
};
pub use infrastructure_provider::{
    CreateInfrastructureProviderRequest, InfrastructureProvider, InfrastructureProviderFilter,
    InfrastructureProviderRepository, SqlxInfrastructureProviderRepository,
    UpdateInfrastructureProviderRequest,
};
pub use instance::{
    ClearInstanceRequest, CreateInstanceRequest, Instance, InstanceFilter, InstanceRelation,
    InstanceRepository, SqlxInstanceRepository, UpdateInstanceRequest,
};
pub use instance_type::{
    CreateInstanceTypeRequest, InstanceType, InstanceTypeFilter, InstanceTypeRelation,
    InstanceTypeRepository, SqlxInstanceTypeRepository, UpdateInstanceTypeRequest,
};
pub use interface::{
    CreateInterfaceRequest, Interface, InterfaceFilter, InterfaceRelation, InterfaceRepository,
    SqlxInterfaceRepository, UpdateInterfaceRequest,
};
pub use ip_block::{
    ClearIpBlockRequest, CreateIpBlockRequest, IpBlock, IpBlockFilter, IpBlockRelation,
    IpBlockRepository, SqlxIpBlockRepository, UpdateIpBlockRequest,
};
pub use machine::{
    ClearMachineRequest, CreateMachineRequest, Machine, MachineFilter, MachineRelation,
    MachineRepository, SqlxMachineRepository, UpdateMachineRequest,
};
pub use machine_interface::{
    ClearMachineInterfaceRequest, CreateMachineInterfaceRequest, MachineInterface,
    MachineInterfaceFilter, MachineInterfaceRelation, MachineInterfaceRepository,
    SqlxMachineInterfaceRepository, UpdateMachineInterfaceRequest,
};
pub use network_security_group::{
    CreateNetworkSecurityGroupRequest, NetworkSecurityGroup, NetworkSecurityGroupFilter,
    NetworkSecurityGroupPropagationDetails, NetworkSecurityGroupRelation,
    NetworkSecurityGroupRepository, NetworkSecurityGroupRule, SqlxNetworkSecurityGroupRepository,
    UpdateNetworkSecurityGroupRequest,
};
pub use operating_system::{
    ClearOperatingSystemRequest, CreateOperatingSystemRequest, OperatingSystem,
    OperatingSystemFilter, OperatingSystemRelation, OperatingSystemRepository,
    SqlxOperatingSystemRepository, UpdateOperatingSystemRequest,
};
pub use site::{
    CreateSiteRequest, Site, SiteFilter, SiteRelation, SiteRepository, SqlxSiteRepository,
    UpdateSiteRequest,
};
pub use ssh_key::{
    CreateSshKeyRequest, SqlxSshKeyRepository, SshKey, SshKeyFilter, SshKeyRelation,
    SshKeyRepository, UpdateSshKeyRequest,
};
pub use ssh_key_association::{
    CreateSshKeyAssociationRequest, SqlxSshKeyAssociationRepository, SshKeyAssociation,
    SshKeyAssociationFilter, SshKeyAssociationRelation, SshKeyAssociationRepository,
    UpdateSshKeyAssociationRequest,
};
pub use ssh_key_group::{
    CreateSshKeyGroupRequest, SqlxSshKeyGroupRepository, SshKeyGroup, SshKeyGroupFilter,
    SshKeyGroupRelation, SshKeyGroupRepository, UpdateSshKeyGroupRequest,
};
pub use ssh_key_group_instance_association::{
    CreateSshKeyGroupInstanceAssociationRequest, SqlxSshKeyGroupInstanceAssociationRepository,
    SshKeyGroupInstanceAssociation, SshKeyGroupInstanceAssociationFilter,
    SshKeyGroupInstanceAssociationRelation, SshKeyGroupInstanceAssociationRepository,
    UpdateSshKeyGroupInstanceAssociationRequest,
};
pub use ssh_key_group_site_association::{
    CreateSshKeyGroupSiteAssociationRequest, SqlxSshKeyGroupSiteAssociationRepository,
    SshKeyGroupSiteAssociation, SshKeyGroupSiteAssociationFilter,
    SshKeyGroupSiteAssociationRelation, SshKeyGroupSiteAssociationRepository,
    UpdateSshKeyGroupSiteAssociationRequest,
};
pub use status_detail::{
    CreateStatusDetailRequest, SqlxStatusDetailRepository, StatusDetail, StatusDetailRepository,
    UpdateStatusDetailRequest,
};
pub use subnet::{
    ClearSubnetRequest, CreateSubnetRequest, SqlxSubnetRepository, Subnet, SubnetFilter,
    SubnetRelation, SubnetRepository, UpdateSubnetRequest,
};
pub use tenant::{
    CreateTenantRequest, SqlxTenantRepository, Tenant, TenantConfig, TenantFilter,
    TenantRepository, UpdateTenantRequest,
};
pub use vpc::{
    ClearVpcRequest, CreateVpcRequest, SqlxVpcRepository, UpdateVpcRequest, Vpc, VpcFilter,
    VpcRelation, VpcRepository,
};
pub use vpc_prefix::{
    CreateVpcPrefixRequest, SqlxVpcPrefixRepository, UpdateVpcPrefixRequest, VpcPrefix,
    VpcPrefixFilter, VpcPrefixRelation, VpcPrefixRepository,
};

use std::collections::HashSet;
use std::hash::Hash;

/// Distinct ids in first-seen order
pub(crate) fn distinct_ids<T, I>(ids: I) -> Vec<T>
where
    T: Eq + Hash + Clone,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_distinct_ids_keeps_first_seen_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(distinct_ids([b, a, b, a]), vec![b, a]);
        assert!(distinct_ids(Vec::<Uuid>::new()).is_empty());

        let machines = ["fm-b", "fm-a", "fm-b"].map(String::from);
        assert_eq!(distinct_ids(machines), vec!["fm-b".to_string(), "fm-a".to_string()]);
    }
}
