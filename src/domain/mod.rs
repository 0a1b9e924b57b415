//! Domain layer
//!
//! Types shared across repositories that carry no storage concerns of their own.

pub mod status;

pub use status::{
    parse_status, status_strings, AllocationConstraintType, AllocationResourceType,
    AllocationStatus, DomainStatus, DpuExtensionServiceDeploymentStatus, DpuExtensionServiceStatus,
    InstanceStatus, InstanceTypeStatus, InterfaceStatus, IpBlockStatus, MachineStatus,
    NetworkSecurityGroupStatus, OperatingSystemStatus, OperatingSystemType, SiteStatus,
    SshKeyGroupStatus, StatusParseError, SubnetStatus, VpcPrefixStatus, VpcStatus,
};
