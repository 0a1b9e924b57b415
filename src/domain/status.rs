//! Lifecycle statuses stored as text columns.
//!
//! Every status type renders to and parses from the exact string kept in the
//! database, serializes the same way, and lists its variants in `ALL`.

use crate::errors::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind} '{value}'")]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Generate a text-backed status enum
macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StatusParseError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StatusParseError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum! {
    SiteStatus {
        Pending => "Pending",
        Registered => "Registered",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    VpcStatus {
        Pending => "Pending",
        Provisioning => "Provisioning",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    SubnetStatus {
        Pending => "Pending",
        Provisioning => "Provisioning",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    NetworkSecurityGroupStatus {
        Pending => "Pending",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    InstanceStatus {
        Pending => "Pending",
        Provisioning => "Provisioning",
        Configuring => "Configuring",
        Ready => "Ready",
        Updating => "Updating",
        Error => "Error",
        Terminating => "Terminating",
        Terminated => "Terminated",
        Unknown => "Unknown",
    }
}

status_enum! {
    InterfaceStatus {
        Pending => "Pending",
        Provisioning => "Provisioning",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    /// Shared by SSH key groups and their site associations
    SshKeyGroupStatus {
        Syncing => "Syncing",
        Synced => "Synced",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    DpuExtensionServiceStatus {
        Pending => "Pending",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    DpuExtensionServiceDeploymentStatus {
        Pending => "Pending",
        Running => "Running",
        Error => "Error",
        Failed => "Failed",
        Terminating => "Terminating",
    }
}

status_enum! {
    InstanceTypeStatus {
        Pending => "Pending",
        Ready => "Ready",
        Error => "Error",
    }
}

status_enum! {
    AllocationStatus {
        Pending => "Pending",
        Registered => "Registered",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    IpBlockStatus {
        Pending => "Pending",
        Provisioning => "Provisioning",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
    }
}

status_enum! {
    OperatingSystemStatus {
        Pending => "Pending",
        Provisioning => "Provisioning",
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
        Syncing => "Syncing",
        Deactivated => "Deactivated",
    }
}

status_enum! {
    /// How an operating system boots: a custom iPXE script or a disk image
    OperatingSystemType {
        Ipxe => "iPXE",
        Image => "Image",
    }
}

status_enum! {
    MachineStatus {
        Initializing => "Initializing",
        Ready => "Ready",
        InUse => "InUse",
        Error => "Error",
        Maintenance => "Maintenance",
        Reset => "Reset",
        Decommissioned => "Decommissioned",
        Unknown => "Unknown",
    }
}

status_enum! {
    /// Domain statuses carry their type name in the stored text
    DomainStatus {
        Pending => "DomainStatusPending",
        Registering => "DomainStatusRegistering",
        Ready => "DomainStatusReady",
        Error => "DomainStatusError",
    }
}

status_enum! {
    VpcPrefixStatus {
        Ready => "Ready",
        Error => "Error",
        Deleting => "Deleting",
        Deleted => "Deleted",
    }
}

status_enum! {
    AllocationConstraintType {
        Reserved => "Reserved",
        OnDemand => "OnDemand",
        Preemptible => "Preemptible",
    }
}

status_enum! {
    /// Kind of resource an allocation constraint reserves
    AllocationResourceType {
        InstanceType => "InstanceType",
        IpBlock => "IPBlock",
    }
}

/// Parse a stored status, reporting corrupt values as validation errors
pub fn parse_status<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = StatusParseError>,
{
    value.parse::<T>().map_err(|e| ForgeError::validation_field(e.to_string(), "status"))
}

/// Render a status list for a `= ANY` filter
pub fn status_strings<T: Copy + Into<&'static str>>(statuses: &[T]) -> Vec<&'static str> {
    statuses.iter().map(|s| (*s).into()).collect()
}

macro_rules! status_into_str {
    ($($name:ident),+) => {
        $(
            impl From<$name> for &'static str {
                fn from(status: $name) -> Self {
                    status.as_str()
                }
            }
        )+
    };
}

status_into_str!(
    SiteStatus,
    VpcStatus,
    SubnetStatus,
    NetworkSecurityGroupStatus,
    InstanceStatus,
    InterfaceStatus,
    SshKeyGroupStatus,
    DpuExtensionServiceStatus,
    DpuExtensionServiceDeploymentStatus,
    InstanceTypeStatus,
    AllocationStatus,
    IpBlockStatus,
    OperatingSystemStatus,
    OperatingSystemType,
    MachineStatus,
    DomainStatus,
    VpcPrefixStatus,
    AllocationConstraintType,
    AllocationResourceType
);
