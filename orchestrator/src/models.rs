//! Row types and status enums.
//!
//! Enums are stored as lowercase TEXT; the same spelling is used on the wire.

use serde::{Deserialize, Serialize};

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[serde(rename_all = "snake_case")]
        #[sqlx(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($name), s)),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

status_enum!(
    /// What a pooled network configuration is reserved for.
    NetworkRole {
        Production => "production",
        Test => "test",
        Host => "host",
    }
);

status_enum!(ServiceRole {
    Production => "production",
    Test => "test",
});

impl ServiceRole {
    /// Pool role for the service address of this role.
    pub fn network_role(&self) -> NetworkRole {
        match self {
            ServiceRole::Production => NetworkRole::Production,
            ServiceRole::Test => NetworkRole::Test,
        }
    }
}

status_enum!(
    /// Lifecycle of a hosted service, see [`ServiceStatus::can_transition`].
    ServiceStatus {
        Requested => "requested",
        Installing => "installing",
        Postinstall => "postinstall",
        AnsibleQueued => "ansible_queued",
        Ansible => "ansible",
        Ready => "ready",
        Denied => "denied",
    }
);

impl ServiceStatus {
    /// Whether `self → to` is an accepted transition.
    ///
    /// `→ requested` is destroy and `→ installing` from later states is
    /// recreate. `installing → installing` re-drives a create after a retry.
    pub fn can_transition(&self, to: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match self {
            Requested => matches!(to, Installing | Denied),
            Installing => matches!(to, Installing | Postinstall | Requested | Denied),
            Postinstall => matches!(to, AnsibleQueued | Installing | Requested),
            AnsibleQueued => matches!(to, Ansible | Installing | Requested),
            Ansible => matches!(to, Ready | AnsibleQueued | Installing | Requested),
            Ready => matches!(to, AnsibleQueued | Installing | Requested),
            Denied => false,
        }
    }

    /// States in which the configuration run has been reached at least once.
    pub fn is_configured(&self) -> bool {
        matches!(
            self,
            ServiceStatus::AnsibleQueued | ServiceStatus::Ansible | ServiceStatus::Ready
        )
    }
}

status_enum!(VmStatus {
    Requested => "requested",
    Accepted => "accepted",
    Ready => "ready",
    Denied => "denied",
});

status_enum!(DomainStatus {
    Requested => "requested",
    Accepted => "accepted",
    Denied => "denied",
    Private => "private",
    Global => "global",
    External => "external",
    Special => "special",
    Deleted => "deleted",
});

status_enum!(TaskStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl DomainStatus {
    /// Domains the validation sweep looks at.
    pub const ACTIVE: &'static [DomainStatus] = &[
        DomainStatus::Accepted,
        DomainStatus::Private,
        DomainStatus::Global,
        DomainStatus::External,
        DomainStatus::Special,
        DomainStatus::Deleted,
    ];
}

// ─── Rows ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct NetworkConfig {
    pub id: i64,
    pub role: NetworkRole,
    pub ipv4: String,
    pub ipv6: Option<String>,
    pub sshfp: Option<String>,
    pub hostname: String,
    pub ipv4_private: Option<String>,
    pub private_hostname: Option<String>,
    pub claimed_at: Option<String>,
}

/// A configuration registered with the name service, ready to be pooled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNetworkConfig {
    pub role: NetworkRole,
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub sshfp: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub ipv4_private: Option<String>,
    #[serde(default)]
    pub private_hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ServerType {
    pub id: i64,
    pub name: String,
    pub numcpu: i64,
    /// GiB
    pub sizeram: i64,
    /// GiB
    pub sizedisk: i64,
    /// How many unassigned sites of this type to keep ready
    pub preallocated: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub email: Option<String>,
    pub server_type_id: i64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub deleted: bool,
    pub disabled: bool,
    pub suspended: bool,
    pub preallocated: bool,
}

impl Site {
    /// A site with an end date is cancelled for good.
    pub fn is_cancelled(&self) -> bool {
        self.end_date.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSite {
    pub name: String,
    pub description: Option<String>,
    pub email: Option<String>,
    pub server_type_id: i64,
    pub start_date: Option<String>,
    pub preallocated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub site_id: i64,
    pub role: ServiceRole,
    pub status: ServiceStatus,
    pub network_config_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct VirtualMachine {
    pub id: i64,
    pub service_id: i64,
    /// Hypervisor identifier, unknown until the create call returns
    pub name: Option<String>,
    pub status: VmStatus,
    pub numcpu: i64,
    pub sizeram: i64,
    #[serde(skip_serializing)]
    pub token: String,
    pub cluster_id: i64,
    pub network_config_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Host {
    pub id: i64,
    pub cluster_id: i64,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Vhost {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub main_domain_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DomainName {
    pub id: i64,
    pub vhost_id: i64,
    pub name: String,
    pub status: DomainStatus,
    pub requested_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SiteKey {
    pub site_id: i64,
    pub key_type: String,
    pub public_key: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub site_id: i64,
    pub created_at: String,
}
