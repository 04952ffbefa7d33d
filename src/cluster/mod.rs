//! Cluster coordination: roles, locking, peer calls, replication and healing

pub mod heal;
pub mod locks;
pub mod membership;
pub mod peer;
pub mod readiness;
pub mod replication;
pub mod role;
pub mod transport;

pub use heal::{HealCoordinator, HealReport};
pub use locks::MountLockTable;
pub use membership::Membership;
pub use peer::PeerClient;
pub use readiness::ReadinessLatch;
pub use replication::{PendingChange, ReplicationReport, Replicator};
pub use role::{ClusterRole, NodeId, Role, RoleResolver, RoleSnapshot, StaticRole};
pub use transport::{
    HttpTransport, InProcessTransport, PeerRequest, PeerResponse, PeerTransport, FORWARDED_HEADER,
};
