//! Platform adapters for the discovery engine: Proxmox VE, Docker engines,
//! Portainer, Unraid and the LAN gateway. Each adapter hides its wire
//! format behind a backend trait so the scan logic is testable offline.

pub mod docker;
pub mod error;
pub mod portainer;
pub mod proxmox;
pub mod router;
pub mod unraid;

pub use docker::{DockerAdapter, DockerApi, DockerHttpApi};
pub use error::BackendError;
pub use portainer::{PortainerAdapter, PortainerApi, PortainerHttpApi};
pub use proxmox::{ProxmoxAdapter, ProxmoxApi, ProxmoxHttpApi};
pub use router::{DhcpLease, JsonLeaseSource, LeaseSource, RouterAdapter};
pub use unraid::{UnraidAdapter, UnraidApi, UnraidHttpApi};
