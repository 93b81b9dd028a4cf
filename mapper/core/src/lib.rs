//! Discovery pipeline and entity graph engine for agentless homelab
//! mapping: subnet sweep, port fingerprinting, adapter-driven platform
//! expansion, correlation, conflict detection and run-over-run diffing.

pub mod adapter;
pub mod conflict;
pub mod context;
pub mod correlate;
pub mod diff;
pub mod entity;
pub mod hint;
pub mod history;
pub mod orchestrator;
pub mod pipeline;
pub mod probe;
pub mod registry;
pub mod report;
pub mod sweep;

pub use adapter::{ActivationCriteria, Adapter, EntityPatch, ScanOutcome};
pub use conflict::{Conflict, ConflictKind, detect_conflicts};
pub use context::{Credentials, ScanContext, Timeouts};
pub use correlate::correlate;
pub use diff::{ChangeKind, DiffReport, diff, fingerprint};
pub use entity::{CertificateSummary, Entity, EntityKind, EntityStatus, MetaValue, keys};
pub use hint::{Hint, apply_hints};
pub use history::{HistoryError, HistoryStore};
pub use orchestrator::Orchestrator;
pub use pipeline::{PipelineConfig, PipelineError, ScanPipeline};
pub use probe::{FINGERPRINT_PORTS, PortProber};
pub use registry::AdapterRegistry;
pub use report::{TopologyReport, TopologySummary, scan_id_for};
pub use sweep::{HostSweeper, Pinger, SweepError, TcpPinger, expand_cidr};
