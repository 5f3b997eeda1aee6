//! Event transfer broker.
//!
//! A fixed pool of event buffers circulates through a chain of stations.
//! Producers take fresh events from GrandCentral, fill them and put them
//! back; each station's conductor forwards them downstream to the stations
//! whose selection criteria accept them; consumers attached to those
//! stations get, process and put them again. Whatever no station wants
//! returns to GrandCentral for reuse.
//!
//! Everything runs in one address space behind [`EtSystem`]. Clients
//! register through [`ProcessHandle`]s, or from other hosts through the
//! TCP gateway with [`RemoteSystem`].

pub mod config;
pub mod error;
pub mod event;
pub mod list;
pub mod registry;
pub mod remote;
pub mod select;
pub mod station;
pub mod system;
pub mod topology;

mod access;
mod attachment;
mod conductor;
mod distribute;
mod heartbeat;
mod lock;
mod mmap;
mod pool;
mod process;

pub use config::{
    BlockMode, FlowMode, GatewayConfig, RestoreMode, SelectMode, StationConfig, SystemConfig, UserMode,
    SELECT_INTS,
};
pub use error::{Error, Result};
pub use event::{Age, ByteOrder, DataStatus, Event, EventId, EventInfo, Owner, Priority};
pub use list::{ListStats, WaitMode};
pub use process::ProcessHandle;
pub use registry::{AttachmentId, AttachmentStats, ProcessId};
pub use remote::{DiscoveryConfig, DiscoveryMethod, RemoteEvent, RemoteSystem};
pub use select::Selector;
pub use station::{StationId, StationStats, StationStatus, GRAND_CENTRAL_NAME};
pub use system::{EtSystem, EventCensus, SystemStats};
pub use topology::{ParallelPosition, Position};
