use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::select::Selector;
use crate::{Error, Result};

/// Number of control words carried by every event and every station's
/// selection criteria.
pub const SELECT_INTS: usize = 6;
/// Upper bound on the number of event groups in a pool.
pub const MAX_GROUPS: usize = 200;
/// Default TCP/UDP port of the remote gateway.
pub const DEFAULT_PORT: u16 = 11111;
/// Default multicast group used for discovery.
pub const DEFAULT_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 200, 0, 0);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Name answered by the discovery responder.
    pub name: String,
    pub events: usize,
    pub event_size: usize,
    /// Slot count of each event group; must sum to `events`.
    /// Empty means a single group holding every event.
    pub groups: Vec<usize>,
    pub max_temps: usize,
    pub max_stations: usize,
    pub max_attachments: usize,
    pub max_processes: usize,
    /// Back the event segment with this file instead of anonymous memory.
    /// The file is truncated and rebuilt at every start.
    pub segment_path: Option<PathBuf>,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "millis")]
    pub monitor_interval: Duration,
    #[serde(with = "millis")]
    pub temp_retry_budget: Duration,
    #[serde(with = "millis")]
    pub temp_retry_interval: Duration,
    #[serde(with = "millis")]
    pub remove_drain_timeout: Duration,
    pub gateway: Option<GatewayConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "et".to_string(),
            events: 300,
            event_size: 1000,
            groups: Vec::new(),
            max_temps: 300,
            max_stations: 200,
            max_attachments: 100,
            max_processes: 50,
            segment_path: None,
            heartbeat_interval: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(2),
            temp_retry_budget: Duration::from_secs(30),
            temp_retry_interval: Duration::from_millis(10),
            remove_drain_timeout: Duration::from_millis(500),
            gateway: None,
        }
    }
}

impl SystemConfig {
    pub fn new(events: usize, event_size: usize) -> Self {
        Self {
            events,
            event_size,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: SystemConfig = serde_json::from_str(&raw)
            .map_err(|err| Error::InvalidConfig(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Group sizes with the single-group default filled in.
    pub fn group_sizes(&self) -> Vec<usize> {
        if self.groups.is_empty() {
            vec![self.events]
        } else {
            self.groups.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.events == 0 {
            return Err(Error::InvalidConfig("events must be non-zero".into()));
        }
        if self.event_size == 0 {
            return Err(Error::InvalidConfig("event_size must be non-zero".into()));
        }
        if self.groups.len() > MAX_GROUPS {
            return Err(Error::InvalidConfig(format!(
                "at most {MAX_GROUPS} groups, got {}",
                self.groups.len()
            )));
        }
        if self.groups.iter().any(|&n| n == 0) {
            return Err(Error::InvalidConfig("every group needs at least one event".into()));
        }
        let sum: usize = self.group_sizes().iter().sum();
        if sum != self.events {
            return Err(Error::InvalidConfig(format!(
                "group sizes sum to {sum}, expected {}",
                self.events
            )));
        }
        if self.max_stations < 2 {
            return Err(Error::InvalidConfig("max_stations must be at least 2".into()));
        }
        if self.max_attachments == 0 || self.max_processes == 0 {
            return Err(Error::InvalidConfig(
                "max_attachments and max_processes must be non-zero".into(),
            ));
        }
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("monitor_interval", self.monitor_interval),
            ("temp_retry_interval", self.temp_retry_interval),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.monitor_interval <= self.heartbeat_interval {
            return Err(Error::InvalidConfig(
                "monitor_interval must exceed heartbeat_interval".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub tcp_addr: SocketAddr,
    /// Port of the discovery responder; `None` disables discovery.
    pub udp_port: Option<u16>,
    /// Multicast groups joined by the discovery responder.
    pub multicast: Vec<Ipv4Addr>,
    /// Whether remote connections may attach to GrandCentral.
    pub remote_privileged: bool,
    /// Slice length used when a remote client waits without a timeout.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tcp_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            udp_port: Some(DEFAULT_PORT),
            multicast: vec![DEFAULT_MULTICAST],
            remote_privileged: true,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl GatewayConfig {
    /// Ephemeral TCP port on loopback with discovery disabled.
    pub fn loopback() -> Self {
        Self {
            tcp_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            udp_port: None,
            multicast: Vec::new(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowMode {
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockMode {
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectMode {
    All,
    Match,
    User,
    RoundRobin,
    EqualCue,
}

impl SelectMode {
    /// Modes in which a parallel group shares a batch instead of each
    /// member filtering it in turn.
    pub fn distributes(self) -> bool {
        matches!(self, SelectMode::RoundRobin | SelectMode::EqualCue)
    }
}

/// Where events owned by a departing attachment are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreMode {
    Out,
    In,
    Gc,
    Redistribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserMode {
    Multi,
    Max(usize),
}

impl UserMode {
    pub fn cap(self) -> Option<usize> {
        match self {
            UserMode::Multi => None,
            UserMode::Max(n) => Some(n),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub flow: FlowMode,
    pub user: UserMode,
    pub block: BlockMode,
    pub select_mode: SelectMode,
    pub restore: RestoreMode,
    pub prescale: u32,
    /// Input list cap of a non-blocking station.
    pub cue: usize,
    /// Control words matched against events; -1 disables a slot.
    pub select: [i32; SELECT_INTS],
    #[serde(skip)]
    pub selector: Option<Selector>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            flow: FlowMode::Serial,
            user: UserMode::Multi,
            block: BlockMode::Blocking,
            select_mode: SelectMode::All,
            restore: RestoreMode::Out,
            prescale: 1,
            cue: 10,
            select: [-1; SELECT_INTS],
            selector: None,
        }
    }
}

impl StationConfig {
    pub fn parallel() -> Self {
        Self {
            flow: FlowMode::Parallel,
            ..Self::default()
        }
    }

    pub fn matching(select: [i32; SELECT_INTS]) -> Self {
        Self {
            select_mode: SelectMode::Match,
            select,
            ..Self::default()
        }
    }

    pub fn with_select_mode(mut self, mode: SelectMode) -> Self {
        self.select_mode = mode;
        self
    }

    pub fn with_block(mut self, block: BlockMode, cue: usize) -> Self {
        self.block = block;
        self.cue = cue;
        self
    }

    pub fn with_restore(mut self, restore: RestoreMode) -> Self {
        self.restore = restore;
        self
    }

    pub fn with_prescale(mut self, prescale: u32) -> Self {
        self.prescale = prescale;
        self
    }

    pub fn with_user(mut self, user: UserMode) -> Self {
        self.user = user;
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.select_mode = SelectMode::User;
        self.selector = Some(selector);
        self
    }

    /// Validates the configuration against the system limits and
    /// returns it with the cue clamped to the event count.
    pub fn check(&self, system: &SystemConfig) -> Result<StationConfig> {
        let mut config = self.clone();
        if config.select_mode.distributes() {
            if config.flow != FlowMode::Parallel {
                return Err(Error::InvalidConfig(
                    "round-robin and equal-cue stations must be parallel".into(),
                ));
            }
            if config.block != BlockMode::Blocking {
                return Err(Error::InvalidConfig(
                    "round-robin and equal-cue stations must be blocking".into(),
                ));
            }
            if config.prescale != 1 {
                return Err(Error::InvalidConfig(
                    "round-robin and equal-cue stations need prescale 1".into(),
                ));
            }
            if config.restore == RestoreMode::In {
                return Err(Error::InvalidConfig(
                    "round-robin and equal-cue stations cannot restore to input".into(),
                ));
            }
        }
        if config.restore == RestoreMode::Redistribute && config.flow != FlowMode::Parallel {
            return Err(Error::InvalidConfig(
                "redistribute restore mode requires a parallel station".into(),
            ));
        }
        match config.block {
            BlockMode::Blocking => {
                if config.prescale == 0 {
                    return Err(Error::InvalidConfig("prescale must be at least 1".into()));
                }
            }
            BlockMode::NonBlocking => {
                if config.cue == 0 {
                    return Err(Error::InvalidConfig("cue must be at least 1".into()));
                }
                config.cue = config.cue.min(system.events);
            }
        }
        if config.select_mode == SelectMode::User && config.selector.is_none() {
            return Err(Error::InvalidConfig("user selection needs a selector".into()));
        }
        if let Some(cap) = config.user.cap() {
            if cap == 0 || cap > system.max_attachments {
                return Err(Error::InvalidConfig(format!(
                    "user cap {cap} outside 1..={}",
                    system.max_attachments
                )));
            }
        }
        Ok(config)
    }

    /// Whether `self`, the head of a parallel group, admits `member`.
    pub fn admits_parallel(&self, member: &StationConfig) -> Result<()> {
        if self.flow != member.flow {
            return Err(Error::InvalidConfig(
                "parallel group members must all be parallel".into(),
            ));
        }
        if self.select_mode.distributes() {
            if member.select_mode != self.select_mode {
                return Err(Error::InvalidConfig(
                    "members of a distributing group need the same select mode".into(),
                ));
            }
            if member.block != self.block || member.prescale != self.prescale {
                return Err(Error::InvalidConfig(
                    "members of a distributing group need the same block mode and prescale".into(),
                ));
            }
        } else if member.select_mode.distributes() {
            return Err(Error::InvalidConfig(
                "a non-distributing group cannot take round-robin or equal-cue members".into(),
            ));
        }
        Ok(())
    }

    /// Two definitions are the same when every field agrees. Stations
    /// selecting through a callback are never considered the same.
    pub fn same_definition(&self, other: &StationConfig) -> bool {
        self.select_mode != SelectMode::User
            && self.flow == other.flow
            && self.user == other.user
            && self.block == other.block
            && self.select_mode == other.select_mode
            && self.restore == other.restore
            && self.prescale == other.prescale
            && self.cue == other.cue
            && self.select == other.select
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
