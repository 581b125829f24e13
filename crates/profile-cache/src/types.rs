//! Identifiers shared by the local store, the coordination backend and the coordinator.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, SecondsFormat};
use data_encoding::BASE32;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of samples an aggregated profile was built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    CpuSampleWork,
    ThreadSampleWork,
    MonitorContentionWork,
    MonitorWaitWork,
}

impl WorkType {
    /// Whether derived views can be built for profiles of this work type.
    ///
    /// Only CPU samples have a view building path at the moment.
    pub fn supports_views(self) -> bool {
        matches!(self, WorkType::CpuSampleWork)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkType::CpuSampleWork => "cpu_sample_work",
            WorkType::ThreadSampleWork => "thread_sample_work",
            WorkType::MonitorContentionWork => "monitor_contention_work",
            WorkType::MonitorWaitWork => "monitor_wait_work",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkType {
    type Err = ProfileKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cpu_sample_work" => WorkType::CpuSampleWork,
            "thread_sample_work" => WorkType::ThreadSampleWork,
            "monitor_contention_work" => WorkType::MonitorContentionWork,
            "monitor_wait_work" => WorkType::MonitorWaitWork,
            other => return Err(ProfileKeyParseError::UnknownWorkType(other.to_owned())),
        })
    }
}

/// An error parsing the string form of a [`ProfileKey`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProfileKeyParseError {
    #[error("profile key has {0} segments, expected at least 8")]
    MissingSegments(usize),
    #[error("invalid version segment `{0}`")]
    InvalidVersion(String),
    #[error("segment `{0}` is not valid base32 encoded utf-8")]
    InvalidEncoding(String),
    #[error("invalid start time `{0}`")]
    InvalidStart(String),
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),
    #[error("unknown work type `{0}`")]
    UnknownWorkType(String),
}

/// Identifies one aggregated profiling window.
///
/// The string form doubles as the storage location of the aggregated profile:
///
/// ```text
/// profiles/v0001/MZXW6===/MJQXE===/NVQWS3Q=/2017-01-20T12:37:20.551+05:30/1500/cpu_sample_work
/// ```
///
/// App, cluster and process names are base32 encoded so that arbitrary characters are safe as
/// path segments.
///
/// Two keys are equal iff their string forms are equal. The start time is compared with
/// millisecond precision and including its UTC offset, so the same instant written with
/// different offsets names two different profiles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileKey {
    pub base_dir: String,
    pub version: u32,
    pub app: String,
    pub cluster: String,
    pub proc: String,
    pub start: DateTime<FixedOffset>,
    /// Length of the aggregation window in seconds.
    pub duration: u32,
    pub work_type: WorkType,
}

impl ProfileKey {
    /// The segment under which the residency of this profile is recorded in the coordination
    /// service.
    pub fn coordination_segment(&self) -> String {
        BASE32.encode(self.to_string().as_bytes())
    }

    /// Parses a key back from its [`coordination_segment`](Self::coordination_segment).
    pub fn from_coordination_segment(segment: &str) -> Result<Self, ProfileKeyParseError> {
        decode_segment(segment)?.parse()
    }

    /// The start time as it appears in the string form: milliseconds and the offset.
    fn start_identity(&self) -> (i64, i32) {
        (
            self.start.timestamp_millis(),
            self.start.offset().local_minus_utc(),
        )
    }
}

impl PartialEq for ProfileKey {
    fn eq(&self, other: &Self) -> bool {
        self.base_dir == other.base_dir
            && self.version == other.version
            && self.app == other.app
            && self.cluster == other.cluster
            && self.proc == other.proc
            && self.start_identity() == other.start_identity()
            && self.duration == other.duration
            && self.work_type == other.work_type
    }
}

impl Eq for ProfileKey {}

impl Hash for ProfileKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base_dir.hash(state);
        self.version.hash(state);
        self.app.hash(state);
        self.cluster.hash(state);
        self.proc.hash(state);
        self.start_identity().hash(state);
        self.duration.hash(state);
        self.work_type.hash(state);
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/v{:04}/{}/{}/{}/{}/{}/{}",
            self.base_dir,
            self.version,
            BASE32.encode(self.app.as_bytes()),
            BASE32.encode(self.cluster.as_bytes()),
            BASE32.encode(self.proc.as_bytes()),
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.duration,
            self.work_type,
        )
    }
}

impl FromStr for ProfileKey {
    type Err = ProfileKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // the base dir may itself contain slashes, so split from the right
        let segments: Vec<&str> = s.rsplitn(8, '/').collect();
        let &[work_type, duration, start, proc, cluster, app, version, base_dir] =
            segments.as_slice()
        else {
            return Err(ProfileKeyParseError::MissingSegments(segments.len()));
        };

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProfileKeyParseError::InvalidVersion(version.to_owned()))?;
        let start = DateTime::parse_from_rfc3339(start)
            .ok()
            // the string form only carries milliseconds
            .filter(|parsed| parsed.timestamp_subsec_nanos() % 1_000_000 == 0)
            .ok_or_else(|| ProfileKeyParseError::InvalidStart(start.to_owned()))?;
        let duration = duration
            .parse()
            .map_err(|_| ProfileKeyParseError::InvalidDuration(duration.to_owned()))?;

        Ok(ProfileKey {
            base_dir: base_dir.to_owned(),
            version,
            app: decode_segment(app)?,
            cluster: decode_segment(cluster)?,
            proc: decode_segment(proc)?,
            start,
            duration,
            work_type: work_type.parse()?,
        })
    }
}

fn decode_segment(segment: &str) -> Result<String, ProfileKeyParseError> {
    BASE32
        .decode(segment.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| ProfileKeyParseError::InvalidEncoding(segment.to_owned()))
}

/// The kind of a view derived from a loaded profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    /// A call tree rooted at the trace.
    CallTree,
    /// An inverted tree of the hot methods within the trace.
    CalleesTree,
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKind::CallTree => f.write_str("callersView"),
            ViewKind::CalleesTree => f.write_str("calleesView"),
        }
    }
}

/// Identifies a view derived from the profile it depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub profile: ProfileKey,
    pub kind: ViewKind,
    pub trace: String,
}

impl ViewKey {
    pub fn new(profile: ProfileKey, kind: ViewKind, trace: impl Into<String>) -> Self {
        Self {
            profile,
            kind,
            trace: trace.into(),
        }
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.profile, self.trace, self.kind)
    }
}

/// The advertised `ip:port` identity of a query node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub ip: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
