//! Wire messages.
//!
//! Each direction is a sum type. The method id is the tag on the wire and
//! the variant's payload is the JSON body; decoding happens once, at the
//! transport boundary.

use super::codec::encode_frame;
use super::TransportError;
use crate::catalog::{ServiceSetting, Setting};
use crate::job::{AddMode, Job, JobId, JobState};
use crate::profile::{AutoSelectProfile, Profile};
use crate::store::{CheckLogItem, LogItem};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Method identifiers, shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MethodId {
    AddQueue = 1,
    ChangeItem = 2,
    PauseEncode = 3,
    CancelAddQueue = 4,
    SetCommonData = 5,
    SetServiceSetting = 6,
    SetProfile = 7,
    SetAutoSelect = 8,
    Request = 9,
    RequestLogFile = 10,
    EndServer = 11,

    OnUiData = 101,
    OnConsoleUpdate = 102,
    OnOperationResult = 103,
    OnAddResult = 104,
    OnCommonData = 105,
    OnProfile = 106,
    OnAutoSelect = 107,
    OnServiceSetting = 108,
    OnLogFile = 109,
}

impl TryFrom<u16> for MethodId {
    type Error = TransportError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use MethodId::*;
        Ok(match value {
            1 => AddQueue,
            2 => ChangeItem,
            3 => PauseEncode,
            4 => CancelAddQueue,
            5 => SetCommonData,
            6 => SetServiceSetting,
            7 => SetProfile,
            8 => SetAutoSelect,
            9 => Request,
            10 => RequestLogFile,
            11 => EndServer,
            101 => OnUiData,
            102 => OnConsoleUpdate,
            103 => OnOperationResult,
            104 => OnAddResult,
            105 => OnCommonData,
            106 => OnProfile,
            107 => OnAutoSelect,
            108 => OnServiceSetting,
            109 => OnLogFile,
            other => return Err(TransportError::UnknownMethod(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Client -> server payloads

/// A source declared explicitly by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddTarget {
    pub path: PathBuf,
    /// SHA-256 hex computed by the sender.
    #[serde(default)]
    pub hash: Option<String>,
}

/// A requested output: one job per program per output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputInfo {
    pub dst_dir: PathBuf,
    pub profile: String,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddQueueRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    /// Directory to scan when `targets` is empty.
    #[serde(default)]
    pub dir_path: Option<PathBuf>,
    #[serde(default)]
    pub targets: Vec<AddTarget>,
    #[serde(default)]
    pub outputs: Vec<OutputInfo>,
    #[serde(default)]
    pub mode: AddMode,
    /// Hook script name run for every derived job.
    #[serde(default)]
    pub add_hook: Option<String>,
    /// Sources live on a network share.
    #[serde(default)]
    pub remote: bool,
}

/// Operation applied by `ChangeItem`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    Retry,
    UpdateProfile,
    Duplicate,
    Cancel,
    Priority { priority: u8 },
    Profile { profile: String },
    RemoveItem,
    RemoveCompleted,
    ForceStart,
    RemoveSourceFile,
    Move { position: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeItemData {
    #[serde(default)]
    pub request_id: Option<String>,
    /// Ignored by `RemoveCompleted`.
    #[serde(default)]
    pub item_id: JobId,
    pub change: ChangeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PauseRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    /// Queue-level pause when true, otherwise worker suspend.
    pub is_queue: bool,
    /// Worker index for suspend; -1 means every worker.
    #[serde(default = "all_workers")]
    pub index: i32,
    pub pause: bool,
}

fn all_workers() -> i32 {
    -1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CancelAddRequest {
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSettingUpdate {
    pub kind: UpdateKind,
    pub service_id: i32,
    #[serde(default)]
    pub data: Option<ServiceSetting>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileUpdate {
    pub kind: UpdateKind,
    pub profile: Profile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoSelectUpdate {
    pub kind: UpdateKind,
    pub auto_select: AutoSelectProfile,
}

/// Data categories a client can ask to be resent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RequestFlags(pub u32);

impl RequestFlags {
    pub const SETTING: Self = Self(1);
    pub const QUEUE: Self = Self(1 << 1);
    pub const LOG: Self = Self(1 << 2);
    pub const CHECK_LOG: Self = Self(1 << 3);
    pub const CONSOLE: Self = Self(1 << 4);
    pub const STATE: Self = Self(1 << 5);
    pub const FREE_SPACE: Self = Self(1 << 6);
    pub const SERVICE_SETTING: Self = Self(1 << 7);
    pub const ALL: Self = Self((1 << 8) - 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogFileRequest {
    /// Transcript file name from a log record.
    pub name: String,
}

// ---------------------------------------------------------------------------
// Server -> client payloads

/// Scheduler state as shown to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateReport {
    pub queue_paused: bool,
    pub suspended: bool,
    pub encoder_suspended: Vec<bool>,
    pub scheduled_suspend: bool,
    pub running: bool,
    pub parallelism: u32,
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueUpdateKind {
    Add,
    Remove,
    Update,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueUpdate {
    pub kind: QueueUpdateKind,
    pub item: Job,
    /// New rank, for `Move`.
    #[serde(default)]
    pub position: Option<usize>,
}

/// Buffered console of one worker (index -1 is the add console).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleSnapshot {
    pub index: i32,
    pub data: Vec<u8>,
}

/// Queue/log/state data; each message sets the fields it carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UiData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<Vec<Job>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_update: Option<QueueUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<LogItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_item: Option<LogItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_log: Option<Vec<CheckLogItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_log_item: Option<CheckLogItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<Vec<ConsoleSnapshot>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleUpdate {
    pub index: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationResult {
    pub time: DateTime<Utc>,
    pub is_failed: bool,
    pub message: String,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            is_failed: false,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            is_failed: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddResult {
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskInfo {
    pub mount_point: PathBuf,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommonData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting: Option<Setting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<DiskInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<Profile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_selects: Option<Vec<AutoSelectProfile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceSetting>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogFileContent {
    pub name: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Envelopes

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    AddQueue(AddQueueRequest),
    ChangeItem(ChangeItemData),
    PauseEncode(PauseRequest),
    CancelAddQueue(CancelAddRequest),
    SetCommonData(Setting),
    SetServiceSetting(ServiceSettingUpdate),
    SetProfile(ProfileUpdate),
    SetAutoSelect(AutoSelectUpdate),
    Request(RequestFlags),
    RequestLogFile(LogFileRequest),
    EndServer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    OnUiData(UiData),
    OnConsoleUpdate(ConsoleUpdate),
    OnOperationResult(OperationResult),
    OnAddResult(AddResult),
    OnCommonData(CommonData),
    OnProfile(ProfileUpdate),
    OnAutoSelect(AutoSelectUpdate),
    OnServiceSetting(ServiceSettingUpdate),
    OnLogFile(LogFileContent),
}

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(serde_json::to_vec(value)?)
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(payload)?)
}

impl ClientMessage {
    pub fn method(&self) -> MethodId {
        match self {
            ClientMessage::AddQueue(_) => MethodId::AddQueue,
            ClientMessage::ChangeItem(_) => MethodId::ChangeItem,
            ClientMessage::PauseEncode(_) => MethodId::PauseEncode,
            ClientMessage::CancelAddQueue(_) => MethodId::CancelAddQueue,
            ClientMessage::SetCommonData(_) => MethodId::SetCommonData,
            ClientMessage::SetServiceSetting(_) => MethodId::SetServiceSetting,
            ClientMessage::SetProfile(_) => MethodId::SetProfile,
            ClientMessage::SetAutoSelect(_) => MethodId::SetAutoSelect,
            ClientMessage::Request(_) => MethodId::Request,
            ClientMessage::RequestLogFile(_) => MethodId::RequestLogFile,
            ClientMessage::EndServer => MethodId::EndServer,
        }
    }

    /// Serialize into a complete frame.
    pub fn to_frame(&self) -> Result<Bytes, TransportError> {
        let payload = match self {
            ClientMessage::AddQueue(v) => body(v)?,
            ClientMessage::ChangeItem(v) => body(v)?,
            ClientMessage::PauseEncode(v) => body(v)?,
            ClientMessage::CancelAddQueue(v) => body(v)?,
            ClientMessage::SetCommonData(v) => body(v)?,
            ClientMessage::SetServiceSetting(v) => body(v)?,
            ClientMessage::SetProfile(v) => body(v)?,
            ClientMessage::SetAutoSelect(v) => body(v)?,
            ClientMessage::Request(v) => body(v)?,
            ClientMessage::RequestLogFile(v) => body(v)?,
            ClientMessage::EndServer => body(&())?,
        };
        encode_frame(self.method() as u16, &payload)
    }

    pub fn decode(method: u16, payload: &[u8]) -> Result<Self, TransportError> {
        Ok(match MethodId::try_from(method)? {
            MethodId::AddQueue => ClientMessage::AddQueue(parse(payload)?),
            MethodId::ChangeItem => ClientMessage::ChangeItem(parse(payload)?),
            MethodId::PauseEncode => ClientMessage::PauseEncode(parse(payload)?),
            MethodId::CancelAddQueue => ClientMessage::CancelAddQueue(parse(payload)?),
            MethodId::SetCommonData => ClientMessage::SetCommonData(parse(payload)?),
            MethodId::SetServiceSetting => ClientMessage::SetServiceSetting(parse(payload)?),
            MethodId::SetProfile => ClientMessage::SetProfile(parse(payload)?),
            MethodId::SetAutoSelect => ClientMessage::SetAutoSelect(parse(payload)?),
            MethodId::Request => ClientMessage::Request(parse(payload)?),
            MethodId::RequestLogFile => ClientMessage::RequestLogFile(parse(payload)?),
            MethodId::EndServer => ClientMessage::EndServer,
            other => return Err(TransportError::WrongDirection(other as u16)),
        })
    }

    /// Correlation id echoed back in `OnAddResult`, if the command has one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::AddQueue(r) => r.request_id.as_deref(),
            ClientMessage::ChangeItem(r) => r.request_id.as_deref(),
            ClientMessage::PauseEncode(r) => r.request_id.as_deref(),
            ClientMessage::CancelAddQueue(r) => r.request_id.as_deref(),
            _ => None,
        }
    }
}

impl ServerMessage {
    pub fn method(&self) -> MethodId {
        match self {
            ServerMessage::OnUiData(_) => MethodId::OnUiData,
            ServerMessage::OnConsoleUpdate(_) => MethodId::OnConsoleUpdate,
            ServerMessage::OnOperationResult(_) => MethodId::OnOperationResult,
            ServerMessage::OnAddResult(_) => MethodId::OnAddResult,
            ServerMessage::OnCommonData(_) => MethodId::OnCommonData,
            ServerMessage::OnProfile(_) => MethodId::OnProfile,
            ServerMessage::OnAutoSelect(_) => MethodId::OnAutoSelect,
            ServerMessage::OnServiceSetting(_) => MethodId::OnServiceSetting,
            ServerMessage::OnLogFile(_) => MethodId::OnLogFile,
        }
    }

    pub fn to_frame(&self) -> Result<Bytes, TransportError> {
        let payload = match self {
            ServerMessage::OnUiData(v) => body(v)?,
            ServerMessage::OnConsoleUpdate(v) => body(v)?,
            ServerMessage::OnOperationResult(v) => body(v)?,
            ServerMessage::OnAddResult(v) => body(v)?,
            ServerMessage::OnCommonData(v) => body(v)?,
            ServerMessage::OnProfile(v) => body(v)?,
            ServerMessage::OnAutoSelect(v) => body(v)?,
            ServerMessage::OnServiceSetting(v) => body(v)?,
            ServerMessage::OnLogFile(v) => body(v)?,
        };
        encode_frame(self.method() as u16, &payload)
    }

    pub fn decode(method: u16, payload: &[u8]) -> Result<Self, TransportError> {
        Ok(match MethodId::try_from(method)? {
            MethodId::OnUiData => ServerMessage::OnUiData(parse(payload)?),
            MethodId::OnConsoleUpdate => ServerMessage::OnConsoleUpdate(parse(payload)?),
            MethodId::OnOperationResult => ServerMessage::OnOperationResult(parse(payload)?),
            MethodId::OnAddResult => ServerMessage::OnAddResult(parse(payload)?),
            MethodId::OnCommonData => ServerMessage::OnCommonData(parse(payload)?),
            MethodId::OnProfile => ServerMessage::OnProfile(parse(payload)?),
            MethodId::OnAutoSelect => ServerMessage::OnAutoSelect(parse(payload)?),
            MethodId::OnServiceSetting => ServerMessage::OnServiceSetting(parse(payload)?),
            MethodId::OnLogFile => ServerMessage::OnLogFile(parse(payload)?),
            other => return Err(TransportError::WrongDirection(other as u16)),
        })
    }

    pub fn queue_update(kind: QueueUpdateKind, item: &Job, position: Option<usize>) -> Self {
        ServerMessage::OnUiData(UiData {
            queue_update: Some(QueueUpdate {
                kind,
                item: item.clone(),
                position,
            }),
            ..UiData::default()
        })
    }

    pub fn state(report: StateReport) -> Self {
        ServerMessage::OnUiData(UiData {
            state: Some(report),
            ..UiData::default()
        })
    }

    pub fn operation_ok(message: impl Into<String>) -> Self {
        ServerMessage::OnOperationResult(OperationResult::ok(message))
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        ServerMessage::OnOperationResult(OperationResult::failed(message))
    }

    pub fn add_result(request_id: Option<String>) -> Self {
        ServerMessage::OnAddResult(AddResult { request_id })
    }

    /// Job state carried by a queue delta, if this is one.
    pub fn queue_state(&self) -> Option<(JobId, JobState)> {
        match self {
            ServerMessage::OnUiData(UiData {
                queue_update: Some(u),
                ..
            }) => Some((u.item.id, u.item.state)),
            _ => None,
        }
    }
}
