//! # Request Model
//!
//! A [`Request`] is a shared preamble plus one [`RequestKind`] payload. The
//! kind's discriminant on the wire is [`RingMasterRequestType`].
//!
//! ```text
//! [Type: u16] [Uid: u64] [Path: String] [Auth?] [Overrides?]
//! [ExecutionQueue? (v17+)] [TimeStreamId (v21+)] [Payload...]
//! ```

use serde::{Deserialize, Serialize};

use crate::core::primitives::Guid;
use crate::protocol::types::{
    wire_enum, Acl, CreateMode, DeleteMode, GetDataOptions, MatchArgument, MoveMode,
    OperationOverrides, RedirectionPolicy, SessionAuth, Stat, UniqueIncarnation, Watcher,
};

wire_enum! {
    /// Request discriminant. Values 0 (None), 14 (Nested) and 17 (InternalRun)
    /// are reserved and never appear on the wire.
    pub enum RingMasterRequestType: u16 as "RingMasterRequestType" {
        Init = 1,
        Create = 2,
        Delete = 3,
        Sync = 4,
        Exists = 5,
        GetAcl = 6,
        GetData = 7,
        GetChildren = 8,
        SetData = 9,
        SetAcl = 10,
        SetAuth = 11,
        Check = 12,
        Multi = 13,
        Batch = 15,
        Move = 16,
    }
}

/// Envelope for one outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCall {
    pub call_id: u64,
    pub request: Request,
}

impl RequestCall {
    pub fn new(call_id: u64, request: Request) -> Self {
        Self { call_id, request }
    }
}

/// A request: common preamble fields plus a variant payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub uid: u64,
    pub path: String,
    pub auth: Option<SessionAuth>,
    pub overrides: Option<OperationOverrides>,
    /// Written only when not empty, from v17.
    pub execution_queue_id: Guid,
    pub execution_queue_timeout_millis: i32,
    /// Written from v21.
    pub time_stream_id: u64,
    pub kind: RequestKind,
}

/// Variant payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Init {
        session_id: u64,
        session_password: String,
        read_only_interface_requires_locks: bool,
        redirection: RedirectionPolicy,
    },
    SetAuth {
        client_id: String,
    },
    Create {
        mode: CreateMode,
        data: Option<Vec<u8>>,
        acl: Option<Vec<Acl>>,
    },
    Delete {
        version: i32,
        mode: DeleteMode,
    },
    Move {
        version: i32,
        path_dst: String,
        mode: MoveMode,
    },
    Check {
        version: i32,
        cversion: i32,
        aversion: i32,
        unique_incarnation: UniqueIncarnation,
    },
    Sync,
    Exists {
        watcher: Option<Watcher>,
    },
    GetAcl {
        stat: Option<Stat>,
    },
    GetData {
        watcher: Option<Watcher>,
        options: GetDataOptions,
        option_argument: Option<MatchArgument>,
    },
    GetChildren {
        watcher: Option<Watcher>,
        retrieval_condition: Option<String>,
    },
    SetData {
        version: i32,
        data: Option<Vec<u8>>,
        is_data_command: bool,
    },
    SetAcl {
        version: i32,
        acl: Option<Vec<Acl>>,
    },
    /// Sub-requests applied atomically.
    Multi {
        requests: Vec<Request>,
        complete_synchronously: bool,
        scheduled_name: Option<String>,
    },
    /// Sub-requests applied in order, non-atomically.
    Batch {
        requests: Vec<Request>,
        complete_synchronously: bool,
    },
}

impl RequestKind {
    pub fn request_type(&self) -> RingMasterRequestType {
        match self {
            RequestKind::Init { .. } => RingMasterRequestType::Init,
            RequestKind::SetAuth { .. } => RingMasterRequestType::SetAuth,
            RequestKind::Create { .. } => RingMasterRequestType::Create,
            RequestKind::Delete { .. } => RingMasterRequestType::Delete,
            RequestKind::Move { .. } => RingMasterRequestType::Move,
            RequestKind::Check { .. } => RingMasterRequestType::Check,
            RequestKind::Sync => RingMasterRequestType::Sync,
            RequestKind::Exists { .. } => RingMasterRequestType::Exists,
            RequestKind::GetAcl { .. } => RingMasterRequestType::GetAcl,
            RequestKind::GetData { .. } => RingMasterRequestType::GetData,
            RequestKind::GetChildren { .. } => RingMasterRequestType::GetChildren,
            RequestKind::SetData { .. } => RingMasterRequestType::SetData,
            RequestKind::SetAcl { .. } => RingMasterRequestType::SetAcl,
            RequestKind::Multi { .. } => RingMasterRequestType::Multi,
            RequestKind::Batch { .. } => RingMasterRequestType::Batch,
        }
    }
}

impl Request {
    /// A request with an empty preamble around `kind`.
    pub fn new(path: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            uid: 0,
            path: path.into(),
            auth: None,
            overrides: None,
            execution_queue_id: Guid::EMPTY,
            execution_queue_timeout_millis: 0,
            time_stream_id: 0,
            kind,
        }
    }

    pub fn request_type(&self) -> RingMasterRequestType {
        self.kind.request_type()
    }

    pub fn with_uid(mut self, uid: u64) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_auth(mut self, auth: SessionAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_overrides(mut self, overrides: OperationOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_execution_queue(mut self, id: Guid, timeout_millis: i32) -> Self {
        self.execution_queue_id = id;
        self.execution_queue_timeout_millis = timeout_millis;
        self
    }

    pub fn with_time_stream_id(mut self, id: u64) -> Self {
        self.time_stream_id = id;
        self
    }

    pub fn init(session_id: u64, session_password: impl Into<String>) -> Self {
        Self::new(
            "",
            RequestKind::Init {
                session_id,
                session_password: session_password.into(),
                read_only_interface_requires_locks: true,
                redirection: RedirectionPolicy::ServerDefault,
            },
        )
    }

    pub fn set_auth(client_id: impl Into<String>) -> Self {
        Self::new(
            "",
            RequestKind::SetAuth {
                client_id: client_id.into(),
            },
        )
    }

    pub fn create(
        path: impl Into<String>,
        data: Option<Vec<u8>>,
        acl: Option<Vec<Acl>>,
        mode: CreateMode,
    ) -> Self {
        Self::new(path, RequestKind::Create { mode, data, acl })
    }

    pub fn delete(path: impl Into<String>, version: i32, mode: DeleteMode) -> Self {
        Self::new(path, RequestKind::Delete { version, mode })
    }

    pub fn move_node(
        path: impl Into<String>,
        version: i32,
        path_dst: impl Into<String>,
        mode: MoveMode,
    ) -> Self {
        Self::new(
            path,
            RequestKind::Move {
                version,
                path_dst: path_dst.into(),
                mode,
            },
        )
    }

    pub fn check(path: impl Into<String>, version: i32) -> Self {
        Self::new(
            path,
            RequestKind::Check {
                version,
                cversion: -1,
                aversion: -1,
                unique_incarnation: UniqueIncarnation::None,
            },
        )
    }

    pub fn sync(path: impl Into<String>) -> Self {
        Self::new(path, RequestKind::Sync)
    }

    pub fn exists(path: impl Into<String>, watcher: Option<Watcher>) -> Self {
        Self::new(path, RequestKind::Exists { watcher })
    }

    pub fn get_acl(path: impl Into<String>, stat: Option<Stat>) -> Self {
        Self::new(path, RequestKind::GetAcl { stat })
    }

    pub fn get_data(path: impl Into<String>, options: GetDataOptions, watcher: Option<Watcher>) -> Self {
        Self::new(
            path,
            RequestKind::GetData {
                watcher,
                options,
                option_argument: None,
            },
        )
    }

    pub fn get_children(
        path: impl Into<String>,
        watcher: Option<Watcher>,
        retrieval_condition: Option<String>,
    ) -> Self {
        Self::new(
            path,
            RequestKind::GetChildren {
                watcher,
                retrieval_condition,
            },
        )
    }

    pub fn set_data(path: impl Into<String>, data: Option<Vec<u8>>, version: i32) -> Self {
        Self::new(
            path,
            RequestKind::SetData {
                version,
                data,
                is_data_command: false,
            },
        )
    }

    pub fn set_acl(path: impl Into<String>, acl: Option<Vec<Acl>>, version: i32) -> Self {
        Self::new(path, RequestKind::SetAcl { version, acl })
    }

    pub fn multi(requests: Vec<Request>, complete_synchronously: bool) -> Self {
        Self::new(
            "",
            RequestKind::Multi {
                requests,
                complete_synchronously,
                scheduled_name: None,
            },
        )
    }

    pub fn batch(requests: Vec<Request>, complete_synchronously: bool) -> Self {
        Self::new(
            "",
            RequestKind::Batch {
                requests,
                complete_synchronously,
            },
        )
    }

    /// Whether this request, or any nested sub-request, mutates the tree.
    pub fn is_read_only(&self) -> bool {
        match &self.kind {
            RequestKind::Exists { .. }
            | RequestKind::GetAcl { .. }
            | RequestKind::GetData { .. }
            | RequestKind::GetChildren { .. }
            | RequestKind::Sync
            | RequestKind::Check { .. } => true,
            RequestKind::Multi { requests, .. } | RequestKind::Batch { requests, .. } => {
                requests.iter().all(Request::is_read_only)
            }
            _ => false,
        }
    }
}
