//! # Protocol Data Types
//!
//! Value types carried inside requests and responses: node metadata, access
//! control entries, session credentials, watcher descriptors and the mode
//! bit-sets of the mutating requests.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Declares a closed `#[repr]` enum with checked conversion from its wire value.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $repr:ty as $label:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[repr($repr)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            pub const fn to_wire(self) -> $repr {
                self as $repr
            }
        }

        impl ::std::convert::TryFrom<$repr> for $name {
            type Error = $crate::error::ProtocolError;

            fn try_from(value: $repr) -> $crate::error::Result<Self> {
                match value {
                    $( v if v == $value => Ok($name::$variant), )*
                    other => Err($crate::error::ProtocolError::unknown($label, other)),
                }
            }
        }
    };
}

pub(crate) use wire_enum;

/// `Default` as the empty set for `bitflags!` types.
macro_rules! empty_default {
    ($($name:ident),* $(,)?) => {
        $(
            impl Default for $name {
                fn default() -> Self {
                    Self::empty()
                }
            }
        )*
    };
}

pub(crate) use empty_default;

/// Metadata describing a node's versions, sizes and timestamps.
///
/// The legacy `ephemeralOwner` field is written as zero and ignored on read,
/// so it has no representation here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stat {
    pub aversion: i32,
    pub cversion: i32,
    pub version: i32,
    pub num_children: i32,
    pub data_length: i32,
    pub czxid: i64,
    pub mzxid: i64,
    pub pzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
}

/// An identity: authentication scheme plus scheme-specific identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    pub scheme: String,
    pub identifier: String,
}

impl Id {
    pub fn new(scheme: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            identifier: identifier.into(),
        }
    }
}

bitflags! {
    /// ACL permission mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Perms: i32 {
        const NONE = 0;
        const CREATE = 1;
        const READ = 2;
        const WRITE = 4;
        const DELETE = 8;
        const ADMIN = 16;
        const ALL = 31;
    }
}

/// Access control entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    pub perms: Perms,
    pub id: Id,
}

impl Acl {
    pub fn new(perms: Perms, id: Id) -> Self {
        Self { perms, id }
    }
}

/// Credentials attached to a request by the session that issued it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionAuth {
    pub is_super_session: bool,
    pub client_ip: Option<String>,
    pub client_digest: Option<String>,
    pub client_identity: Option<String>,
}

/// Transaction id and time forced onto a request by a privileged caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationOverrides {
    pub tx_id: u64,
    pub tx_time: u64,
}

bitflags! {
    /// Node creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CreateMode: u16 {
        const PERSISTENT = 0x00;
        const EPHEMERAL = 0x01;
        const SEQUENTIAL = 0x02;
        const PERSISTENT_SEQUENTIAL = 0x02;
        const EPHEMERAL_SEQUENTIAL = 0x03;
        const ALLOW_PATH_CREATION = 0x1000;
        const SUCCESS_EVEN_IF_NODE_EXISTS = 0x2000;
    }
}

bitflags! {
    /// Node deletion flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DeleteMode: u16 {
        const NONE = 0;
        const CASCADE_DELETE = 1;
        const FAST_DELETE = 2;
        const SUCCESS_EVEN_IF_NODE_DOESNT_EXIST = 4;
    }
}

bitflags! {
    /// Node move flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MoveMode: u16 {
        const NONE = 0;
        const ONLY_IF_SOURCE_PATH_IS_EMPTY = 1;
        const ALLOW_PATH_CREATION = 0x1000;
    }
}

bitflags! {
    /// GetData behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct GetDataOptions: u8 {
        const NONE = 0;
        const FAULTBACK_ON_PARENT_DATA = 1;
        const NO_STAT_REQUIRED = 2;
        const NO_WILDCARDS_FOR_PATH = 4;
        const FAULTBACK_ON_PARENT_DATA_WITH_MATCH = 8;
    }
}

bitflags! {
    /// Watcher behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WatcherKind: u8 {
        const NONE = 0;
        const ONE_USE = 1;
        const INCLUDE_DATA = 2;
    }
}

empty_default!(Perms, CreateMode, DeleteMode, MoveMode, GetDataOptions, WatcherKind);

/// A watcher reference carried by Exists, GetData and GetChildren.
///
/// Id 0 is reserved for "no watcher" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Watcher {
    pub id: u64,
    pub kind: WatcherKind,
}

impl Watcher {
    pub fn new(id: u64, kind: WatcherKind) -> Self {
        Self { id, kind }
    }

    pub fn is_one_use(&self) -> bool {
        self.kind.contains(WatcherKind::ONE_USE)
    }
}

wire_enum! {
    /// What happened to a watched node.
    pub enum WatchedEventType: i32 as "WatchedEventType" {
        None = 0,
        NodeChildrenChanged = 1,
        NodeCreated = 2,
        NodeDataChanged = 3,
        NodeDeleted = 4,
        WatcherRemoved = 5,
    }
}

wire_enum! {
    /// Session state reported alongside a watched event.
    pub enum KeeperState: i32 as "KeeperState" {
        Unknown = 0,
        AuthFailed = 1,
        Disconnected = 2,
        Expired = 3,
        NoSyncConnected = 4,
        SyncConnected = 5,
    }
}

/// Notification delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub event_type: WatchedEventType,
    pub keeper_state: KeeperState,
    pub path: String,
    pub data: Option<Vec<u8>>,
    pub stat: Option<Stat>,
}

impl WatchedEvent {
    pub fn new(event_type: WatchedEventType, keeper_state: KeeperState, path: impl Into<String>) -> Self {
        Self {
            event_type,
            keeper_state,
            path: path.into(),
            data: None,
            stat: None,
        }
    }
}

/// Server-to-client envelope that routes a [`WatchedEvent`] to a watcher id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherCall {
    pub watcher_id: u64,
    pub kind: WatcherKind,
    pub event: Option<WatchedEvent>,
}

/// A hint that the client should reconnect elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedirectSuggested {
    pub suggested_connection_string: Option<String>,
}

wire_enum! {
    /// How a server that is not the primary handles an Init.
    pub enum RedirectionPolicy: u8 as "RedirectionPolicy" {
        ServerDefault = 0,
        RedirectPreferred = 1,
        ForwardPreferred = 2,
    }
}

wire_enum! {
    /// Comparison applied by a GetData match argument.
    pub enum Comparison: u8 as "Comparison" {
        Equals = 0,
        Different = 1,
        Greater = 2,
        Smaller = 3,
    }
}

/// Argument of `GetDataOptions::FAULTBACK_ON_PARENT_DATA_WITH_MATCH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchArgument {
    pub comparison: Comparison,
    pub position: i32,
    pub bytes: Option<Vec<u8>>,
}

impl MatchArgument {
    /// The argument the decoder substitutes when the options byte is exactly
    /// `FAULTBACK_ON_PARENT_DATA`.
    pub fn faultback_on_parent_data() -> Self {
        Self {
            comparison: Comparison::Different,
            position: 0,
            bytes: None,
        }
    }
}

/// Check-request incarnation id, tagged by how it was minted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniqueIncarnation {
    #[default]
    None,
    Simple(crate::core::primitives::Guid),
    Extended(crate::core::primitives::Guid),
}

impl UniqueIncarnation {
    pub const fn kind_byte(&self) -> u8 {
        match self {
            UniqueIncarnation::None => 0,
            UniqueIncarnation::Simple(_) => 1,
            UniqueIncarnation::Extended(_) => 2,
        }
    }
}
