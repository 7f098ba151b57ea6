//! # Response Model
//!
//! A [`RequestResponse`] carries a result code, an optional path and stat, and
//! a [`Content`] payload tagged on the wire by a [`ContentType`] byte.
//!
//! ```text
//! [ResultCode: i32] [ResponsePath?] [Stat?] [ContentType: u8] [Content...]
//! ```
//!
//! Callers pick the content variant explicitly; nothing is inferred from the
//! runtime shape of the payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::request::Request;
use crate::protocol::types::{wire_enum, Acl, RedirectSuggested, Stat, WatcherCall};

wire_enum! {
    /// Result codes, in declaration order.
    pub enum RingMasterResultCode: i32 as "RingMasterResultCode" {
        ApiError = 0,
        AuthFailed = 1,
        BadArguments = 2,
        BadVersion = 3,
        ConnectionLoss = 4,
        DataInconsistency = 5,
        InvalidAcl = 6,
        InvalidCallback = 7,
        MarshallingError = 8,
        NoAuth = 9,
        NoChildrenForEphemerals = 10,
        NodeExists = 11,
        NoNode = 12,
        NotEmpty = 13,
        Ok = 14,
        OperationTimeout = 15,
        RuntimeInconsistency = 16,
        SessionExpired = 17,
        SessionMoved = 18,
        SystemError = 19,
        Unimplemented = 20,
        Unknown = 21,
        TransactionNotAgreed = 22,
        WaitQueueTimeoutOnServer = 23,
        InLockDown = 24,
        TooManyChildren = 25,
        OperationCancelled = 26,
        ServerOperationTimeout = 27,
    }
}

impl RingMasterResultCode {
    /// Codes a client may retry after reconnecting.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            RingMasterResultCode::ConnectionLoss | RingMasterResultCode::OperationTimeout
        )
    }
}

wire_enum! {
    /// Operation result discriminant inside an op-result list.
    pub enum OpCode: i32 as "OpCode" {
        Error = -1,
        Create = 1,
        Delete = 2,
        GetData = 4,
        SetData = 5,
        SetAcl = 7,
        Check = 13,
        Multi = 14,
        Move = 20,
    }
}

/// Outcome of one sub-request of a Multi or Batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResult {
    Check,
    /// `path` is on the wire from v14; older decoders produce an empty string.
    GetData {
        stat: Option<Stat>,
        bytes: Option<Vec<u8>>,
        path: Option<String>,
    },
    Delete,
    /// Below v22 a `None` path is written as an empty string.
    Create {
        stat: Option<Stat>,
        path: Option<String>,
    },
    Move {
        stat: Option<Stat>,
        dst_path: String,
    },
    Error {
        result_code: i32,
    },
    SetData {
        stat: Option<Stat>,
    },
    SetAcl {
        stat: Option<Stat>,
    },
    Multi {
        results: Option<Vec<OpResult>>,
    },
}

impl OpResult {
    pub fn op_code(&self) -> OpCode {
        match self {
            OpResult::Check => OpCode::Check,
            OpResult::GetData { .. } => OpCode::GetData,
            OpResult::Delete => OpCode::Delete,
            OpResult::Create { .. } => OpCode::Create,
            OpResult::Move { .. } => OpCode::Move,
            OpResult::Error { .. } => OpCode::Error,
            OpResult::SetData { .. } => OpCode::SetData,
            OpResult::SetAcl { .. } => OpCode::SetAcl,
            OpResult::Multi { .. } => OpCode::Multi,
        }
    }
}

wire_enum! {
    /// Content payload discriminant. `Unknown` is never written and always
    /// rejected when read.
    pub enum ContentType: u8 as "ContentType" {
        Unknown = 0,
        Request = 1,
        WatcherCall = 2,
        StringArray = 3,
        ListOfString = 4,
        String = 5,
        Stat = 6,
        ByteArray = 7,
        AclList = 8,
        OpResultList = 9,
        Redirect = 10,
        AnyObject = 255,
    }
}

/// Produces content on demand at serialize time.
pub type ContentProducer = Box<dyn FnOnce() -> Content + Send>;

/// Response payload. Each variant maps to exactly one [`ContentType`].
#[derive(Default)]
pub enum Content {
    /// No content. Written as a null opaque object.
    #[default]
    Empty,
    Request(Box<Request>),
    WatcherCall(WatcherCall),
    StringArray(Vec<String>),
    ListOfString(Vec<String>),
    String(String),
    Stat(Stat),
    ByteArray(Vec<u8>),
    AclList(Vec<Acl>),
    OpResultList(Vec<OpResult>),
    Redirect(RedirectSuggested),
    /// Bytes produced by an [`OpaqueCodec`](crate::protocol::opaque::OpaqueCodec).
    AnyObject(Vec<u8>),
    /// Materialized and re-dispatched when serialized. Never produced by the
    /// deserializer.
    Deferred(ContentProducer),
}

impl Content {
    /// The tag that will be written for this content, or `None` for
    /// [`Content::Deferred`], whose tag is only known once it runs.
    pub fn content_type(&self) -> Option<ContentType> {
        Some(match self {
            Content::Empty | Content::AnyObject(_) => ContentType::AnyObject,
            Content::Request(_) => ContentType::Request,
            Content::WatcherCall(_) => ContentType::WatcherCall,
            Content::StringArray(_) => ContentType::StringArray,
            Content::ListOfString(_) => ContentType::ListOfString,
            Content::String(_) => ContentType::String,
            Content::Stat(_) => ContentType::Stat,
            Content::ByteArray(_) => ContentType::ByteArray,
            Content::AclList(_) => ContentType::AclList,
            Content::OpResultList(_) => ContentType::OpResultList,
            Content::Redirect(_) => ContentType::Redirect,
            Content::Deferred(_) => return None,
        })
    }

    pub fn deferred<F>(producer: F) -> Self
    where
        F: FnOnce() -> Content + Send + 'static,
    {
        Content::Deferred(Box::new(producer))
    }

    /// Run deferred producers until a concrete variant remains.
    pub fn materialize(self) -> Content {
        let mut content = self;
        while let Content::Deferred(producer) = content {
            content = producer();
        }
        content
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Content::Empty)
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Empty => f.write_str("Empty"),
            Content::Request(r) => f.debug_tuple("Request").field(r).finish(),
            Content::WatcherCall(w) => f.debug_tuple("WatcherCall").field(w).finish(),
            Content::StringArray(v) => f.debug_tuple("StringArray").field(v).finish(),
            Content::ListOfString(v) => f.debug_tuple("ListOfString").field(v).finish(),
            Content::String(s) => f.debug_tuple("String").field(s).finish(),
            Content::Stat(s) => f.debug_tuple("Stat").field(s).finish(),
            Content::ByteArray(b) => f.debug_tuple("ByteArray").field(&b.len()).finish(),
            Content::AclList(a) => f.debug_tuple("AclList").field(a).finish(),
            Content::OpResultList(r) => f.debug_tuple("OpResultList").field(r).finish(),
            Content::Redirect(r) => f.debug_tuple("Redirect").field(r).finish(),
            Content::AnyObject(b) => f.debug_tuple("AnyObject").field(&b.len()).finish(),
            Content::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Deferred content never compares equal; everything else compares by value.
impl PartialEq for Content {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Content::Empty, Content::Empty) => true,
            (Content::Request(a), Content::Request(b)) => a == b,
            (Content::WatcherCall(a), Content::WatcherCall(b)) => a == b,
            (Content::StringArray(a), Content::StringArray(b)) => a == b,
            (Content::ListOfString(a), Content::ListOfString(b)) => a == b,
            (Content::String(a), Content::String(b)) => a == b,
            (Content::Stat(a), Content::Stat(b)) => a == b,
            (Content::ByteArray(a), Content::ByteArray(b)) => a == b,
            (Content::AclList(a), Content::AclList(b)) => a == b,
            (Content::OpResultList(a), Content::OpResultList(b)) => a == b,
            (Content::Redirect(a), Content::Redirect(b)) => a == b,
            (Content::AnyObject(a), Content::AnyObject(b)) => a == b,
            _ => false,
        }
    }
}

/// Response envelope, matched to its [`RequestCall`](crate::protocol::request::RequestCall)
/// by `call_id`.
#[derive(Debug, PartialEq)]
pub struct RequestResponse {
    pub call_id: u64,
    pub result_code: i32,
    pub response_path: Option<String>,
    pub stat: Option<Stat>,
    pub content: Content,
}

impl RequestResponse {
    pub fn new(call_id: u64, result_code: RingMasterResultCode) -> Self {
        Self {
            call_id,
            result_code: result_code.to_wire(),
            response_path: None,
            stat: None,
            content: Content::Empty,
        }
    }

    pub fn ok(call_id: u64, content: Content) -> Self {
        Self::new(call_id, RingMasterResultCode::Ok).with_content(content)
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    pub fn with_stat(mut self, stat: Stat) -> Self {
        self.stat = Some(stat);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.response_path = Some(path.into());
        self
    }

    /// The typed result code, if the raw value is one this crate knows.
    pub fn code(&self) -> Option<RingMasterResultCode> {
        RingMasterResultCode::try_from(self.result_code).ok()
    }

    pub fn is_ok(&self) -> bool {
        self.result_code == RingMasterResultCode::Ok.to_wire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_values() {
        assert_eq!(RingMasterResultCode::Ok.to_wire(), 14);
        assert_eq!(RingMasterResultCode::NoNode.to_wire(), 12);
        assert!(RingMasterResultCode::ConnectionLoss.is_retriable());
        assert!(!RingMasterResultCode::NodeExists.is_retriable());
        assert!(RingMasterResultCode::try_from(28).is_err());
    }

    #[test]
    fn test_deferred_content_materializes_recursively() {
        let content = Content::deferred(|| Content::deferred(|| Content::String("late".into())));
        assert_eq!(content.content_type(), None);
        let content = content.materialize();
        assert_eq!(content, Content::String("late".into()));
        assert_eq!(content.content_type(), Some(ContentType::String));
    }

    #[test]
    fn test_empty_content_is_tagged_as_opaque() {
        assert_eq!(Content::Empty.content_type(), Some(ContentType::AnyObject));
        assert!(RequestResponse::new(7, RingMasterResultCode::Ok).is_ok());
    }
}
