//! # Deserializer
//!
//! Decoder mirroring [`Serializer`](crate::protocol::serializer::Serializer)
//! field for field. For every supported version, decoding what the serializer
//! produced at the same version yields an equal value, with fields that the
//! version cannot carry normalized:
//!
//! - Check `cversion`/`aversion` are `-1` below v16
//! - execution queue data is empty below v17, time stream id `0` below v21
//! - GetData carries no option argument below v14, and an options byte of
//!   exactly `FAULTBACK_ON_PARENT_DATA` decodes with a synthetic match argument
//! - watcher kinds collapse to `ONE_USE`/`NONE` and events lose data and stat
//!   below v23
//!
//! ## Safety
//! Every length is checked against the remaining input before allocation, and
//! nesting of Multi/Batch requests and op-result lists is bounded by
//! [`MAX_NESTING_DEPTH`].

use crate::core::primitives::WireReader;
use crate::core::version::{Feature, ProtocolVersion};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::request::{Request, RequestCall, RequestKind, RingMasterRequestType};
use crate::protocol::response::{Content, ContentType, OpCode, OpResult, RequestResponse};
use crate::protocol::serializer::{
    OPAQUE_NULL_MARKER, OPAQUE_VALUE_MARKER, REQUEST_CALL_MAGIC, REQUEST_RESPONSE_MAGIC,
};
use crate::protocol::types::{
    Acl, Comparison, CreateMode, DeleteMode, GetDataOptions, Id, KeeperState, MatchArgument,
    MoveMode, OperationOverrides, Perms, RedirectSuggested, RedirectionPolicy, SessionAuth, Stat,
    UniqueIncarnation, WatchedEvent, WatchedEventType, Watcher, WatcherCall, WatcherKind,
};

/// Deepest Multi/Batch or op-result nesting accepted from the wire.
pub const MAX_NESTING_DEPTH: usize = 64;

pub struct Deserializer<'a> {
    version: ProtocolVersion,
    reader: WireReader<'a>,
    depth: usize,
}

impl<'a> Deserializer<'a> {
    /// Fails with [`ProtocolError::VersionOutOfRange`] outside 13..=25.
    pub fn new(bytes: &'a [u8], version: u32) -> Result<Self> {
        Ok(Self {
            version: ProtocolVersion::new(version)?,
            reader: WireReader::new(bytes),
            depth: 0,
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn deserialize_request(mut self) -> Result<RequestCall> {
        if self.reader.read_u32()? != REQUEST_CALL_MAGIC {
            return Err(ProtocolError::format(constants::ERR_NOT_A_REQUEST));
        }
        let call_id = self.reader.read_u64()?;
        let request = self.read_request()?;
        Ok(RequestCall::new(call_id, request))
    }

    pub fn deserialize_response(mut self) -> Result<RequestResponse> {
        let magic = self.reader.read_u32()?;
        if magic != REQUEST_RESPONSE_MAGIC {
            return Err(ProtocolError::Format(format!(
                "{}: {magic:#x}",
                constants::ERR_NOT_A_RESPONSE
            )));
        }
        let call_id = self.reader.read_u64()?;
        let result_code = self.reader.read_i32()?;
        let response_path = self.reader.read_nullable_string()?;
        let stat = self.read_stat()?;
        let content = self.read_content()?;

        Ok(RequestResponse {
            call_id,
            result_code,
            response_path,
            stat,
            content,
        })
    }

    fn read_content(&mut self) -> Result<Content> {
        let tag = self.reader.read_u8()?;
        let content_type = ContentType::try_from(tag)?;

        Ok(match content_type {
            ContentType::Unknown => return Err(ProtocolError::unknown("ContentType", tag)),
            ContentType::ListOfString => Content::ListOfString(self.read_string_list()?),
            ContentType::StringArray => Content::StringArray(self.read_string_list()?),
            ContentType::String => Content::String(self.reader.read_string()?),
            ContentType::ByteArray => self
                .reader
                .read_bytes()?
                .map_or(Content::Empty, Content::ByteArray),
            ContentType::AclList => self.read_acl_list()?.map_or(Content::Empty, Content::AclList),
            ContentType::OpResultList => self
                .read_op_result_list()?
                .map_or(Content::Empty, Content::OpResultList),
            ContentType::Stat => self.read_stat()?.map_or(Content::Empty, Content::Stat),
            ContentType::Redirect => self
                .read_redirect()?
                .map_or(Content::Empty, Content::Redirect),
            ContentType::AnyObject => self.read_opaque()?,
            ContentType::Request => Content::Request(Box::new(self.read_request()?)),
            ContentType::WatcherCall => Content::WatcherCall(self.read_watcher_call()?),
        })
    }

    fn read_opaque(&mut self) -> Result<Content> {
        match self.reader.read_bytes()? {
            None => Ok(Content::Empty),
            Some(bytes) => match bytes.split_first() {
                Some((&OPAQUE_NULL_MARKER, [])) => Ok(Content::Empty),
                Some((&OPAQUE_VALUE_MARKER, rest)) => Ok(Content::AnyObject(rest.to_vec())),
                _ => Err(ProtocolError::format("Malformed opaque object")),
            },
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::Format(format!(
                "Nesting deeper than {MAX_NESTING_DEPTH}"
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn read_request(&mut self) -> Result<Request> {
        let request_type = RingMasterRequestType::try_from(self.reader.read_u16()?)?;

        let uid = self.reader.read_u64()?;
        let path = self.reader.read_string()?;
        let auth = self.read_session_auth()?;
        let overrides = self.read_overrides()?;

        let mut request = Request::new(path, RequestKind::Sync).with_uid(uid);
        request.auth = auth;
        request.overrides = overrides;

        if self.version.supports(Feature::ExecutionQueue) && self.reader.read_bool()? {
            request.execution_queue_id = self.reader.read_guid()?;
            request.execution_queue_timeout_millis = self.reader.read_i32()?;
        }
        if self.version.supports(Feature::TimeStreamId) {
            request.time_stream_id = self.reader.read_u64()?;
        }

        request.kind = self.read_request_kind(request_type)?;
        Ok(request)
    }

    fn read_request_kind(&mut self, request_type: RingMasterRequestType) -> Result<RequestKind> {
        Ok(match request_type {
            RingMasterRequestType::Init => RequestKind::Init {
                session_id: self.reader.read_u64()?,
                session_password: self.reader.read_string()?,
                read_only_interface_requires_locks: self.reader.read_bool()?,
                redirection: RedirectionPolicy::try_from(self.reader.read_u8()?)?,
            },
            RingMasterRequestType::SetAuth => RequestKind::SetAuth {
                client_id: self.reader.read_string()?,
            },
            RingMasterRequestType::Create => RequestKind::Create {
                mode: CreateMode::from_bits_retain(self.reader.read_u16()?),
                data: self.reader.read_bytes()?,
                acl: self.read_acl_list()?,
            },
            RingMasterRequestType::Delete => {
                let version = self.reader.read_i32()?;
                let mode = if self.version.supports(Feature::DeleteMode) {
                    DeleteMode::from_bits_retain(self.reader.read_u16()?)
                } else if self.reader.read_bool()? {
                    DeleteMode::CASCADE_DELETE
                } else {
                    DeleteMode::NONE
                };
                RequestKind::Delete { version, mode }
            }
            RingMasterRequestType::Move => {
                if !self.version.supports(Feature::Move) {
                    return Err(ProtocolError::NotImplemented(format!(
                        "Move is not available at protocol {}",
                        self.version
                    )));
                }
                RequestKind::Move {
                    version: self.reader.read_i32()?,
                    path_dst: self.reader.read_string()?,
                    mode: MoveMode::from_bits_retain(self.reader.read_u16()?),
                }
            }
            RingMasterRequestType::Check => {
                let version = self.reader.read_i32()?;
                let unique_incarnation = self.read_unique_incarnation()?;
                let (cversion, aversion) =
                    if self.version.supports(Feature::CheckChildAndAclVersion) {
                        (self.reader.read_i32()?, self.reader.read_i32()?)
                    } else {
                        (-1, -1)
                    };
                RequestKind::Check {
                    version,
                    cversion,
                    aversion,
                    unique_incarnation,
                }
            }
            RingMasterRequestType::Sync => RequestKind::Sync,
            RingMasterRequestType::Exists => RequestKind::Exists {
                watcher: self.read_watcher()?,
            },
            RingMasterRequestType::GetAcl => RequestKind::GetAcl {
                stat: self.read_stat()?,
            },
            RingMasterRequestType::GetData => {
                let watcher = self.read_watcher()?;
                let options = GetDataOptions::from_bits_retain(self.reader.read_u8()?);
                let mut option_argument = None;
                if self.version.supports(Feature::GetDataOptionArgument) {
                    option_argument = self.read_option_argument()?;
                }
                if options == GetDataOptions::FAULTBACK_ON_PARENT_DATA {
                    option_argument = Some(MatchArgument::faultback_on_parent_data());
                }
                RequestKind::GetData {
                    watcher,
                    options,
                    option_argument,
                }
            }
            RingMasterRequestType::GetChildren => {
                let watcher = self.read_watcher()?;
                let retrieval_condition = if self.reader.read_bool()? {
                    Some(self.reader.read_string()?)
                } else {
                    None
                };
                RequestKind::GetChildren {
                    watcher,
                    retrieval_condition,
                }
            }
            RingMasterRequestType::SetData => RequestKind::SetData {
                version: self.reader.read_i32()?,
                data: self.reader.read_bytes()?,
                is_data_command: self.reader.read_bool()?,
            },
            RingMasterRequestType::SetAcl => RequestKind::SetAcl {
                version: self.reader.read_i32()?,
                acl: self.read_acl_list()?,
            },
            RingMasterRequestType::Multi => {
                let requests = self.read_sub_requests()?;
                let complete_synchronously = self.reader.read_bool()?;
                let scheduled_name = if self.version.supports(Feature::ScheduledName) {
                    self.reader.read_nullable_string()?
                } else {
                    None
                };
                RequestKind::Multi {
                    requests,
                    complete_synchronously,
                    scheduled_name,
                }
            }
            RingMasterRequestType::Batch => {
                self.version.require(Feature::Batch)?;
                RequestKind::Batch {
                    requests: self.read_sub_requests()?,
                    complete_synchronously: self.reader.read_bool()?,
                }
            }
        })
    }

    fn read_sub_requests(&mut self) -> Result<Vec<Request>> {
        self.enter()?;
        let count = usize::from(self.reader.read_u16()?);
        // each sub-request is at least a type, a uid and a path length
        let mut requests = Vec::with_capacity(count.min(self.reader.remaining() / 11));
        for _ in 0..count {
            requests.push(self.read_request()?);
        }
        self.leave();
        Ok(requests)
    }

    fn read_unique_incarnation(&mut self) -> Result<UniqueIncarnation> {
        Ok(match self.reader.read_u8()? {
            0 => UniqueIncarnation::None,
            1 => UniqueIncarnation::Simple(self.reader.read_guid()?),
            2 => UniqueIncarnation::Extended(self.reader.read_guid()?),
            other => return Err(ProtocolError::unknown("UniqueIncarnationIdType", other)),
        })
    }

    /// Only match arguments carry data; any other option decodes as absent.
    fn read_option_argument(&mut self) -> Result<Option<MatchArgument>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        let option = GetDataOptions::from_bits_retain(self.reader.read_u8()?);
        if option != GetDataOptions::FAULTBACK_ON_PARENT_DATA_WITH_MATCH {
            return Ok(None);
        }
        Ok(Some(MatchArgument {
            comparison: Comparison::try_from(self.reader.read_u8()?)?,
            position: self.reader.read_i32()?,
            bytes: self.reader.read_bytes()?,
        }))
    }

    fn read_watcher(&mut self) -> Result<Option<Watcher>> {
        let id = self.reader.read_u64()?;
        let kind = WatcherKind::from_bits_retain(self.reader.read_u8()?);
        Ok((id != 0).then(|| Watcher::new(id, kind)))
    }

    fn read_session_auth(&mut self) -> Result<Option<SessionAuth>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        Ok(Some(SessionAuth {
            is_super_session: self.reader.read_bool()?,
            client_ip: self.reader.read_nullable_string()?,
            client_digest: self.reader.read_nullable_string()?,
            client_identity: self.reader.read_nullable_string()?,
        }))
    }

    fn read_overrides(&mut self) -> Result<Option<OperationOverrides>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        Ok(Some(OperationOverrides {
            tx_id: self.reader.read_u64()?,
            tx_time: self.reader.read_u64()?,
        }))
    }

    fn read_stat(&mut self) -> Result<Option<Stat>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        let aversion = self.reader.read_i32()?;
        let cversion = self.reader.read_i32()?;
        let version = self.reader.read_i32()?;
        let num_children = self.reader.read_i32()?;
        let data_length = self.reader.read_i32()?;
        let _ephemeral_owner = self.reader.read_i64()?;

        Ok(Some(Stat {
            aversion,
            cversion,
            version,
            num_children,
            data_length,
            czxid: self.reader.read_i64()?,
            mzxid: self.reader.read_i64()?,
            pzxid: self.reader.read_i64()?,
            ctime: self.reader.read_i64()?,
            mtime: self.reader.read_i64()?,
        }))
    }

    fn read_acl(&mut self) -> Result<Option<Acl>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        let scheme = self.reader.read_string()?;
        let identifier = self.reader.read_string()?;
        let perms = Perms::from_bits_retain(self.reader.read_i32()?);
        Ok(Some(Acl::new(perms, Id::new(scheme, identifier))))
    }

    fn read_acl_list(&mut self) -> Result<Option<Vec<Acl>>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        let count = self.reader.read_count()?;
        let mut acls = Vec::with_capacity(count.min(self.reader.remaining()));
        for _ in 0..count {
            let acl = self
                .read_acl()?
                .ok_or_else(|| ProtocolError::format(constants::ERR_NULL_ACL_ENTRY))?;
            acls.push(acl);
        }
        Ok(Some(acls))
    }

    fn read_string_list(&mut self) -> Result<Vec<String>> {
        let count = self.reader.read_count()?;
        let mut items = Vec::with_capacity(count.min(self.reader.remaining()));
        for _ in 0..count {
            items.push(self.reader.read_string()?);
        }
        Ok(items)
    }

    fn read_redirect(&mut self) -> Result<Option<RedirectSuggested>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        Ok(Some(RedirectSuggested {
            suggested_connection_string: self.reader.read_nullable_string()?,
        }))
    }

    fn read_watcher_call(&mut self) -> Result<WatcherCall> {
        let watcher_id = self.reader.read_u64()?;
        let kind = if self.version.supports(Feature::WatcherKindByte) {
            WatcherKind::from_bits_retain(self.reader.read_u8()?)
        } else if self.reader.read_bool()? {
            WatcherKind::ONE_USE
        } else {
            WatcherKind::NONE
        };

        let event = if self.reader.read_bool()? {
            None
        } else {
            Some(self.read_watched_event()?)
        };

        Ok(WatcherCall {
            watcher_id,
            kind,
            event,
        })
    }

    fn read_watched_event(&mut self) -> Result<WatchedEvent> {
        let event_type = WatchedEventType::try_from(self.reader.read_i32()?)?;
        let keeper_state = KeeperState::try_from(self.reader.read_i32()?)?;
        let mut event = WatchedEvent::new(event_type, keeper_state, self.reader.read_string()?);
        if self.version.supports(Feature::WatchedEventPayload) {
            event.data = self.reader.read_bytes()?;
            event.stat = self.read_stat()?;
        }
        Ok(event)
    }

    fn read_op_result_list(&mut self) -> Result<Option<Vec<OpResult>>> {
        if self.reader.read_bool()? {
            return Ok(None);
        }
        self.enter()?;
        let count = self.reader.read_count()?;
        let mut results = Vec::with_capacity(count.min(self.reader.remaining() / 4));
        for _ in 0..count {
            results.push(self.read_op_result()?);
        }
        self.leave();
        Ok(Some(results))
    }

    fn read_op_result(&mut self) -> Result<OpResult> {
        Ok(match OpCode::try_from(self.reader.read_i32()?)? {
            OpCode::Check => OpResult::Check,
            OpCode::Delete => OpResult::Delete,
            OpCode::GetData => {
                let stat = self.read_stat()?;
                let bytes = self.reader.read_bytes()?;
                let path = if self.version.supports(Feature::OpResultPath) {
                    self.reader.read_string()?
                } else {
                    String::new()
                };
                OpResult::GetData {
                    stat,
                    bytes,
                    path: Some(path),
                }
            }
            OpCode::Create => {
                let stat = self.read_stat()?;
                let path = if self.version.supports(Feature::NullableCreateResultPath) {
                    self.reader.read_nullable_string()?
                } else {
                    Some(self.reader.read_string()?)
                };
                OpResult::Create { stat, path }
            }
            OpCode::Move => OpResult::Move {
                stat: self.read_stat()?,
                dst_path: self.reader.read_string()?,
            },
            OpCode::Error => OpResult::Error {
                result_code: self.reader.read_i32()?,
            },
            OpCode::SetData => OpResult::SetData {
                stat: self.read_stat()?,
            },
            OpCode::SetAcl => OpResult::SetAcl {
                stat: self.read_stat()?,
            },
            OpCode::Multi => OpResult::Multi {
                results: self.read_op_result_list()?,
            },
        })
    }
}
