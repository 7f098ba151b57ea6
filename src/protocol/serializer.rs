//! # Serializer
//!
//! Field-by-field encoder for [`RequestCall`] and [`RequestResponse`] at one
//! fixed protocol version.
//!
//! A `Serializer` is single-use: it is built for one version, encodes exactly
//! one message and is consumed by doing so. Build a new one per message.
//!
//! Every version-dependent branch goes through [`ProtocolVersion::supports`]
//! or [`ProtocolVersion::require`]; no raw version numbers are compared here.

use bytes::Bytes;

use crate::core::primitives::WireWriter;
use crate::core::version::{Feature, ProtocolVersion};
use crate::error::{ProtocolError, Result};
use crate::protocol::request::{Request, RequestCall, RequestKind};
use crate::protocol::response::{Content, OpResult, RequestResponse};
use crate::protocol::types::{
    Acl, DeleteMode, GetDataOptions, MatchArgument, OperationOverrides, RedirectSuggested,
    SessionAuth, Stat, UniqueIncarnation, WatchedEvent, Watcher, WatcherCall, WatcherKind,
};

/// Marker preceding an encoded [`RequestCall`].
pub const REQUEST_CALL_MAGIC: u32 = 0xbeef_0101;

/// Marker preceding an encoded [`RequestResponse`].
pub const REQUEST_RESPONSE_MAGIC: u32 = 0xbeef_0102;

/// Payload written for [`Content::Empty`] inside an opaque object slot.
pub(crate) const OPAQUE_NULL_MARKER: u8 = 1;

/// Prefix written before the bytes of a non-null opaque object.
pub(crate) const OPAQUE_VALUE_MARKER: u8 = 0;

pub struct Serializer {
    version: ProtocolVersion,
    writer: WireWriter,
}

impl Serializer {
    /// Fails with [`ProtocolError::VersionOutOfRange`] outside 13..=25.
    pub fn new(version: u32) -> Result<Self> {
        Ok(Self {
            version: ProtocolVersion::new(version)?,
            writer: WireWriter::with_capacity(256),
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn serialize_request(mut self, call: &RequestCall) -> Result<Bytes> {
        self.writer.write_u32(REQUEST_CALL_MAGIC);
        self.writer.write_u64(call.call_id);
        self.write_request(&call.request)?;
        Ok(self.writer.into_bytes())
    }

    /// Deferred content is materialized here, which is why the response is
    /// taken by value.
    pub fn serialize_response(mut self, response: RequestResponse) -> Result<Bytes> {
        self.writer.write_u32(REQUEST_RESPONSE_MAGIC);
        self.writer.write_u64(response.call_id);
        self.writer.write_i32(response.result_code);
        self.writer
            .write_nullable_string(response.response_path.as_deref());
        self.write_stat(response.stat.as_ref());
        self.write_content(response.content.materialize())?;
        Ok(self.writer.into_bytes())
    }

    fn write_content(&mut self, content: Content) -> Result<()> {
        let tag = content
            .content_type()
            .ok_or_else(|| ProtocolError::format("Deferred content was not materialized"))?;
        self.writer.write_u8(tag.to_wire());

        match content {
            Content::Empty => self.writer.write_bytes(Some(&[OPAQUE_NULL_MARKER]))?,
            Content::AnyObject(bytes) => {
                let mut framed = Vec::with_capacity(bytes.len() + 1);
                framed.push(OPAQUE_VALUE_MARKER);
                framed.extend_from_slice(&bytes);
                self.writer.write_bytes(Some(&framed))?;
            }
            Content::Request(request) => self.write_request(&request)?,
            Content::WatcherCall(call) => self.write_watcher_call(&call)?,
            Content::StringArray(items) | Content::ListOfString(items) => {
                self.write_string_list(&items)?
            }
            Content::String(value) => self.writer.write_string(&value),
            Content::Stat(stat) => self.write_stat(Some(&stat)),
            Content::ByteArray(bytes) => self.writer.write_bytes(Some(&bytes))?,
            Content::AclList(acls) => self.write_acl_list(Some(&acls))?,
            Content::OpResultList(results) => self.write_op_result_list(Some(&results))?,
            Content::Redirect(redirect) => self.write_redirect(&redirect),
            Content::Deferred(_) => {
                return Err(ProtocolError::format("Deferred content was not materialized"))
            }
        }
        Ok(())
    }

    fn write_request(&mut self, request: &Request) -> Result<()> {
        self.writer.write_u16(request.request_type().to_wire());
        self.write_preamble(request);

        match &request.kind {
            RequestKind::Init {
                session_id,
                session_password,
                read_only_interface_requires_locks,
                redirection,
            } => {
                self.writer.write_u64(*session_id);
                self.writer.write_string(session_password);
                self.writer.write_bool(*read_only_interface_requires_locks);
                self.writer.write_u8(redirection.to_wire());
            }
            RequestKind::SetAuth { client_id } => self.writer.write_string(client_id),
            RequestKind::Create { mode, data, acl } => {
                self.writer.write_u16(mode.bits());
                self.writer.write_bytes(data.as_deref())?;
                self.write_acl_list(acl.as_deref())?;
            }
            RequestKind::Delete { version, mode } => {
                self.writer.write_i32(*version);
                self.write_delete_mode(*mode)?;
            }
            RequestKind::Move {
                version,
                path_dst,
                mode,
            } => {
                if !self.version.supports(Feature::Move) {
                    return Err(ProtocolError::NotImplemented(format!(
                        "Move is not available at protocol {}",
                        self.version
                    )));
                }
                self.writer.write_i32(*version);
                self.writer.write_string(path_dst);
                self.writer.write_u16(mode.bits());
            }
            RequestKind::Check {
                version,
                cversion,
                aversion,
                unique_incarnation,
            } => {
                self.writer.write_i32(*version);
                self.write_unique_incarnation(unique_incarnation);
                if self.version.supports(Feature::CheckChildAndAclVersion) {
                    self.writer.write_i32(*cversion);
                    self.writer.write_i32(*aversion);
                }
            }
            RequestKind::Sync => {}
            RequestKind::Exists { watcher } => self.write_watcher(watcher.as_ref()),
            RequestKind::GetAcl { stat } => self.write_stat(stat.as_ref()),
            RequestKind::GetData {
                watcher,
                options,
                option_argument,
            } => {
                self.write_watcher(watcher.as_ref());
                self.writer.write_u8(options.bits());
                if self.version.supports(Feature::GetDataOptionArgument) {
                    self.write_option_argument(option_argument.as_ref())?;
                }
            }
            RequestKind::GetChildren {
                watcher,
                retrieval_condition,
            } => {
                self.write_watcher(watcher.as_ref());
                self.writer.write_bool(retrieval_condition.is_some());
                if let Some(condition) = retrieval_condition {
                    self.writer.write_string(condition);
                }
            }
            RequestKind::SetData {
                version,
                data,
                is_data_command,
            } => {
                self.writer.write_i32(*version);
                self.writer.write_bytes(data.as_deref())?;
                self.writer.write_bool(*is_data_command);
            }
            RequestKind::SetAcl { version, acl } => {
                self.writer.write_i32(*version);
                self.write_acl_list(acl.as_deref())?;
            }
            RequestKind::Multi {
                requests,
                complete_synchronously,
                scheduled_name,
            } => {
                self.write_sub_requests(requests)?;
                self.writer.write_bool(*complete_synchronously);
                if self.version.supports(Feature::ScheduledName) {
                    self.writer.write_nullable_string(scheduled_name.as_deref());
                }
            }
            RequestKind::Batch {
                requests,
                complete_synchronously,
            } => {
                self.version.require(Feature::Batch)?;
                self.write_sub_requests(requests)?;
                self.writer.write_bool(*complete_synchronously);
            }
        }
        Ok(())
    }

    fn write_preamble(&mut self, request: &Request) {
        self.writer.write_u64(request.uid);
        self.writer.write_string(&request.path);
        self.write_session_auth(request.auth.as_ref());
        self.write_overrides(request.overrides.as_ref());

        if self.version.supports(Feature::ExecutionQueue) {
            let present = !request.execution_queue_id.is_empty();
            self.writer.write_bool(present);
            if present {
                self.writer.write_guid(&request.execution_queue_id);
                self.writer.write_i32(request.execution_queue_timeout_millis);
            }
        }

        if self.version.supports(Feature::TimeStreamId) {
            self.writer.write_u64(request.time_stream_id);
        }
    }

    /// Below the `DeleteMode` version only a cascade flag is representable.
    fn write_delete_mode(&mut self, mode: DeleteMode) -> Result<()> {
        if self.version.supports(Feature::DeleteMode) {
            self.writer.write_u16(mode.bits());
            return Ok(());
        }
        if !mode.difference(DeleteMode::CASCADE_DELETE).is_empty() {
            self.version.require(Feature::DeleteMode)?;
        }
        self.writer.write_bool(mode.contains(DeleteMode::CASCADE_DELETE));
        Ok(())
    }

    fn write_sub_requests(&mut self, requests: &[Request]) -> Result<()> {
        let count = u16::try_from(requests.len()).map_err(|_| {
            ProtocolError::Format(format!("Too many sub-requests: {}", requests.len()))
        })?;
        self.writer.write_u16(count);
        for request in requests {
            self.write_request(request)?;
        }
        Ok(())
    }

    fn write_unique_incarnation(&mut self, incarnation: &UniqueIncarnation) {
        self.writer.write_u8(incarnation.kind_byte());
        match incarnation {
            UniqueIncarnation::None => {}
            UniqueIncarnation::Simple(id) | UniqueIncarnation::Extended(id) => {
                self.writer.write_guid(id)
            }
        }
    }

    fn write_option_argument(&mut self, argument: Option<&MatchArgument>) -> Result<()> {
        self.writer.write_bool(argument.is_none());
        if let Some(argument) = argument {
            self.writer
                .write_u8(GetDataOptions::FAULTBACK_ON_PARENT_DATA_WITH_MATCH.bits());
            self.writer.write_u8(argument.comparison.to_wire());
            self.writer.write_i32(argument.position);
            self.writer.write_bytes(argument.bytes.as_deref())?;
        }
        Ok(())
    }

    /// An absent watcher is written as id 0 of kind `ONE_USE`.
    fn write_watcher(&mut self, watcher: Option<&Watcher>) {
        match watcher {
            Some(watcher) => {
                self.writer.write_u64(watcher.id);
                self.writer.write_u8(watcher.kind.bits());
            }
            None => {
                self.writer.write_u64(0);
                self.writer.write_u8(WatcherKind::ONE_USE.bits());
            }
        }
    }

    fn write_session_auth(&mut self, auth: Option<&SessionAuth>) {
        self.writer.write_bool(auth.is_none());
        if let Some(auth) = auth {
            self.writer.write_bool(auth.is_super_session);
            self.writer.write_nullable_string(auth.client_ip.as_deref());
            self.writer.write_nullable_string(auth.client_digest.as_deref());
            self.writer
                .write_nullable_string(auth.client_identity.as_deref());
        }
    }

    fn write_overrides(&mut self, overrides: Option<&OperationOverrides>) {
        self.writer.write_bool(overrides.is_none());
        if let Some(overrides) = overrides {
            self.writer.write_u64(overrides.tx_id);
            self.writer.write_u64(overrides.tx_time);
        }
    }

    fn write_stat(&mut self, stat: Option<&Stat>) {
        self.writer.write_bool(stat.is_none());
        if let Some(stat) = stat {
            self.writer.write_i32(stat.aversion);
            self.writer.write_i32(stat.cversion);
            self.writer.write_i32(stat.version);
            self.writer.write_i32(stat.num_children);
            self.writer.write_i32(stat.data_length);
            // ephemeral owner
            self.writer.write_i64(0);
            self.writer.write_i64(stat.czxid);
            self.writer.write_i64(stat.mzxid);
            self.writer.write_i64(stat.pzxid);
            self.writer.write_i64(stat.ctime);
            self.writer.write_i64(stat.mtime);
        }
    }

    fn write_acl(&mut self, acl: &Acl) {
        self.writer.write_bool(false);
        self.writer.write_string(&acl.id.scheme);
        self.writer.write_string(&acl.id.identifier);
        self.writer.write_i32(acl.perms.bits());
    }

    fn write_acl_list(&mut self, acls: Option<&[Acl]>) -> Result<()> {
        self.writer.write_bool(acls.is_none());
        if let Some(acls) = acls {
            self.writer.write_i32(count_as_i32(acls.len())?);
            for acl in acls {
                self.write_acl(acl);
            }
        }
        Ok(())
    }

    fn write_string_list(&mut self, items: &[String]) -> Result<()> {
        self.writer.write_i32(count_as_i32(items.len())?);
        for item in items {
            self.writer.write_string(item);
        }
        Ok(())
    }

    fn write_redirect(&mut self, redirect: &RedirectSuggested) {
        self.writer.write_bool(false);
        self.writer
            .write_nullable_string(redirect.suggested_connection_string.as_deref());
    }

    fn write_watcher_call(&mut self, call: &WatcherCall) -> Result<()> {
        self.writer.write_u64(call.watcher_id);
        self.writer.write_u8(call.kind.bits());
        self.writer.write_bool(call.event.is_none());
        match &call.event {
            Some(event) => self.write_watched_event(event),
            None => Ok(()),
        }
    }

    fn write_watched_event(&mut self, event: &WatchedEvent) -> Result<()> {
        self.writer.write_i32(event.event_type.to_wire());
        self.writer.write_i32(event.keeper_state.to_wire());
        self.writer.write_string(&event.path);
        if self.version.supports(Feature::WatchedEventPayload) {
            self.writer.write_bytes(event.data.as_deref())?;
            self.write_stat(event.stat.as_ref());
        }
        Ok(())
    }

    fn write_op_result_list(&mut self, results: Option<&[OpResult]>) -> Result<()> {
        self.writer.write_bool(results.is_none());
        if let Some(results) = results {
            self.writer.write_i32(count_as_i32(results.len())?);
            for result in results {
                self.writer.write_i32(result.op_code().to_wire());
                self.write_op_result(result)?;
            }
        }
        Ok(())
    }

    fn write_op_result(&mut self, result: &OpResult) -> Result<()> {
        match result {
            OpResult::Check | OpResult::Delete => {}
            OpResult::GetData { stat, bytes, path } => {
                self.write_stat(stat.as_ref());
                self.writer.write_bytes(bytes.as_deref())?;
                if self.version.supports(Feature::OpResultPath) {
                    self.writer.write_string(path.as_deref().unwrap_or_default());
                }
            }
            OpResult::Create { stat, path } => {
                self.write_stat(stat.as_ref());
                if self.version.supports(Feature::NullableCreateResultPath) {
                    self.writer.write_nullable_string(path.as_deref());
                } else {
                    // older peers cannot read a null path
                    self.writer.write_string(path.as_deref().unwrap_or_default());
                }
            }
            OpResult::Move { stat, dst_path } => {
                self.write_stat(stat.as_ref());
                self.writer.write_string(dst_path);
            }
            OpResult::Error { result_code } => self.writer.write_i32(*result_code),
            OpResult::SetData { stat } | OpResult::SetAcl { stat } => {
                self.write_stat(stat.as_ref())
            }
            OpResult::Multi { results } => self.write_op_result_list(results.as_deref())?,
        }
        Ok(())
    }
}

fn count_as_i32(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| ProtocolError::Format(format!("Collection too large: {len}")))
}
