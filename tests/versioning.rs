//! Integration tests for the versioned field policy
//!
//! Each gated field is checked just below and at the version that introduces
//! it, and every supported version is exercised with a request carrying all
//! of the newest fields.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::uninlined_format_args
)]

use ringmaster_protocol::core::primitives::Guid;
use ringmaster_protocol::core::version::{Feature, ProtocolVersion};
use ringmaster_protocol::protocol::request::{Request, RequestCall, RequestKind};
use ringmaster_protocol::protocol::response::{Content, OpResult, RequestResponse};
use ringmaster_protocol::protocol::types::{
    Comparison, GetDataOptions, KeeperState, MatchArgument, MoveMode, Stat, UniqueIncarnation,
    WatchedEvent, WatchedEventType, WatcherCall, WatcherKind,
};
use ringmaster_protocol::protocol::RingMasterCommunicationProtocol;
use ringmaster_protocol::ProtocolError;

fn protocol() -> RingMasterCommunicationProtocol {
    RingMasterCommunicationProtocol::new()
}

fn round_trip(call: &RequestCall, version: u32) -> RequestCall {
    let bytes = protocol().serialize_request(call, version).unwrap();
    protocol().deserialize_request(&bytes, version).unwrap()
}

fn round_trip_response(response: RequestResponse, version: u32) -> RequestResponse {
    let bytes = protocol().serialize_response(response, version).unwrap();
    protocol().deserialize_response(&bytes, version).unwrap()
}

// ============================================================================
// Version range
// ============================================================================

#[test]
fn test_out_of_range_versions_rejected_everywhere() {
    let call = RequestCall::new(1, Request::sync("/"));
    for version in [0, 12, 26, u32::MAX] {
        assert!(matches!(
            protocol().serialize_request(&call, version),
            Err(ProtocolError::VersionOutOfRange(v)) if v == version
        ));
        assert!(matches!(
            protocol().deserialize_request(&[0u8; 16], version),
            Err(ProtocolError::VersionOutOfRange(_))
        ));
        assert!(matches!(
            protocol().serialize_response(RequestResponse::ok(1, Content::Empty), version),
            Err(ProtocolError::VersionOutOfRange(_))
        ));
        assert!(matches!(
            protocol().deserialize_response(&[0u8; 16], version),
            Err(ProtocolError::VersionOutOfRange(_))
        ));
    }
}

#[test]
fn test_feature_table_is_monotonic() {
    for feature in Feature::ALL {
        let mut enabled = false;
        for version in ProtocolVersion::all() {
            let now = version.supports(feature);
            assert!(!(enabled && !now), "{feature} disabled again at {version}");
            enabled = now;
        }
        assert!(ProtocolVersion::LATEST.supports(feature));
    }
    assert_eq!(ProtocolVersion::OLDEST.features().count(), 0);
}

// ============================================================================
// Gated fields, one boundary each
// ============================================================================

#[test]
fn test_check_versions_gated_at_v16() {
    let mut request = Request::check("/c", 4);
    if let RequestKind::Check {
        cversion, aversion, ..
    } = &mut request.kind
    {
        *cversion = 5;
        *aversion = 6;
    }
    let call = RequestCall::new(1, request);

    match round_trip(&call, 15).request.kind {
        RequestKind::Check {
            version,
            cversion,
            aversion,
            ..
        } => assert_eq!((version, cversion, aversion), (4, -1, -1)),
        other => panic!("Expected Check, got {:?}", other),
    }
    assert_eq!(round_trip(&call, 16), call);
}

#[test]
fn test_unique_incarnation_kinds_round_trip() {
    let id = Guid::new_random();
    for incarnation in [
        UniqueIncarnation::None,
        UniqueIncarnation::Simple(id),
        UniqueIncarnation::Extended(id),
    ] {
        let mut request = Request::check("/c", 1);
        if let RequestKind::Check {
            unique_incarnation, ..
        } = &mut request.kind
        {
            *unique_incarnation = incarnation;
        }
        let call = RequestCall::new(2, request);
        assert_eq!(round_trip(&call, 13), call);
    }
}

#[test]
fn test_execution_queue_gated_at_v17() {
    let call = RequestCall::new(
        3,
        Request::sync("/q").with_execution_queue(Guid::new_random(), 1500),
    );

    let old = round_trip(&call, 16).request;
    assert!(old.execution_queue_id.is_empty());
    assert_eq!(old.execution_queue_timeout_millis, 0);

    assert_eq!(round_trip(&call, 17), call);
}

#[test]
fn test_time_stream_id_gated_at_v21() {
    let call = RequestCall::new(4, Request::sync("/t").with_time_stream_id(77));
    assert_eq!(round_trip(&call, 20).request.time_stream_id, 0);
    assert_eq!(round_trip(&call, 21), call);
}

#[test]
fn test_move_gated_at_v19() {
    let call = RequestCall::new(
        5,
        Request::move_node("/src", 2, "/dst", MoveMode::ALLOW_PATH_CREATION),
    );

    let err = protocol().serialize_request(&call, 18).unwrap_err();
    assert!(matches!(err, ProtocolError::NotImplemented(_)), "{err}");
    assert_eq!(round_trip(&call, 19), call);
}

#[test]
fn test_batch_gated_at_v15() {
    let call = RequestCall::new(
        6,
        Request::batch(vec![Request::sync("/a"), Request::sync("/b")], true),
    );

    assert!(matches!(
        protocol().serialize_request(&call, 14),
        Err(ProtocolError::UnsupportedFeature { version: 14, .. })
    ));

    // Batch bytes produced at v15 are still refused by a v14 reader.
    let bytes = protocol().serialize_request(&call, 15).unwrap();
    assert!(matches!(
        protocol().deserialize_request(&bytes, 14),
        Err(ProtocolError::UnsupportedFeature { version: 14, .. })
    ));
    assert_eq!(protocol().deserialize_request(&bytes, 15).unwrap(), call);
}

#[test]
fn test_scheduled_name_gated_at_v20() {
    let mut request = Request::multi(vec![Request::check("/m", 1)], false);
    if let RequestKind::Multi { scheduled_name, .. } = &mut request.kind {
        *scheduled_name = Some("nightly".into());
    }
    let call = RequestCall::new(7, request);

    match round_trip(&call, 19).request.kind {
        RequestKind::Multi { scheduled_name, .. } => assert!(scheduled_name.is_none()),
        other => panic!("Expected Multi, got {:?}", other),
    }
    assert_eq!(round_trip(&call, 20), call);
}

#[test]
fn test_get_data_option_argument_gated_at_v14() {
    let argument = MatchArgument {
        comparison: Comparison::Greater,
        position: 3,
        bytes: Some(vec![1, 2]),
    };
    let mut request = Request::get_data("/g", GetDataOptions::FAULTBACK_ON_PARENT_DATA_WITH_MATCH, None);
    if let RequestKind::GetData {
        option_argument, ..
    } = &mut request.kind
    {
        *option_argument = Some(argument);
    }
    let call = RequestCall::new(8, request);

    match round_trip(&call, 13).request.kind {
        RequestKind::GetData {
            option_argument, ..
        } => assert!(option_argument.is_none()),
        other => panic!("Expected GetData, got {:?}", other),
    }
    assert_eq!(round_trip(&call, 14), call);
}

#[test]
fn test_faultback_option_synthesized_at_every_version() {
    let call = RequestCall::new(
        9,
        Request::get_data("/g", GetDataOptions::FAULTBACK_ON_PARENT_DATA, None),
    );
    for version in ProtocolVersion::all() {
        match round_trip(&call, version.get()).request.kind {
            RequestKind::GetData {
                option_argument, ..
            } => assert_eq!(option_argument, Some(MatchArgument::faultback_on_parent_data())),
            other => panic!("Expected GetData, got {:?}", other),
        }
    }
}

#[test]
fn test_get_data_op_result_path_gated_at_v14() {
    let results = vec![OpResult::GetData {
        stat: None,
        bytes: Some(vec![1]),
        path: Some("/read".into()),
    }];

    let old = round_trip_response(RequestResponse::ok(1, Content::OpResultList(results.clone())), 13);
    assert_eq!(
        old.content,
        Content::OpResultList(vec![OpResult::GetData {
            stat: None,
            bytes: Some(vec![1]),
            path: Some(String::new()),
        }])
    );

    let new = round_trip_response(RequestResponse::ok(1, Content::OpResultList(results.clone())), 14);
    assert_eq!(new.content, Content::OpResultList(results));
}

#[test]
fn test_create_op_result_null_path_gated_at_v22() {
    let results = vec![OpResult::Create {
        stat: Some(Stat::default()),
        path: None,
    }];

    let old = round_trip_response(RequestResponse::ok(1, Content::OpResultList(results.clone())), 21);
    assert_eq!(
        old.content,
        Content::OpResultList(vec![OpResult::Create {
            stat: Some(Stat::default()),
            path: Some(String::new()),
        }])
    );

    let new = round_trip_response(RequestResponse::ok(1, Content::OpResultList(results.clone())), 22);
    assert_eq!(new.content, Content::OpResultList(results));
}

#[test]
fn test_watched_event_payload_gated_at_v23() {
    let event = WatchedEvent {
        data: Some(vec![4, 2]),
        stat: Some(Stat::default()),
        ..WatchedEvent::new(WatchedEventType::NodeDataChanged, KeeperState::SyncConnected, "/w")
    };
    let call = WatcherCall {
        watcher_id: 5,
        kind: WatcherKind::ONE_USE,
        event: Some(event.clone()),
    };

    let old = round_trip_response(RequestResponse::ok(1, Content::WatcherCall(call.clone())), 22);
    match old.content {
        Content::WatcherCall(got) => {
            let got_event = got.event.unwrap();
            assert_eq!(got.kind, WatcherKind::ONE_USE);
            assert_eq!(got_event.path, "/w");
            assert!(got_event.data.is_none());
            assert!(got_event.stat.is_none());
        }
        other => panic!("Expected WatcherCall, got {:?}", other),
    }

    let new = round_trip_response(RequestResponse::ok(1, Content::WatcherCall(call.clone())), 23);
    assert_eq!(new.content, Content::WatcherCall(call));
}

// ============================================================================
// Version matrix
// ============================================================================

#[test]
fn test_simple_requests_round_trip_at_every_version() {
    let requests = vec![
        Request::init(0x1234, "secret"),
        Request::set_auth("digest:alice"),
        Request::sync("/s"),
        Request::exists("/e", None),
        Request::get_acl("/a", Some(Stat::default())),
        Request::get_children("/c", None, None),
        Request::set_data("/d", Some(b"payload".to_vec()), 9),
        Request::check("/k", 3),
        Request::multi(vec![Request::sync("/1"), Request::exists("/2", None)], true),
    ];

    for version in ProtocolVersion::all() {
        for (i, request) in requests.iter().enumerate() {
            let call = RequestCall::new(i as u64, request.clone());
            let decoded = round_trip(&call, version.get());
            assert_eq!(decoded, call, "mismatch for {:?} at {}", request.request_type(), version);
        }
    }
}

#[test]
fn test_newest_request_degrades_gracefully() {
    let mut request = Request::multi(
        vec![Request::check("/c", 1).with_time_stream_id(5)],
        false,
    )
    .with_execution_queue(Guid::new_random(), 10)
    .with_time_stream_id(8);
    if let RequestKind::Multi { scheduled_name, .. } = &mut request.kind {
        *scheduled_name = Some("job".into());
    }
    let call = RequestCall::new(99, request);

    for version in ProtocolVersion::all() {
        let decoded = round_trip(&call, version.get());
        assert_eq!(decoded.call_id, 99);
        assert_eq!(decoded.request.request_type(), call.request.request_type());
        assert_eq!(
            decoded.request.time_stream_id != 0,
            version.supports(Feature::TimeStreamId)
        );
        assert_eq!(
            !decoded.request.execution_queue_id.is_empty(),
            version.supports(Feature::ExecutionQueue)
        );
    }
}
