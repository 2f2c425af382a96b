//! Property-based tests for the gateway wire protocol.
//!
//! Uses proptest to verify:
//! 1. Any client frame, including full task records and nested patches,
//!    survives the codec.
//! 2. Any server frame survives the codec and keeps its correlation id.
//! 3. Random bytes never cause a panic in either decoder.
//! 4. Status keys normalise idempotently.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use proptest::prelude::*;
use taskboard_proto::gateway::{
    self, ClientFrame, GatewayFault, GatewayRequest, RemoteChange, ServerFrame,
};
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{Priority, Task, TaskId, TaskPatch, UserId};
use uuid::Uuid;

// --- Strategies for protocol types ---

fn arb_task_id() -> impl Strategy<Value = TaskId> {
    any::<u128>().prop_map(|n| TaskId::from_uuid(Uuid::from_u128(n)))
}

fn arb_status() -> impl Strategy<Value = StatusKey> {
    "[a-z][a-z_]{0,15}".prop_map(StatusKey::new)
}

fn arb_user() -> impl Strategy<Value = UserId> {
    "[a-z0-9-]{1,24}".prop_map(UserId::new)
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Medium),
        Just(Priority::High),
        Just(Priority::Urgent),
    ]
}

/// Timestamps between 1970 and 2100 with nanosecond precision.
fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_102_444_800, 0u32..1_000_000_000)
        .prop_filter_map("timestamp out of range", |(secs, nanos)| {
            DateTime::from_timestamp(secs, nanos)
        })
}

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (1970i32..2100, 1u32..=12, 1u32..=28)
        .prop_filter_map("invalid date", |(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
}

fn arb_tags() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-z]{1,10}", 0..5)
}

fn arb_task() -> impl Strategy<Value = Task> {
    (
        (arb_task_id(), "[^\x00]{1,64}", prop::option::of(".{0,128}"), arb_priority()),
        (arb_status(), any::<u32>(), prop::option::of(arb_user()), prop::option::of(arb_date())),
        (arb_tags(), arb_user(), arb_timestamp(), arb_timestamp()),
    )
        .prop_map(
            |(
                (id, title, description, priority),
                (status, position, assignee, due_date),
                (tags, created_by, created_at, updated_at),
            )| Task {
                id,
                title,
                description,
                priority,
                status,
                position,
                assignee,
                due_date,
                tags,
                created_by,
                created_at,
                updated_at,
            },
        )
}

fn arb_patch() -> impl Strategy<Value = TaskPatch> {
    (
        (
            prop::option::of(".{1,64}"),
            prop::option::of(prop::option::of(".{0,64}")),
            prop::option::of(arb_priority()),
            prop::option::of(arb_status()),
        ),
        (
            prop::option::of(any::<u32>()),
            prop::option::of(prop::option::of(arb_user())),
            prop::option::of(prop::option::of(arb_date())),
            prop::option::of(arb_tags()),
        ),
    )
        .prop_map(
            |((title, description, priority, status), (position, assignee, due_date, tags))| {
                TaskPatch {
                    title,
                    description,
                    priority,
                    status,
                    position,
                    assignee,
                    due_date,
                    tags,
                }
            },
        )
}

fn arb_request() -> impl Strategy<Value = GatewayRequest> {
    prop_oneof![
        ".{0,32}".prop_map(|client_id| GatewayRequest::Hello { client_id }),
        arb_status().prop_map(|status| GatewayRequest::FetchPartition { status }),
        (arb_task_id(), arb_patch())
            .prop_map(|(task_id, patch)| GatewayRequest::Persist { task_id, patch }),
        arb_task().prop_map(|task| GatewayRequest::Insert { task }),
        arb_task_id().prop_map(|task_id| GatewayRequest::Remove { task_id }),
    ]
}

fn arb_client_frame() -> impl Strategy<Value = ClientFrame> {
    (any::<u64>(), arb_request()).prop_map(|(request_id, request)| ClientFrame {
        request_id,
        request,
    })
}

fn arb_fault() -> impl Strategy<Value = GatewayFault> {
    prop_oneof![
        arb_task_id().prop_map(GatewayFault::TaskNotFound),
        arb_status().prop_map(GatewayFault::UnknownStatus),
        ".{0,64}".prop_map(GatewayFault::InvalidTask),
        ".{0,64}".prop_map(GatewayFault::Malformed),
    ]
}

fn arb_server_frame() -> impl Strategy<Value = ServerFrame> {
    prop_oneof![
        (
            ".{0,32}",
            prop_oneof![Just(StatusSet::standard()), Just(StatusSet::review())]
        )
            .prop_map(|(client_id, columns)| ServerFrame::Welcome { client_id, columns }),
        (any::<u64>(), arb_status(), prop::collection::vec(arb_task(), 0..6)).prop_map(
            |(request_id, status, tasks)| ServerFrame::Partition {
                request_id,
                status,
                tasks,
            }
        ),
        any::<u64>().prop_map(|request_id| ServerFrame::Ack { request_id }),
        (any::<u64>(), arb_fault())
            .prop_map(|(request_id, fault)| ServerFrame::Fault { request_id, fault }),
        (arb_status(), ".{0,32}")
            .prop_map(|(status, origin)| ServerFrame::Changed(RemoteChange { status, origin })),
    ]
}

// --- Property tests ---

proptest! {
    /// Any client frame survives the codec unchanged.
    #[test]
    fn client_frames_survive_the_codec(frame in arb_client_frame()) {
        let bytes = gateway::encode_client(&frame).expect("encode should succeed");
        let decoded = gateway::decode_client(&bytes).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Any server frame survives the codec and keeps its correlation id.
    #[test]
    fn server_frames_survive_the_codec(frame in arb_server_frame()) {
        let bytes = gateway::encode_server(&frame).expect("encode should succeed");
        let decoded = gateway::decode_server(&bytes).expect("decode should succeed");
        prop_assert_eq!(decoded.request_id(), frame.request_id());
        prop_assert_eq!(frame, decoded);
    }

    /// Random bytes never panic the client decoder.
    #[test]
    fn random_bytes_decode_client_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = gateway::decode_client(&bytes);
    }

    /// Random bytes never panic the server decoder.
    #[test]
    fn random_bytes_decode_server_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = gateway::decode_server(&bytes);
    }

    /// Normalising an already normalised key changes nothing.
    #[test]
    fn status_key_normalisation_is_idempotent(name in ".{0,32}") {
        let once = StatusKey::new(&name);
        let twice = StatusKey::new(once.as_str());
        prop_assert_eq!(once, twice);
    }
}
