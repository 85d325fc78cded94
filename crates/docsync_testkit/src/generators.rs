//! Property-based test generators using proptest.

use docsync_protocol::{Document, Fields, Version};
use proptest::prelude::*;

/// One application-side step against a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOp {
    /// Attach a new listener.
    Listen,
    /// Detach the listener at this index (modulo the number attached).
    Unlisten(usize),
}

/// Strategy for a single listen step.
pub fn listen_op_strategy() -> impl Strategy<Value = ListenOp> {
    prop_oneof![
        Just(ListenOp::Listen),
        (0usize..8).prop_map(ListenOp::Unlisten),
    ]
}

/// Strategy for listen/unlisten sequences issued before the server answers.
pub fn listen_ops_strategy() -> impl Strategy<Value = Vec<ListenOp>> {
    prop::collection::vec(listen_op_strategy(), 1..24)
}

/// Strategy for flat document fields.
pub fn fields_strategy() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,6}").expect("Invalid regex"),
        any::<i32>().prop_map(serde_json::Value::from),
        0..4,
    )
}

/// Strategy for documents with distinct keys in one collection.
pub fn documents_strategy(collection: &'static str) -> impl Strategy<Value = Vec<Document>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z0-9]{1,8}").expect("Invalid regex"),
        (1u64..100, fields_strategy()),
        0..12,
    )
    .prop_map(move |entries| {
        entries
            .into_iter()
            .map(|(id, (version, data))| {
                Document::new(format!("{collection}/{id}"), Version(version), data)
            })
            .collect()
    })
}
