//! Lease operation span helpers.

use tracing::Span;

use crate::model::{ItemId, ItemState, Owner};

/// Start a span for one lease operation.
///
/// `lease.item` is left empty for `claim`, which learns its item only on
/// success; fill it with [`record_item`].
pub fn start_lease_span(operation: &'static str, item_id: Option<&ItemId>, owner: &Owner) -> Span {
    let span = tracing::info_span!(
        "lease",
        "lease.operation" = operation,
        "lease.owner" = %owner,
        "lease.item" = tracing::field::Empty,
    );
    if let Some(id) = item_id {
        record_item(&span, id);
    }
    span
}

pub fn record_item(span: &Span, item_id: &ItemId) {
    span.record("lease.item", tracing::field::display(item_id));
}

/// Record a state transition event on the given span.
pub fn record_transition(span: &Span, from: ItemState, to: ItemState) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
