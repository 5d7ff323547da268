//! Composite query fan-out and result aggregation.
//!
//! When a primary response decodes into a child fan-out plan, the parent
//! moves to `WaitingForChildToComplete` and each child becomes an ordinary
//! registry record carrying a back-reference to its parent slot. Children
//! report here as they reach terminal states; results land at the slot
//! matching each child's fan-out position, so the parent's flattened result
//! is deterministic regardless of completion order. The parent completes
//! only once every slot has resolved, even when a child has already failed.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info};

use super::error::QueryError;
use super::query::{CommandKind, FanOutMode, Priority, QueryId, ResultBuffer, SaRequest};
use super::record::{ChildOutcome, ChildSet, ChildSlot, ParentLink};
use super::registry::{
    complete, insert_record, AllocSpec, Completion, EngineAction, RegistryInner,
};
use super::state::QueryState;

/// Retry policy a child inherits from its parent.
struct Inherited {
    max_retries: u32,
    attempt_timeout: Duration,
    priority: Priority,
}

/// Spawn the fan-out plan decoded from a parent's primary response.
///
/// Parallel families issue every child immediately; serialized families
/// issue only the first and queue the rest on the parent. An empty plan
/// completes the parent at once with an empty result.
pub(super) fn fan_out(
    inner: &mut RegistryInner,
    parent_id: QueryId,
    children: Vec<SaRequest>,
    actions: &mut Vec<EngineAction>,
) {
    if children.is_empty() {
        complete(
            inner,
            parent_id,
            Completion::Success(ResultBuffer::new()),
            actions,
        );
        return;
    }

    let total = children.len();
    let (mode, inherited) = {
        let Some(parent) = inner.records.get_mut(&parent_id) else {
            debug_assert!(false, "fan-out for a missing parent");
            return;
        };
        let mode = parent.request.fan_out;
        let inherited = Inherited {
            max_retries: parent.control.max_retries,
            attempt_timeout: parent.control.attempt_timeout,
            priority: parent.priority,
        };
        info!(
            query_id = %parent_id,
            children = total,
            serialized = mode == FanOutMode::Serialized,
            "composite query fan-out"
        );

        let slots = (0..total)
            .map(|_| ChildSlot {
                id: None,
                outcome: None,
            })
            .collect();
        parent.children = Some(ChildSet {
            mode,
            slots,
            queued: VecDeque::new(),
        });
        parent.set_state(QueryState::WaitingForChildToComplete);
        (mode, inherited)
    };

    for (position, request) in children.into_iter().enumerate() {
        if mode == FanOutMode::Parallel || position == 0 {
            issue_child(inner, parent_id, position, request, &inherited, actions);
        } else if let Some(parent) = inner.records.get_mut(&parent_id) {
            if let Some(children) = parent.children.as_mut() {
                children.queued.push_back((position, request));
            }
        }
    }
}

/// Allocate one child record and schedule its first send.
fn issue_child(
    inner: &mut RegistryInner,
    parent_id: QueryId,
    position: usize,
    request: SaRequest,
    inherited: &Inherited,
    actions: &mut Vec<EngineAction>,
) {
    let allocated = insert_record(
        inner,
        AllocSpec {
            request,
            kind: CommandKind::InformationQuery,
            max_retries: inherited.max_retries,
            attempt_timeout: inherited.attempt_timeout,
            priority: inherited.priority,
            parent: Some(ParentLink {
                id: parent_id,
                slot: position,
            }),
            self_issued: false,
            on_complete: None,
        },
    );
    debug!(
        parent = %parent_id,
        child = %allocated.id,
        position,
        "child query issued"
    );
    if let Some(parent) = inner.records.get_mut(&parent_id) {
        if let Some(children) = parent.children.as_mut() {
            children.slots[position].id = Some(allocated.id);
        }
    }
    actions.push(EngineAction::Send {
        id: allocated.id,
        request: allocated.request,
    });
}

/// Record a child's terminal outcome at its parent slot.
///
/// For serialized families the next queued child is issued here, unless the
/// parent is being destroyed. Completes the parent once every slot has
/// resolved.
pub(super) fn child_terminal(
    inner: &mut RegistryInner,
    link: ParentLink,
    outcome: ChildOutcome,
    actions: &mut Vec<EngineAction>,
) {
    let (next, inherited) = {
        let Some(parent) = inner.records.get_mut(&link.id) else {
            debug_assert!(false, "parent reclaimed while a child was live");
            return;
        };
        let destroy_pending = parent.destroy_pending;
        let inherited = Inherited {
            max_retries: parent.control.max_retries,
            attempt_timeout: parent.control.attempt_timeout,
            priority: parent.priority,
        };
        let Some(children) = parent.children.as_mut() else {
            debug_assert!(false, "child reported to a parent without fan-out");
            return;
        };
        debug_assert!(
            children.slots[link.slot].outcome.is_none(),
            "child slot resolved twice"
        );
        children.slots[link.slot].outcome = Some(outcome);

        let next = if children.mode == FanOutMode::Serialized && !destroy_pending {
            children.queued.pop_front()
        } else {
            None
        };
        (next, inherited)
    };

    if let Some((position, request)) = next {
        issue_child(inner, link.id, position, request, &inherited, actions);
    }
    maybe_complete_parent(inner, link.id, actions);
}

/// Complete a composite parent once all of its slots have resolved.
///
/// The parent's status is decided by the first failed slot in fan-out
/// position order, keeping the outcome deterministic under concurrent child
/// completions; only an all-success fan-out yields the concatenated result.
pub(super) fn maybe_complete_parent(
    inner: &mut RegistryInner,
    parent_id: QueryId,
    actions: &mut Vec<EngineAction>,
) {
    let decision = {
        let Some(parent) = inner.records.get(&parent_id) else {
            return;
        };
        if parent.state.is_terminal() {
            return;
        }
        let Some(children) = parent.children.as_ref() else {
            return;
        };
        if !children.all_done() {
            return;
        }
        debug_assert!(children.queued.is_empty());

        if parent.destroy_pending {
            Completion::Cancelled
        } else {
            let mut failure = None;
            for slot in &children.slots {
                match &slot.outcome {
                    Some(ChildOutcome::Failure(err)) => {
                        failure = Some(err.clone());
                        break;
                    }
                    Some(ChildOutcome::Cancelled) => {
                        // Only reachable when the engine is tearing down
                        // underneath a live composite.
                        failure = Some(QueryError::EngineDown);
                        break;
                    }
                    _ => {}
                }
            }
            match failure {
                Some(err) => Completion::Failure(err),
                None => {
                    let mut buffer = ResultBuffer::new();
                    for slot in &children.slots {
                        if let Some(ChildOutcome::Success(records)) = &slot.outcome {
                            buffer.extend(records.clone());
                        }
                    }
                    Completion::Success(buffer)
                }
            }
        }
    };
    complete(inner, parent_id, decision, actions);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::engine::decode::DecodedResponse;
    use crate::engine::query::QueryOutcome;
    use crate::engine::registry::QueryRegistry;

    fn registry() -> Arc<QueryRegistry> {
        Arc::new(QueryRegistry::new(8))
    }

    fn parent_spec(mode: FanOutMode) -> AllocSpec {
        let request = match mode {
            FanOutMode::Parallel => SaRequest::new(1, vec![]),
            FanOutMode::Serialized => SaRequest::new(1, vec![]).serialized(),
        };
        AllocSpec {
            request,
            kind: CommandKind::InformationQuery,
            max_retries: 2,
            attempt_timeout: Duration::from_millis(100),
            priority: Priority::NORMAL,
            parent: None,
            self_issued: false,
            on_complete: None,
        }
    }

    /// Drive a parent through its primary response into fan-out, returning
    /// the child ids in fan-out position order (issued ones only).
    fn fan_out_parent(
        registry: &Arc<QueryRegistry>,
        parent_id: QueryId,
        children: Vec<SaRequest>,
    ) -> Vec<QueryId> {
        registry.mark_sent(parent_id, Instant::now());
        let token = registry.begin_processing(parent_id).unwrap();
        let actions = token.finish(Ok(DecodedResponse::FanOut { children }));
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Send { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Complete a child with a single-record success.
    fn complete_child(registry: &Arc<QueryRegistry>, child_id: QueryId, record: Vec<u8>) -> Vec<QueryId> {
        registry.mark_sent(child_id, Instant::now());
        let token = registry.begin_processing(child_id).unwrap();
        let actions = token.finish(Ok(DecodedResponse::Records(
            ResultBuffer::from_records(vec![record]),
        )));
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Send { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn claim_outcome(registry: &Arc<QueryRegistry>, id: QueryId) -> QueryOutcome {
        registry
            .remove_if_terminal(id)
            .expect("parent should be terminal")
            .outcome
    }

    #[test]
    fn test_parallel_results_ordered_by_position() {
        let registry = registry();
        let parent = registry.allocate(parent_spec(FanOutMode::Parallel)).unwrap();
        let child_ids = fan_out_parent(
            &registry,
            parent.id,
            vec![
                SaRequest::new(10, vec![]),
                SaRequest::new(11, vec![]),
                SaRequest::new(12, vec![]),
            ],
        );
        assert_eq!(child_ids.len(), 3, "parallel fan-out issues all children");

        // Complete children in reverse arrival order.
        complete_child(&registry, child_ids[2], vec![2]);
        complete_child(&registry, child_ids[0], vec![0]);
        complete_child(&registry, child_ids[1], vec![1]);

        match claim_outcome(&registry, parent.id) {
            QueryOutcome::Success(buffer) => {
                assert_eq!(buffer.records(), &[vec![0], vec![1], vec![2]]);
            }
            other => panic!("unexpected outcome: {}", other),
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_parent_waits_for_all_children() {
        let registry = registry();
        let parent = registry.allocate(parent_spec(FanOutMode::Parallel)).unwrap();
        let child_ids = fan_out_parent(
            &registry,
            parent.id,
            vec![SaRequest::new(10, vec![]), SaRequest::new(11, vec![])],
        );

        complete_child(&registry, child_ids[0], vec![0]);
        assert!(
            registry.remove_if_terminal(parent.id).is_none(),
            "parent must wait for the second child"
        );

        complete_child(&registry, child_ids[1], vec![1]);
        assert!(claim_outcome(&registry, parent.id).is_success());
    }

    #[test]
    fn test_first_failure_by_position_wins() {
        let registry = registry();
        let parent = registry.allocate(parent_spec(FanOutMode::Parallel)).unwrap();
        let child_ids = fan_out_parent(
            &registry,
            parent.id,
            vec![
                SaRequest::new(10, vec![]),
                SaRequest::new(11, vec![]),
                SaRequest::new(12, vec![]),
            ],
        );

        // Child at position 2 fails first (arrival order), then position 1
        // fails, then position 0 succeeds. Position order decides: the
        // failure at position 1 wins.
        registry.mark_sent(child_ids[2], Instant::now());
        let token = registry.begin_processing(child_ids[2]).unwrap();
        token.finish(Ok(DecodedResponse::Error {
            protocol_status: 0x0200,
        }));

        registry.mark_sent(child_ids[1], Instant::now());
        let token = registry.begin_processing(child_ids[1]).unwrap();
        token.finish(Ok(DecodedResponse::Error {
            protocol_status: 0x0100,
        }));

        complete_child(&registry, child_ids[0], vec![0]);

        assert_eq!(
            claim_outcome(&registry, parent.id),
            QueryOutcome::Failure(QueryError::Protocol { status: 0x0100 })
        );
    }

    #[test]
    fn test_serialized_children_issued_one_at_a_time() {
        let registry = registry();
        let parent = registry
            .allocate(parent_spec(FanOutMode::Serialized))
            .unwrap();
        let first = fan_out_parent(
            &registry,
            parent.id,
            vec![
                SaRequest::new(10, vec![]),
                SaRequest::new(11, vec![]),
                SaRequest::new(12, vec![]),
            ],
        );
        assert_eq!(first.len(), 1, "only the first child is issued");
        assert_eq!(registry.len(), 2, "parent plus one live child");

        let second = complete_child(&registry, first[0], vec![0]);
        assert_eq!(second.len(), 1, "completion triggers the next child");

        let third = complete_child(&registry, second[0], vec![1]);
        assert_eq!(third.len(), 1);

        let none = complete_child(&registry, third[0], vec![2]);
        assert!(none.is_empty(), "no child after the last");

        match claim_outcome(&registry, parent.id) {
            QueryOutcome::Success(buffer) => {
                assert_eq!(buffer.records(), &[vec![0], vec![1], vec![2]]);
            }
            other => panic!("unexpected outcome: {}", other),
        }
    }

    #[test]
    fn test_serialized_chain_continues_after_child_failure() {
        // The parent still drains every child before failing, so no child
        // record leaks.
        let registry = registry();
        let parent = registry
            .allocate(parent_spec(FanOutMode::Serialized))
            .unwrap();
        let first = fan_out_parent(
            &registry,
            parent.id,
            vec![SaRequest::new(10, vec![]), SaRequest::new(11, vec![])],
        );

        registry.mark_sent(first[0], Instant::now());
        let token = registry.begin_processing(first[0]).unwrap();
        let actions = token.finish(Ok(DecodedResponse::Error {
            protocol_status: 0x0700,
        }));
        let second: Vec<QueryId> = actions
            .iter()
            .filter_map(|a| match a {
                EngineAction::Send { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(second.len(), 1, "chain continues past a failed child");

        complete_child(&registry, second[0], vec![1]);
        assert_eq!(
            claim_outcome(&registry, parent.id),
            QueryOutcome::Failure(QueryError::Protocol { status: 0x0700 })
        );
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_empty_fan_out_completes_immediately() {
        let registry = registry();
        let parent = registry.allocate(parent_spec(FanOutMode::Parallel)).unwrap();
        let issued = fan_out_parent(&registry, parent.id, vec![]);
        assert!(issued.is_empty());

        match claim_outcome(&registry, parent.id) {
            QueryOutcome::Success(buffer) => assert!(buffer.is_empty()),
            other => panic!("unexpected outcome: {}", other),
        }
    }

    #[test]
    fn test_cancel_composite_cancels_children() {
        let registry = registry();
        let parent = registry
            .allocate(parent_spec(FanOutMode::Serialized))
            .unwrap();
        let issued = fan_out_parent(
            &registry,
            parent.id,
            vec![
                SaRequest::new(10, vec![]),
                SaRequest::new(11, vec![]),
                SaRequest::new(12, vec![]),
            ],
        );
        registry.mark_sent(issued[0], Instant::now());

        registry.cancel(parent.id);

        assert_eq!(registry.len(), 0, "parent and children all reclaimed");
        let outcome = parent.outcome_slot.lock().unwrap().clone().unwrap();
        assert_eq!(outcome, QueryOutcome::Cancelled);
    }

    #[test]
    fn test_cancel_composite_with_processing_child_defers() {
        let registry = registry();
        let parent = registry.allocate(parent_spec(FanOutMode::Parallel)).unwrap();
        let children = fan_out_parent(
            &registry,
            parent.id,
            vec![SaRequest::new(10, vec![]), SaRequest::new(11, vec![])],
        );

        // One child is mid-decode when the cancel lands.
        registry.mark_sent(children[0], Instant::now());
        let token = registry.begin_processing(children[0]).unwrap();

        registry.cancel(parent.id);
        assert!(
            parent.outcome_slot.lock().unwrap().is_none(),
            "parent must wait for the processing child"
        );

        // The child's decode result is discarded; its release completes the
        // cancelled parent.
        let actions = token.finish(Ok(DecodedResponse::Records(
            ResultBuffer::from_records(vec![vec![9]]),
        )));
        for action in actions {
            if let EngineAction::Complete { id } = action {
                if let Some(delivery) = registry.remove_if_terminal(id) {
                    delivery.dispatch();
                }
            }
        }
        let outcome = parent.outcome_slot.lock().unwrap().clone().unwrap();
        assert_eq!(outcome, QueryOutcome::Cancelled);
        assert_eq!(registry.len(), 0);
    }
}
