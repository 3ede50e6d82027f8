//! Every `(from, to)` pair of node states against the store.

use fleet_state::{
    NewNode, Node, NodeConfig, NodeSearch, NodeState, StateError, StateStore, Transition,
};

fn config() -> NodeConfig {
    NodeConfig {
        image: "runner:1".into(),
        cpu_milli: 500,
        memory_mb: 512,
        storage_mb: 20_000,
        is_tracing_enabled: false,
        is_profiling_enabled: false,
        idle_max_duration_ms: 1_800_000,
        execution_timeout_secs: 900,
        provisioned_concurrency: 10,
    }
}

fn transition_to(state: NodeState) -> Option<Transition> {
    Some(match state {
        NodeState::Pending => return None,
        NodeState::Starting => Transition::Start,
        NodeState::Running => Transition::Run {
            url: "http://localhost:1".into(),
        },
        NodeState::Outdated => Transition::Outdate,
        NodeState::Finishing => Transition::Finish,
        NodeState::Idle => Transition::Idle,
        NodeState::Terminated => Transition::Terminate,
        NodeState::Error => Transition::Fail {
            reason: "boom".into(),
        },
    })
}

/// Seed a node directly in `state`.
fn seed(store: &StateStore, routing_id: &str, state: NodeState) -> Node {
    let node = store
        .create_node(&NewNode::from_config(routing_id, 1, &config()))
        .unwrap();
    let seeded = Node { state, ..node };
    store.put_node(&seeded).unwrap();
    seeded
}

fn expected(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    matches!(
        (from, to),
        (Pending, Starting)
            | (Pending, Error)
            | (Starting, Running)
            | (Starting, Error)
            | (Running, Outdated)
            | (Running, Idle)
            | (Running, Error)
            | (Outdated, Finishing)
            | (Outdated, Error)
            | (Finishing, Idle)
            | (Finishing, Error)
            | (Idle, Terminated)
    )
}

#[test]
fn transition_graph_is_enforced_by_store() {
    let store = StateStore::open_in_memory().unwrap();

    for from in NodeState::ALL {
        for to in NodeState::ALL {
            let Some(transition) = transition_to(to) else {
                continue;
            };
            let routing_id = format!("{from}-{to}");
            let node = seed(&store, &routing_id, from);

            match store.transition_node(node.id, transition) {
                Ok(moved) => {
                    assert!(expected(from, to), "{from} -> {to} should be rejected");
                    assert_eq!(moved.state, to);
                    assert!(moved.last_state_transition_at > node.last_state_transition_at);

                    let by_new = store
                        .search_all_nodes(&NodeSearch::routing(&routing_id).with_states(&[to]))
                        .unwrap();
                    assert_eq!(by_new.len(), 1, "{from} -> {to} missing from index");
                    let by_old = store
                        .search_all_nodes(&NodeSearch::routing(&routing_id).with_states(&[from]))
                        .unwrap();
                    assert!(by_old.is_empty(), "{from} -> {to} left stale index entry");
                }
                Err(StateError::InvalidTransition { from: f, to: t, .. }) => {
                    assert!(!expected(from, to), "{from} -> {to} should be allowed");
                    assert_eq!((f, t), (from, to));
                    let unchanged = store.get_node(node.id).unwrap().unwrap();
                    assert_eq!(unchanged, node);
                }
                Err(e) => panic!("{from} -> {to}: unexpected error {e}"),
            }
        }
    }
}

#[test]
fn rapid_transitions_keep_timestamps_increasing() {
    let store = StateStore::open_in_memory().unwrap();
    let node = store
        .create_node(&NewNode::from_config("env-1", 1, &config()))
        .unwrap();
    let path = [
        Transition::Start,
        Transition::Run {
            url: "http://localhost:1".into(),
        },
        Transition::Outdate,
        Transition::Finish,
        Transition::Idle,
        Transition::Terminate,
    ];
    let mut last = node.last_state_transition_at;
    for t in path {
        let moved = store.transition_node(node.id, t).unwrap();
        assert!(moved.last_state_transition_at > last);
        last = moved.last_state_transition_at;
    }
}

#[test]
fn run_records_url_and_fail_records_reason() {
    let store = StateStore::open_in_memory().unwrap();
    let a = seed(&store, "env-a", NodeState::Starting);
    let a = store
        .transition_node(
            a.id,
            Transition::Run {
                url: "http://10.0.0.1:8080".into(),
            },
        )
        .unwrap();
    assert_eq!(a.url.as_deref(), Some("http://10.0.0.1:8080"));
    assert_eq!(a.error, None);

    let b = seed(&store, "env-b", NodeState::Outdated);
    let b = store
        .transition_node(
            b.id,
            Transition::Fail {
                reason: "node_lost".into(),
            },
        )
        .unwrap();
    assert_eq!(b.error.as_deref(), Some("node_lost"));
}

#[test]
fn unknown_node_is_not_found() {
    let store = StateStore::open_in_memory().unwrap();
    let err = store.transition_node(77, Transition::Start).unwrap_err();
    assert!(matches!(err, StateError::NodeNotFound(77)));
}
