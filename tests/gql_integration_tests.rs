//! Integration Tests - Graph Command Language
//!
//! End-to-end batches against a fresh engine: parsing, execution, change
//! records and batch atomicity.

use std::sync::Arc;
use strand_core::*;

fn engine_with_log() -> (GraphEngine, Arc<MemoryChangeLog>) {
    let log = Arc::new(MemoryChangeLog::new());
    let engine = GraphEngine::new().with_sink(log.clone());
    (engine, log)
}

/// Test: two nodes and a unique edge in one batch
#[test]
fn test_add_batch_scenario() {
    let (mut engine, log) = engine_with_log();

    let result = engine
        .execute("add node key=node1; add node key=node2; add unique edge fromKey=node1,toKey=node2;")
        .unwrap();

    assert_eq!(engine.map().node_count(), 2);
    assert_eq!(engine.map().edge_count(), 1);

    let records = log.records();
    let types: Vec<ChangeTrxType> = records.iter().map(|r| r.trx_type).collect();
    assert_eq!(
        types,
        vec![ChangeTrxType::NodeAdd, ChangeTrxType::NodeAdd, ChangeTrxType::EdgeAdd]
    );
    assert!(records.iter().all(|r| r.trx_id == result.trx_id));
    assert_eq!(engine.last_outcome(), Some(ExecutionState::Committed));
    assert_eq!(engine.state(), ExecutionState::Idle);
}

/// Test: update then delete capture before/after images
#[test]
fn test_update_then_delete_scenario() {
    let (mut engine, log) = engine_with_log();
    engine.execute("add node key=node1;").unwrap();
    log.clear();

    engine.execute("update (key=node1) set t1=v1;").unwrap();
    engine.execute("delete (key=node1);").unwrap();

    let records = log.records();
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].trx_type, ChangeTrxType::NodeChange);
    let before = records[0].before.as_ref().and_then(|e| e.as_node()).unwrap();
    let after = records[0].after.as_ref().and_then(|e| e.as_node()).unwrap();
    assert!(before.tags.is_empty());
    assert_eq!(after.tags.to_string(), "t1=v1");

    assert_eq!(records[1].trx_type, ChangeTrxType::NodeDelete);
    let deleted = records[1].before.as_ref().and_then(|e| e.as_node()).unwrap();
    assert_eq!(deleted.tags.value("t1"), Some("v1"));
    assert!(engine.map().is_empty());
}

/// Test: unique edges conflict, plain edges repeat
#[test]
fn test_unique_edge_conflict() {
    let mut engine = GraphEngine::new();
    engine.execute("add node key=a; add node key=b;").unwrap();

    engine.execute("add unique edge fromKey=a, toKey=b, edgeType=member;").unwrap();
    let err = engine
        .execute("add unique edge fromKey=A, toKey=B, edgeType=Member;")
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(engine.map().edge_count(), 1);

    engine.execute("add edge fromKey=a, toKey=b, edgeType=visit;").unwrap();
    engine.execute("add edge fromKey=a, toKey=b, edgeType=visit;").unwrap();
    assert_eq!(engine.map().edge_count(), 3);
}

/// Test: a failing statement reverts the whole batch
#[test]
fn test_batch_is_atomic() {
    let (mut engine, log) = engine_with_log();
    engine.execute("add node key=existing;").unwrap();
    log.clear();

    let err = engine
        .execute("add node key=fresh; update (key=fresh) set t=1; add node key=existing;")
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(engine.last_outcome(), Some(ExecutionState::Failed));
    assert_eq!(engine.state(), ExecutionState::Idle);

    assert!(!engine.map().contains_node("fresh"));
    assert_eq!(engine.map().node_count(), 1);
    assert!(log.is_empty());
}

/// Test: mutations change nothing when the text does not parse
#[test]
fn test_syntax_error_is_positioned() {
    let mut engine = GraphEngine::new();
    let err = engine.execute("add node key=a; add nod key=b;").unwrap_err();

    assert!(err.is_bad_request());
    match err {
        GraphError::Syntax(syntax) => {
            assert_eq!(syntax.token.as_deref(), Some("nod"));
            assert_eq!(syntax.offset, 20);
        }
        other => panic!("expected syntax error, got {:?}", other),
    }
    assert!(engine.map().is_empty());
}

/// Test: principal -> member -> group -> channel -> channel traversal
#[test]
fn test_multi_hop_select() {
    let mut engine = GraphEngine::new();
    engine
        .execute(
            "add node key=user1, tags='kind=principal';
             add node key=group1, tags='kind=group';
             add node key=group2, tags='kind=group';
             add node key=chan1, tags='kind=channel';
             add node key=chan2, tags='kind=channel';
             add unique edge fromKey=user1, toKey=group1, edgeType=member;
             add unique edge fromKey=user1, toKey=group2, edgeType=member;
             add unique edge fromKey=group1, toKey=chan1, edgeType=channel;
             add unique edge fromKey=group2, toKey=chan1, edgeType=channel;
             add unique edge fromKey=group2, toKey=chan2, edgeType=channel;",
        )
        .unwrap();

    let result = engine
        .execute(
            "select (key=user1) -> [edgeType=member] -> (kind=group) as groups
                 -> [edgeType=channel] -> (*) as channels;",
        )
        .unwrap();

    let keys: Vec<&str> = result.nodes.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(keys, vec!["chan1", "chan2"]);
    assert_eq!(result.alias_nodes("groups").unwrap().len(), 2);
    assert_eq!(result.alias_nodes("channels").unwrap().len(), 2);
    assert!(!result.is_mutation());

    let back = engine.execute("select (key=chan1) <- [edgeType=channel] <- (*);").unwrap();
    let keys: Vec<&str> = back.nodes.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(keys, vec!["group1", "group2"]);
}

/// Test: keys, tag names and reserved attributes ignore case
#[test]
fn test_case_insensitive_lookup() {
    let mut engine = GraphEngine::new();
    engine.execute("add node KEY=Node1, Tags='Color=Red';").unwrap();

    let result = engine.execute("select (key=node1);").unwrap();
    assert_eq!(result.nodes.len(), 1);
    assert_eq!(result.nodes[0].key, "node1");
    assert_eq!(result.nodes[0].tags.value("color"), Some("Red"));
}

/// Test: tag predicates and wildcard selects
#[test]
fn test_tag_predicates() {
    let mut engine = GraphEngine::new();
    engine
        .execute("add node key=a, active, tier=gold; add node key=b, active, tier=silver; add node key=c;")
        .unwrap();

    assert_eq!(engine.execute("select (active);").unwrap().nodes.len(), 2);
    assert_eq!(engine.execute("select (active, tier=gold);").unwrap().nodes.len(), 1);
    assert_eq!(engine.execute("select (*);").unwrap().nodes.len(), 3);

    let updated = engine.execute("update (active) set tier=bronze;").unwrap();
    assert_eq!(updated.changes.len(), 2);
    assert_eq!(engine.execute("select (tier=bronze);").unwrap().nodes.len(), 2);
}

/// Test: reserved attributes in the wrong place are bad requests
#[test]
fn test_reserved_attribute_misuse() {
    let mut engine = GraphEngine::new();
    for query in [
        "add node tags=x;",
        "add node key=a, fromKey=b;",
        "add edge fromKey=a;",
        "add edge fromKey=a, toKey=b, link=x;",
        "update (key=a) set key=b;",
        "add unique node key=a;",
    ] {
        let err = engine.execute(query).unwrap_err();
        assert!(err.is_bad_request(), "{} -> {:?}", query, err);
    }
    assert!(engine.map().is_empty());
}

/// Test: stats are refreshed after each committed batch
#[test]
fn test_stats_follow_batches() {
    let mut engine = GraphEngine::new();
    engine
        .execute("add node key=a; add node key=b; add edge fromKey=a, toKey=b, edgeType=member;")
        .unwrap();

    let stats = engine.map().stats();
    assert_eq!(stats.node_count, 2);
    assert_eq!(stats.edge_count, 1);
    assert_eq!(stats.edge_types.get("member"), Some(&1));

    engine.execute("delete [edgeType=member];").unwrap();
    assert_eq!(engine.map().stats().edge_count, 0);
}
