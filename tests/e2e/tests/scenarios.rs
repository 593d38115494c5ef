//! Black-box scenario tests against the public [`gateway_core::Engine`] API.

use std::sync::Arc;

use gateway_core::graph::{EdgeSource, EdgeType, NodeKind};
use gateway_core::scorer::{ScorerConfig, ShgatScorer};
use gateway_core::trace::TraceStats;
use gateway_core::{CandidateFilter, Intent, RankOptions};
use gateway_e2e_support::harness::small_config;
use gateway_e2e_support::{unit_embedding, StubEmbeddingModel, TestDataFactory, TestEngineManager};
use uuid::Uuid;

const DIM: usize = 16;

/// Scenario 1: an empty graph ranks purely by semantic cosine similarity,
/// since `alpha` is 1.0 with no graph structure to blend in.
#[test]
fn cold_start_ranks_by_semantic_similarity() {
    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;

    let ids = TestDataFactory::seed_tools(engine, 5, DIM);
    // tool:2's embedding is the query itself, so it must win outright.
    let query = unit_embedding(2.0, DIM);

    let response = engine
        .rank(Intent::Embedding(query), None, &RankOptions { min_score: 0.0, ..RankOptions::default() })
        .expect("rank should succeed on a fresh graph");

    assert!(!response.items.is_empty());
    assert_eq!(response.items[0].id, ids[2]);
    assert!(response.items[0].semantic > 0.99);
    // No edges exist yet, so every candidate's graph term is its floor.
    assert!(response.items.windows(2).all(|w| w[0].score >= w[1].score));
}

/// Scenario 2: a tool with a penalized success rate must rank strictly
/// below an otherwise-identical tool with a boosted success rate, by
/// exactly the `reliability_boost`/`reliability_penalty` ratio the config
/// defines (spec's "ratio ~= 1.2/0.1").
#[test]
fn reliability_band_separates_identical_tools() {
    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;

    engine.add_tool("good:tool", "a reliable tool").unwrap();
    engine.add_tool("bad:tool", "an unreliable tool").unwrap();
    let embedding = unit_embedding(1.0, DIM);
    engine.set_tool_embedding("good:tool", embedding.clone()).unwrap();
    engine.set_tool_embedding("bad:tool", embedding.clone()).unwrap();

    // Boost band: >= reliability_boost_threshold success rate.
    for _ in 0..10 {
        engine.touch_tool_use("good:tool", true).unwrap();
    }
    // Penalty band: <= reliability_penalty_threshold success rate.
    for _ in 0..10 {
        engine.touch_tool_use("bad:tool", false).unwrap();
    }

    let response = engine
        .rank(
            Intent::Embedding(embedding),
            None,
            &RankOptions { min_score: 0.0, limit: 10, ..RankOptions::default() },
        )
        .unwrap();

    let good = response.items.iter().find(|i| i.id == "good:tool").unwrap();
    let bad = response.items.iter().find(|i| i.id == "bad:tool").unwrap();
    assert!(good.score > bad.score);

    let config = engine.config();
    let expected_ratio = config.reliability_boost / config.reliability_penalty;
    let actual_ratio = good.reliability / bad.reliability;
    assert!(
        (actual_ratio - expected_ratio).abs() < 1e-4,
        "expected reliability ratio {expected_ratio}, got {actual_ratio}"
    );
}

/// Scenario 3: attempting to introduce a `contains` cycle through the
/// capability event sink is rejected and leaves the graph snapshot
/// unchanged.
#[test]
fn contains_cycle_is_rejected_and_snapshot_unchanged() {
    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;

    let tools = TestDataFactory::seed_tools(engine, 2, DIM);
    let parent = TestDataFactory::seed_capability(engine, "parent", vec![tools[0].clone()], Some(DIM));
    let child = TestDataFactory::seed_capability(engine, "child", vec![tools[1].clone(), parent.clone()], Some(DIM));

    let before = engine.graph_snapshot();
    let before_parent_members = before.capabilities.get(&parent).unwrap().members.clone();

    // parent already sits below child; making child a member of parent
    // would close a cycle and must be rejected.
    engine.on_capability_updated(&parent, Some(vec![tools[0].clone(), child.clone()]), None);

    let after = engine.graph_snapshot();
    assert_eq!(after.capabilities.get(&parent).unwrap().members, before_parent_members);
    assert_eq!(after.capabilities.len(), before.capabilities.len());
}

/// Scenario 4: a head disabled by the ablation mask contributes an exact
/// zero weight, and a structure-only candidate set ranks differently from
/// a semantic-only one (the graph and semantic terms are not interchangeable).
#[test]
fn ablated_heads_are_exactly_zero_and_terms_diverge() {
    let scorer_config = ScorerConfig::from_gateway_config(&small_config(DIM), 4).with_active_heads(vec![true, true, false, false]);
    let scorer = ShgatScorer::new(DIM, scorer_config, 7);

    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;
    let ids = TestDataFactory::seed_tools(engine, 3, DIM);
    let snapshot = engine.graph_snapshot();

    let query = unit_embedding(0.5, DIM);
    let output = scorer.score(&snapshot, &query, &ids[0], NodeKind::Tool, &TraceStats::default()).unwrap();

    assert_eq!(output.head_weights.len(), 4);
    assert_eq!(output.head_weights[2], 0.0);
    assert_eq!(output.head_weights[3], 0.0);

    // Build one tool reachable only through a graph edge (no embedding
    // similarity to the query) and one reachable only through semantics
    // (no edge). Their unified rankings must diverge.
    engine.add_tool("graph:only", "reached only via edge").unwrap();
    engine
        .observe_edge(&ids[0], "graph:only", EdgeSource::Learned, EdgeType::Sequence)
        .unwrap();
    engine.set_tool_embedding("graph:only", unit_embedding(999.0, DIM)).unwrap();

    let response = engine
        .rank(
            Intent::Embedding(unit_embedding(0.5, DIM)),
            None,
            &RankOptions {
                min_score: 0.0,
                context_tool_ids: vec![ids[0].clone()],
                filter: CandidateFilter::Ids(vec![ids[0].clone(), "graph:only".to_string()]),
                ..RankOptions::default()
            },
        )
        .unwrap();
    let semantic_leader = response.items.iter().find(|i| i.id == ids[0]).unwrap();
    let graph_leader = response.items.iter().find(|i| i.id == "graph:only").unwrap();
    assert_ne!(semantic_leader.semantic, graph_leader.semantic);
    assert_ne!(semantic_leader.graph, graph_leader.graph);
}

/// Scenario 5: merging two capabilities preserves aggregate usage/success
/// counts (sum, not overwrite).
#[test]
fn capability_merge_preserves_usage_counts() {
    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;

    let tools = TestDataFactory::seed_tools(engine, 2, DIM);
    let a = TestDataFactory::seed_capability(engine, "alpha", vec![tools[0].clone()], Some(DIM));
    let b = TestDataFactory::seed_capability(engine, "alpha", vec![tools[0].clone()], Some(DIM));
    assert_eq!(a, b, "identical content must hash to the same fqdn and share storage");

    // Exercise the merge path directly against two distinct ids sharing a
    // hash by constructing a second capability under a different action
    // name, then merging it under the first's identity.
    let c = TestDataFactory::seed_capability(engine, "beta", vec![tools[1].clone()], Some(DIM));
    for _ in 0..3 {
        engine.touch_tool_use(&tools[0], true).unwrap();
    }
    engine.observe_edge(&tools[0], &tools[1], EdgeSource::Learned, EdgeType::Sequence).unwrap();

    let before = engine.graph_snapshot();
    let a_usage = before.capabilities.get(&a).unwrap().usage_count;
    let c_usage = before.capabilities.get(&c).unwrap().usage_count;

    engine.on_capability_merged(&a, &c);

    let after = engine.graph_snapshot();
    assert!(!after.capabilities.contains_key(&c));
    let merged = after.capabilities.get(&a).unwrap();
    assert_eq!(merged.usage_count, a_usage + c_usage);
}

/// Scenario 6: after observing enough traces that `git:clone` always
/// precedes `fs:read`, ranking `fs:read` with `git:clone` in context scores
/// it higher than ranking it cold, purely through the graph term the
/// learned sequence edges feed (the SHGAT scorer need not even be trained).
#[test]
fn context_conditioned_ranking_shifts_after_training_traces() {
    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;

    engine.add_tool("git:clone", "clone a repository").unwrap();
    engine.add_tool("fs:read", "read a file").unwrap();
    engine.add_tool("fs:write", "write a file").unwrap();
    let shared_embedding = unit_embedding(3.0, DIM);
    engine.set_tool_embedding("git:clone", unit_embedding(1.0, DIM)).unwrap();
    engine.set_tool_embedding("fs:read", shared_embedding.clone()).unwrap();
    engine.set_tool_embedding("fs:write", shared_embedding.clone()).unwrap();

    for i in 0..200 {
        let record = TestDataFactory::trace(
            Uuid::new_v4(),
            0,
            "read the file after cloning",
            unit_embedding(3.0, DIM),
            vec!["git:clone".to_string()],
            "fs:read",
            true,
        );
        engine.observe(record).unwrap();
        if i % 50 == 0 {
            let _ = engine.train_now().unwrap();
        }
    }
    let _ = engine.train_now().unwrap();

    let with_context = engine
        .rank(
            Intent::Embedding(shared_embedding.clone()),
            None,
            &RankOptions { min_score: 0.0, context_tool_ids: vec!["git:clone".to_string()], ..RankOptions::default() },
        )
        .unwrap();
    let without_context = engine
        .rank(Intent::Embedding(shared_embedding), None, &RankOptions { min_score: 0.0, ..RankOptions::default() })
        .unwrap();

    let read_with = with_context.items.iter().find(|i| i.id == "fs:read").unwrap();
    let read_without = without_context.items.iter().find(|i| i.id == "fs:read").unwrap();
    assert!(
        read_with.graph >= read_without.graph,
        "graph term should not decrease once git:clone -> fs:read has been observed repeatedly"
    );
    assert!(read_with.score >= read_without.score);
}

/// `rank()` with `Intent::Text` and no model is a contract error, not a panic.
#[test]
fn text_intent_without_model_errors() {
    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;
    TestDataFactory::seed_tools(engine, 1, DIM);
    let result = engine.rank(Intent::Text("do something".into()), None, &RankOptions::default());
    assert!(result.is_err());
}

/// `rank()` with `Intent::Text` and a model encodes through it.
#[test]
fn text_intent_with_model_encodes_and_ranks() {
    let manager = TestEngineManager::new(DIM);
    let engine = &manager.engine;
    let ids = TestDataFactory::seed_tools(engine, 3, DIM);
    let model: Arc<StubEmbeddingModel> = Arc::new(StubEmbeddingModel { dim: DIM });

    let response = engine
        .rank(
            Intent::Text("tool number one".into()),
            Some(model.as_ref()),
            &RankOptions { min_score: 0.0, ..RankOptions::default() },
        )
        .expect("text intent with a model should succeed");
    assert!(!response.items.is_empty());
    assert!(response.items.iter().any(|i| ids.contains(&i.id)));
}
