//! Graph and curation integration: merges, caps, isolation, index
//! consistency.

use laminark::config::LaminarkConfig;
use laminark::embedding::EmbeddingHandle;
use laminark::engine::Engine;
use laminark::models::{EdgeType, Kind, NewObservation, NodeType, MAX_NODE_DEGREE};
use laminark::search::SearchOptions;
use laminark::storage::{EmbeddingStore, GraphStore, ListOptions, ObservationStore, Storage};
use serde_json::json;
use std::sync::Arc;

fn engine() -> (Engine, Arc<Storage>) {
    let storage = Storage::in_memory().unwrap();
    let engine = Engine::assemble(
        LaminarkConfig::with_data_dir(std::env::temp_dir().join("laminark-graph-it")),
        Arc::clone(&storage),
        Arc::new(EmbeddingHandle::disabled()),
        None,
    );
    (engine, storage)
}

fn seed(store: &ObservationStore, content: &str) -> laminark::models::Observation {
    store
        .create(NewObservation {
            content: content.to_string(),
            source: "hook:Edit".to_string(),
            kind: Some(Kind::Change),
            ..Default::default()
        })
        .unwrap()
}

#[test]
fn curation_merges_near_identical_cluster() {
    let (engine, storage) = engine();
    let store = engine.observations("p");
    let embeddings = EmbeddingStore::new(Arc::clone(&storage));
    let graph = GraphStore::new(Arc::clone(&storage));

    let mut ids = Vec::new();
    for i in 0..3 {
        let obs = seed(&store, &format!("bumped the retry limit to 5, attempt {i}"));
        embeddings.store(&obs.id, &[0.6, 0.8, 0.0]).unwrap();
        ids.push(obs.id);
    }
    graph
        .upsert_node("p", NodeType::File, "src/retry.rs", json!({}), &ids)
        .unwrap();

    let stats = engine.run_curation_cycle();
    assert_eq!(stats.clusters_merged, 1);

    // Originals soft-deleted; one merged row with the mean embedding.
    for id in &ids {
        assert!(store.get(id).unwrap().is_none());
    }
    let merged: Vec<_> = store
        .list(&ListOptions::default())
        .unwrap()
        .into_iter()
        .filter(|o| o.source == "curation:merge")
        .collect();
    assert_eq!(merged.len(), 1);
    let mean = embeddings.get(&merged[0].id).unwrap().unwrap();
    assert!((mean[0] - 0.6).abs() < 1e-6 && (mean[1] - 0.8).abs() < 1e-6);

    let node = graph
        .get_node("p", NodeType::File, "src/retry.rs")
        .unwrap()
        .unwrap();
    assert_eq!(node.observation_ids, vec![merged[0].id.clone()]);
}

#[test]
fn degree_cap_holds_through_curation() {
    let (engine, storage) = engine();
    let graph = GraphStore::new(Arc::clone(&storage));

    let hub = graph
        .upsert_node("p", NodeType::File, "README.md", json!({}), &[])
        .unwrap();
    for i in 0..60 {
        let spoke = graph
            .upsert_node("p", NodeType::Decision, &format!("spoke decision {i:03}"), json!({}), &[])
            .unwrap();
        graph
            .insert_edge(&hub.id, &spoke.id, EdgeType::RelatedTo, 0.2 + 0.01 * i as f32, json!({}))
            .unwrap();
        assert!(graph.degree(&hub.id).unwrap() <= MAX_NODE_DEGREE);
    }

    engine.run_curation_cycle();
    assert!(graph.degree(&hub.id).unwrap() <= MAX_NODE_DEGREE);
}

#[test]
fn project_isolation_across_stores_and_search() {
    let (engine, storage) = engine();
    let store_a = engine.observations("proj-a");
    let store_b = engine.observations("proj-b");

    let obs = seed(&store_a, "unique pelican content in project a");
    seed(&store_b, "unrelated content in project b");

    // Listing, lookup, and keyword search all respect the binding.
    assert!(store_b.get(&obs.id).unwrap().is_none());
    let hits = engine
        .search()
        .search_keyword("proj-b", "pelican", &SearchOptions::default())
        .unwrap();
    assert!(hits.is_empty());
    let hits = engine
        .search()
        .search_keyword("proj-a", "pelican", &SearchOptions::default())
        .unwrap();
    assert_eq!(hits.len(), 1);

    // Vector scope: vectors never cross the project binding either.
    let embeddings = EmbeddingStore::new(Arc::clone(&storage));
    embeddings.store(&obs.id, &[1.0, 0.0]).unwrap();
    assert!(embeddings.search("proj-b", &[1.0, 0.0], 5).unwrap().is_empty());
    assert_eq!(embeddings.search("proj-a", &[1.0, 0.0], 5).unwrap().len(), 1);
}

#[test]
fn fts_follows_soft_delete_and_restore() {
    let (engine, _storage) = engine();
    let store = engine.observations("p");
    let obs = seed(&store, "searchable capybara text");

    let find = |engine: &Engine| {
        engine
            .search()
            .search_keyword("p", "capybara", &SearchOptions::default())
            .unwrap()
            .len()
    };
    assert_eq!(find(&engine), 1);

    store.soft_delete(&obs.id).unwrap();
    assert_eq!(find(&engine), 0);

    store.restore(&obs.id).unwrap();
    assert_eq!(find(&engine), 1);
}

#[test]
fn administrative_reset_rebuilds_fts() {
    let (engine, storage) = engine();
    let store = engine.observations("p");
    for i in 0..5 {
        seed(&store, &format!("wombat row {i}"));
    }
    let other = engine.observations("q");
    seed(&other, "wombat survives in q");

    let removed = storage.reset_project("p").unwrap();
    assert_eq!(removed, 5);

    assert!(engine
        .search()
        .search_keyword("p", "wombat", &SearchOptions::default())
        .unwrap()
        .is_empty());
    assert_eq!(
        engine
            .search()
            .search_keyword("q", "wombat", &SearchOptions::default())
            .unwrap()
            .len(),
        1
    );
}
