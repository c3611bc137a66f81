//! Knowledge graph storage: typed nodes, weighted edges, maintenance ops.
//!
//! Node identity is `(project, type, normalized name)`. Edges are unique on
//! `(source, target, type)` and each endpoint's total degree is capped; the
//! cap converts popularity into "most-weighted associations kept" so hub
//! nodes cannot dominate traversal.

// SQLite returns i64; entity counts and offsets are non-negative and small.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

use super::{Storage, from_millis, to_millis};
use crate::models::{
    EdgeType, GraphEdge, GraphNode, MAX_NODE_DEGREE, NodeId, NodeType, ObservationId,
    normalize_name,
};
use crate::{Error, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Degree fraction above which curation proactively re-enforces the cap.
pub const DEGREE_HOTSPOT_FRACTION: f32 = 0.9;

/// Edge-weight decay configuration.
#[derive(Debug, Clone, Copy)]
pub struct DecayConfig {
    /// Half-life in days for the exponential decay.
    pub half_life_days: f32,
    /// Weights never decay below this floor.
    pub min_floor: f32,
    /// Edges whose raw decayed weight falls below this are deleted.
    pub deletion_threshold: f32,
    /// Edges older than this are deleted regardless of weight.
    pub max_age_days: f32,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            min_floor: 0.05,
            deletion_threshold: 0.02,
            max_age_days: 180.0,
        }
    }
}

/// Outcome of a decay pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecayStats {
    /// Edges whose weight was reduced.
    pub updated: usize,
    /// Edges removed by threshold or age.
    pub deleted: usize,
}

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow edges out of the start node.
    Outgoing,
    /// Follow edges into the start node.
    Incoming,
    /// Follow both.
    Both,
}

/// One `(neighbour, connecting edge)` pair discovered by traversal.
#[derive(Debug, Clone)]
pub struct TraversalHop {
    /// The neighbour reached.
    pub node: GraphNode,
    /// The edge that reached it.
    pub edge: GraphEdge,
    /// Hop count from the start node (1-based).
    pub depth: u32,
}

/// A group of nodes believed to denote the same entity.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    /// Members of the group.
    pub node_ids: Vec<NodeId>,
    /// Why the group was formed.
    pub reason: String,
}

/// Aggregate graph statistics for one project.
#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    /// Node count.
    pub nodes: u64,
    /// Edge count.
    pub edges: u64,
    /// Node counts by type.
    pub nodes_by_type: HashMap<String, u64>,
    /// Nodes whose degree exceeds 90% of the cap, with their degree.
    pub hotspots: Vec<(String, usize)>,
    /// Duplicate candidate groups found.
    pub duplicate_groups: usize,
    /// Advisory staleness flags raised.
    pub staleness_flags: u64,
}

/// Common abbreviation pairs expanded during duplicate detection.
static ABBREVIATIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("ts", "typescript"),
        ("js", "javascript"),
        ("py", "python"),
        ("rs", "rust"),
        ("k8s", "kubernetes"),
        ("db", "database"),
        ("config", "configuration"),
        ("repo", "repository"),
        ("auth", "authentication"),
        ("docs", "documentation"),
    ])
});

/// Store for graph nodes and edges.
#[derive(Clone)]
pub struct GraphStore {
    storage: Arc<Storage>,
}

impl GraphStore {
    /// Creates a graph store over the shared database.
    #[must_use]
    pub const fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Upserts a node, merging observation ids into the contributing set and
    /// overlaying scalar metadata last-writer-wins.
    pub fn upsert_node(
        &self,
        project_hash: &str,
        node_type: NodeType,
        name: &str,
        metadata: serde_json::Value,
        observation_ids: &[ObservationId],
    ) -> Result<GraphNode> {
        let normalized = normalize_name(node_type, name);
        let now = to_millis(Utc::now());

        self.storage.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("upsert_node_begin", e))?;

            let existing = tx
                .prepare_cached(
                    "SELECT * FROM graph_nodes
                     WHERE project_hash = ?1 AND node_type = ?2 AND name = ?3",
                )
                .map_err(|e| Error::storage("prepare_upsert_node", e))?
                .query_row(params![project_hash, node_type.as_str(), normalized], read_node)
                .optional()
                .map_err(|e| Error::storage("upsert_node_lookup", e))?;

            let node = if let Some(mut node) = existing {
                for id in observation_ids {
                    if !node.observation_ids.contains(id) {
                        node.observation_ids.push(id.clone());
                    }
                }
                node.metadata = overlay_metadata(node.metadata, metadata);
                node.updated_at = from_millis(now);
                tx.prepare_cached(
                    "UPDATE graph_nodes
                     SET metadata = ?1, observation_ids = ?2, updated_at = ?3
                     WHERE id = ?4",
                )
                .map_err(|e| Error::storage("prepare_update_node", e))?
                .execute(params![
                    node.metadata.to_string(),
                    ids_to_json(&node.observation_ids),
                    now,
                    node.id.as_str(),
                ])
                .map_err(|e| Error::storage("update_node", e))?;
                node
            } else {
                let node = GraphNode {
                    id: NodeId::random(),
                    project_hash: project_hash.to_string(),
                    node_type,
                    name: normalized,
                    confidence: 1.0,
                    metadata,
                    observation_ids: observation_ids.to_vec(),
                    created_at: from_millis(now),
                    updated_at: from_millis(now),
                };
                tx.prepare_cached(
                    "INSERT INTO graph_nodes
                     (id, project_hash, node_type, name, confidence, metadata,
                      observation_ids, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .map_err(|e| Error::storage("prepare_insert_node", e))?
                .execute(params![
                    node.id.as_str(),
                    node.project_hash,
                    node.node_type.as_str(),
                    node.name,
                    node.confidence,
                    node.metadata.to_string(),
                    ids_to_json(&node.observation_ids),
                    now,
                    now,
                ])
                .map_err(|e| Error::storage("insert_node", e))?;
                node
            };

            tx.commit()
                .map_err(|e| Error::storage("upsert_node_commit", e))?;
            metrics::counter!("laminark_graph_upserts_total").increment(1);
            Ok(node)
        })
    }

    /// Looks a node up by identity.
    pub fn get_node(
        &self,
        project_hash: &str,
        node_type: NodeType,
        name: &str,
    ) -> Result<Option<GraphNode>> {
        let normalized = normalize_name(node_type, name);
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT * FROM graph_nodes
                 WHERE project_hash = ?1 AND node_type = ?2 AND name = ?3",
            )
            .map_err(|e| Error::storage("prepare_get_node", e))?
            .query_row(params![project_hash, node_type.as_str(), normalized], read_node)
            .optional()
            .map_err(|e| Error::storage("get_node", e))
        })
    }

    /// Looks a node up by id.
    pub fn node_by_id(&self, id: &NodeId) -> Result<Option<GraphNode>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT * FROM graph_nodes WHERE id = ?1")
                .map_err(|e| Error::storage("prepare_node_by_id", e))?
                .query_row(params![id.as_str()], read_node)
                .optional()
                .map_err(|e| Error::storage("node_by_id", e))
        })
    }

    /// Lists nodes for a project, optionally filtered by type.
    pub fn list_nodes(
        &self,
        project_hash: &str,
        node_type: Option<NodeType>,
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        self.storage.with_conn(|conn| {
            let rows = if let Some(nt) = node_type {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT * FROM graph_nodes
                         WHERE project_hash = ?1 AND node_type = ?2
                         ORDER BY updated_at DESC LIMIT ?3",
                    )
                    .map_err(|e| Error::storage("prepare_list_nodes", e))?;
                let mapped = stmt
                    .query_map(params![project_hash, nt.as_str(), limit as i64], read_node)
                    .map_err(|e| Error::storage("list_nodes", e))?;
                mapped.collect::<std::result::Result<Vec<_>, _>>()
            } else {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT * FROM graph_nodes WHERE project_hash = ?1
                         ORDER BY updated_at DESC LIMIT ?2",
                    )
                    .map_err(|e| Error::storage("prepare_list_nodes", e))?;
                let mapped = stmt
                    .query_map(params![project_hash, limit as i64], read_node)
                    .map_err(|e| Error::storage("list_nodes", e))?;
                mapped.collect::<std::result::Result<Vec<_>, _>>()
            };
            rows.map_err(|e| Error::storage("list_nodes", e))
        })
    }

    /// Replaces a node's contributing observation set.
    pub fn set_observation_ids(&self, id: &NodeId, ids: &[ObservationId]) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "UPDATE graph_nodes SET observation_ids = ?1, updated_at = ?2 WHERE id = ?3",
            )
            .map_err(|e| Error::storage("prepare_set_observation_ids", e))?
            .execute(params![ids_to_json(ids), to_millis(Utc::now()), id.as_str()])
            .map_err(|e| Error::storage("set_observation_ids", e))?;
            Ok(())
        })
    }

    /// Inserts an edge, idempotent on `(source, target, type)`.
    ///
    /// Self-loops are dropped silently. After a successful insert both
    /// endpoints have their degree cap enforced, so the §degree invariant
    /// holds immediately on return. Returns whether a new edge was written.
    pub fn insert_edge(
        &self,
        source: &NodeId,
        target: &NodeId,
        edge_type: EdgeType,
        weight: f32,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        if source == target {
            return Ok(false);
        }
        let inserted = self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO graph_edges
                     (source_id, target_id, edge_type, weight, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(|e| Error::storage("prepare_insert_edge", e))?
                .execute(params![
                    source.as_str(),
                    target.as_str(),
                    edge_type.as_str(),
                    weight.clamp(0.0, 1.0),
                    metadata.to_string(),
                    to_millis(Utc::now()),
                ])
                .map_err(|e| Error::storage("insert_edge", e))?;
            Ok(changed > 0)
        })?;

        if inserted {
            self.enforce_max_degree(source, MAX_NODE_DEGREE)?;
            self.enforce_max_degree(target, MAX_NODE_DEGREE)?;
        }
        Ok(inserted)
    }

    /// Total (in + out) degree of a node.
    pub fn degree(&self, id: &NodeId) -> Result<usize> {
        self.storage.with_conn(|conn| degree_in_conn(conn, id))
    }

    /// Edges touching a node in the given direction.
    pub fn edges_of(&self, id: &NodeId, direction: Direction) -> Result<Vec<GraphEdge>> {
        self.storage.with_conn(|conn| {
            let sql = match direction {
                Direction::Outgoing => "SELECT * FROM graph_edges WHERE source_id = ?1",
                Direction::Incoming => "SELECT * FROM graph_edges WHERE target_id = ?1",
                Direction::Both => {
                    "SELECT * FROM graph_edges WHERE source_id = ?1 OR target_id = ?1"
                },
            };
            let mut stmt = conn
                .prepare_cached(sql)
                .map_err(|e| Error::storage("prepare_edges_of", e))?;
            let rows = stmt
                .query_map(params![id.as_str()], read_edge)
                .map_err(|e| Error::storage("edges_of", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("edges_of", e))
        })
    }

    /// Drops the lowest-weight edges until the node's degree is within the
    /// cap. Atomic; returns the prune count.
    pub fn enforce_max_degree(&self, id: &NodeId, cap: usize) -> Result<usize> {
        self.storage.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("enforce_degree_begin", e))?;

            let degree = degree_in_conn(&tx, id)?;
            if degree <= cap {
                tx.commit()
                    .map_err(|e| Error::storage("enforce_degree_commit", e))?;
                return Ok(0);
            }
            let excess = degree - cap;

            // Lowest weight first, oldest breaking ties.
            let pruned = tx
                .execute(
                    "DELETE FROM graph_edges WHERE rowid IN (
                        SELECT rowid FROM graph_edges
                        WHERE source_id = ?1 OR target_id = ?1
                        ORDER BY weight ASC, created_at ASC
                        LIMIT ?2
                    )",
                    params![id.as_str(), excess as i64],
                )
                .map_err(|e| Error::storage("enforce_degree_prune", e))?;

            tx.commit()
                .map_err(|e| Error::storage("enforce_degree_commit", e))?;
            if pruned > 0 {
                tracing::info!(node = id.as_str(), pruned, "degree cap enforced");
                metrics::counter!("laminark_degree_prunes_total").increment(pruned as u64);
            }
            Ok(pruned)
        })
    }

    /// Merges `merge` into `keep`: union observation sets, overlay metadata,
    /// reroute edges (higher weight wins on conflict), drop self-loops,
    /// delete the merged node. Atomic.
    pub fn merge_entities(&self, keep: &NodeId, merge: &NodeId) -> Result<()> {
        if keep == merge {
            return Ok(());
        }
        self.storage.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("merge_begin", e))?;

            let keep_node = tx
                .prepare_cached("SELECT * FROM graph_nodes WHERE id = ?1")
                .map_err(|e| Error::storage("prepare_merge_lookup", e))?
                .query_row(params![keep.as_str()], read_node)
                .optional()
                .map_err(|e| Error::storage("merge_lookup", e))?
                .ok_or_else(|| Error::NotFound(format!("graph node {keep}")))?;
            let merge_node = tx
                .prepare_cached("SELECT * FROM graph_nodes WHERE id = ?1")
                .map_err(|e| Error::storage("prepare_merge_lookup", e))?
                .query_row(params![merge.as_str()], read_node)
                .optional()
                .map_err(|e| Error::storage("merge_lookup", e))?
                .ok_or_else(|| Error::NotFound(format!("graph node {merge}")))?;

            let mut union = keep_node.observation_ids.clone();
            for id in &merge_node.observation_ids {
                if !union.contains(id) {
                    union.push(id.clone());
                }
            }
            let metadata = overlay_metadata(merge_node.metadata, keep_node.metadata);
            tx.prepare_cached(
                "UPDATE graph_nodes SET observation_ids = ?1, metadata = ?2, updated_at = ?3
                 WHERE id = ?4",
            )
            .map_err(|e| Error::storage("prepare_merge_update", e))?
            .execute(params![
                ids_to_json(&union),
                metadata.to_string(),
                to_millis(Utc::now()),
                keep.as_str(),
            ])
            .map_err(|e| Error::storage("merge_update", e))?;

            // Reroute the merged node's edges, deduping against existing
            // triples by keeping the higher-weight instance.
            let mut stmt = tx
                .prepare(
                    "SELECT * FROM graph_edges WHERE source_id = ?1 OR target_id = ?1",
                )
                .map_err(|e| Error::storage("prepare_merge_edges", e))?;
            let edges = stmt
                .query_map(params![merge.as_str()], read_edge)
                .map_err(|e| Error::storage("merge_edges", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("merge_edges", e))?;
            drop(stmt);

            tx.execute(
                "DELETE FROM graph_edges WHERE source_id = ?1 OR target_id = ?1",
                params![merge.as_str()],
            )
            .map_err(|e| Error::storage("merge_delete_edges", e))?;

            for edge in edges {
                let source = if edge.source == *merge { keep.clone() } else { edge.source };
                let target = if edge.target == *merge { keep.clone() } else { edge.target };
                if source == target {
                    continue;
                }
                let existing_weight: Option<f64> = tx
                    .prepare_cached(
                        "SELECT weight FROM graph_edges
                         WHERE source_id = ?1 AND target_id = ?2 AND edge_type = ?3",
                    )
                    .map_err(|e| Error::storage("prepare_merge_conflict", e))?
                    .query_row(
                        params![source.as_str(), target.as_str(), edge.edge_type.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| Error::storage("merge_conflict", e))?;

                match existing_weight {
                    Some(w) if (w as f32) >= edge.weight => {},
                    _ => {
                        tx.prepare_cached(
                            "INSERT OR REPLACE INTO graph_edges
                             (source_id, target_id, edge_type, weight, metadata, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        )
                        .map_err(|e| Error::storage("prepare_merge_reroute", e))?
                        .execute(params![
                            source.as_str(),
                            target.as_str(),
                            edge.edge_type.as_str(),
                            edge.weight,
                            edge.metadata.to_string(),
                            to_millis(edge.created_at),
                        ])
                        .map_err(|e| Error::storage("merge_reroute", e))?;
                    },
                }
            }

            tx.execute("DELETE FROM graph_nodes WHERE id = ?1", params![merge.as_str()])
                .map_err(|e| Error::storage("merge_delete_node", e))?;

            tx.commit().map_err(|e| Error::storage("merge_commit", e))?;
            tracing::info!(keep = keep.as_str(), merged = merge.as_str(), "entities merged");
            Ok(())
        })
    }

    /// Finds groups of nodes that look like the same entity.
    ///
    /// Layers: abbreviation expansion, path normalization for files, then a
    /// fuzzy layer (Levenshtein ≤ 2 on short names, Jaccard ≥ 0.7 over
    /// tokenized names). Names are stored normalized, so plain
    /// case-insensitive duplicates cannot exist within one type.
    pub fn find_duplicate_entities(
        &self,
        project_hash: &str,
        node_type: Option<NodeType>,
    ) -> Result<Vec<DuplicateGroup>> {
        let nodes = self.list_nodes(project_hash, node_type, 10_000)?;
        let mut groups: Vec<(Vec<usize>, String)> = Vec::new();
        let mut grouped: HashSet<usize> = HashSet::new();

        for i in 0..nodes.len() {
            if grouped.contains(&i) {
                continue;
            }
            let mut members = vec![i];
            let mut reason = String::new();
            for j in (i + 1)..nodes.len() {
                if grouped.contains(&j) || nodes[i].node_type != nodes[j].node_type {
                    continue;
                }
                if let Some(why) = names_match(&nodes[i], &nodes[j]) {
                    members.push(j);
                    reason = why;
                }
            }
            if members.len() > 1 {
                for &m in &members {
                    grouped.insert(m);
                }
                groups.push((members, reason));
            }
        }

        Ok(groups
            .into_iter()
            .map(|(members, reason)| DuplicateGroup {
                node_ids: members.iter().map(|&m| nodes[m].id.clone()).collect(),
                reason,
            })
            .collect())
    }

    /// Applies exponential edge-weight decay, deleting edges that fall below
    /// the deletion threshold or exceed the maximum age.
    pub fn apply_temporal_decay(&self, config: &DecayConfig) -> Result<DecayStats> {
        let now = Utc::now();
        self.storage.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("decay_begin", e))?;
            let mut stats = DecayStats::default();

            let mut stmt = tx
                .prepare("SELECT rowid, weight, created_at FROM graph_edges")
                .map_err(|e| Error::storage("prepare_decay_scan", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)? as f32,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| Error::storage("decay_scan", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("decay_scan", e))?;
            drop(stmt);

            for (rowid, weight, created_at) in rows {
                let age_days =
                    (now - from_millis(created_at)).num_seconds() as f32 / 86_400.0;
                let decayed =
                    weight * (-std::f32::consts::LN_2 * age_days / config.half_life_days).exp();

                if decayed < config.deletion_threshold || age_days > config.max_age_days {
                    tx.execute("DELETE FROM graph_edges WHERE rowid = ?1", params![rowid])
                        .map_err(|e| Error::storage("decay_delete", e))?;
                    stats.deleted += 1;
                } else {
                    let floored = decayed.max(config.min_floor);
                    if (floored - weight).abs() > f32::EPSILON {
                        tx.execute(
                            "UPDATE graph_edges SET weight = ?1 WHERE rowid = ?2",
                            params![floored, rowid],
                        )
                        .map_err(|e| Error::storage("decay_update", e))?;
                        stats.updated += 1;
                    }
                }
            }

            tx.commit().map_err(|e| Error::storage("decay_commit", e))?;
            Ok(stats)
        })
    }

    /// Bounded BFS from a node, returning `(neighbour, edge)` pairs.
    ///
    /// Depth is clamped to 4.
    pub fn traverse_from(
        &self,
        start: &NodeId,
        depth: u32,
        edge_types: Option<&[EdgeType]>,
        direction: Direction,
    ) -> Result<Vec<TraversalHop>> {
        let max_depth = depth.min(4);
        let mut visited: HashSet<NodeId> = HashSet::from([start.clone()]);
        let mut frontier: VecDeque<(NodeId, u32)> = VecDeque::from([(start.clone(), 0)]);
        let mut hops = Vec::new();

        while let Some((node_id, at_depth)) = frontier.pop_front() {
            if at_depth >= max_depth {
                continue;
            }
            for edge in self.edges_of(&node_id, direction)? {
                if let Some(filter) = edge_types {
                    if !filter.contains(&edge.edge_type) {
                        continue;
                    }
                }
                let neighbour_id = if edge.source == node_id {
                    edge.target.clone()
                } else {
                    edge.source.clone()
                };
                if !visited.insert(neighbour_id.clone()) {
                    continue;
                }
                if let Some(node) = self.node_by_id(&neighbour_id)? {
                    hops.push(TraversalHop {
                        node,
                        edge,
                        depth: at_depth + 1,
                    });
                    frontier.push_back((neighbour_id, at_depth + 1));
                }
            }
        }
        Ok(hops)
    }

    /// Nodes with at least `min` contributing observations (curation input).
    pub fn nodes_with_min_observations(
        &self,
        project_hash: &str,
        min: usize,
    ) -> Result<Vec<GraphNode>> {
        Ok(self
            .list_nodes(project_hash, None, 10_000)?
            .into_iter()
            .filter(|n| n.observation_ids.len() >= min)
            .collect())
    }

    /// Nodes whose degree exceeds `fraction` of the cap.
    pub fn nodes_near_cap(
        &self,
        project_hash: &str,
        fraction: f32,
    ) -> Result<Vec<(GraphNode, usize)>> {
        let threshold = (MAX_NODE_DEGREE as f32 * fraction) as usize;
        let mut out = Vec::new();
        for node in self.list_nodes(project_hash, None, 10_000)? {
            let degree = self.degree(&node.id)?;
            if degree > threshold {
                out.push((node, degree));
            }
        }
        Ok(out)
    }

    /// Raises an advisory staleness flag on an observation.
    ///
    /// Flags deprioritize but never hide; search applies them as a ranking
    /// signal only.
    pub fn flag_stale(
        &self,
        observation_id: &ObservationId,
        node_id: &NodeId,
        superseded_by: &ObservationId,
        reason: &str,
    ) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO staleness_flags
                 (observation_id, node_id, superseded_by, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(|e| Error::storage("prepare_flag_stale", e))?
            .execute(params![
                observation_id.as_str(),
                node_id.as_str(),
                superseded_by.as_str(),
                reason,
                to_millis(Utc::now()),
            ])
            .map_err(|e| Error::storage("flag_stale", e))?;
            Ok(())
        })
    }

    /// Returns whether an observation carries a staleness flag.
    pub fn is_stale(&self, observation_id: &ObservationId) -> Result<bool> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT EXISTS (SELECT 1 FROM staleness_flags WHERE observation_id = ?1)",
            )
            .map_err(|e| Error::storage("prepare_is_stale", e))?
            .query_row(params![observation_id.as_str()], |row| row.get(0))
            .map_err(|e| Error::storage("is_stale", e))
        })
    }

    /// Aggregate statistics for one project.
    pub fn stats(&self, project_hash: &str) -> Result<GraphStats> {
        let mut stats = GraphStats::default();
        let nodes = self.list_nodes(project_hash, None, 10_000)?;
        stats.nodes = nodes.len() as u64;
        for node in &nodes {
            *stats
                .nodes_by_type
                .entry(node.node_type.as_str().to_string())
                .or_insert(0) += 1;
            let degree = self.degree(&node.id)?;
            if degree > MAX_NODE_DEGREE * 9 / 10 {
                stats.hotspots.push((node.name.clone(), degree));
            }
        }
        stats.edges = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM graph_edges e
                 JOIN graph_nodes n ON n.id = e.source_id
                 WHERE n.project_hash = ?1",
                params![project_hash],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
            .map_err(|e| Error::storage("count_edges", e))
        })?;
        stats.duplicate_groups = self.find_duplicate_entities(project_hash, None)?.len();
        stats.staleness_flags = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM staleness_flags f
                 JOIN graph_nodes n ON n.id = f.node_id
                 WHERE n.project_hash = ?1",
                params![project_hash],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
            .map_err(|e| Error::storage("count_staleness", e))
        })?;
        Ok(stats)
    }
}

fn degree_in_conn(conn: &Connection, id: &NodeId) -> Result<usize> {
    conn.prepare_cached(
        "SELECT COUNT(*) FROM graph_edges WHERE source_id = ?1 OR target_id = ?1",
    )
    .map_err(|e| Error::storage("prepare_degree", e))?
    .query_row(params![id.as_str()], |row| row.get::<_, i64>(0))
    .map(|n| n.max(0) as usize)
    .map_err(|e| Error::storage("degree", e))
}

/// Overlays `top` onto `base`: scalar fields from `top` win.
fn overlay_metadata(base: serde_json::Value, top: serde_json::Value) -> serde_json::Value {
    match (base, top) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(top_map)) => {
            for (k, v) in top_map {
                base_map.insert(k, v);
            }
            serde_json::Value::Object(base_map)
        },
        (base, serde_json::Value::Null) => base,
        (_, top) => top,
    }
}

fn ids_to_json(ids: &[ObservationId]) -> String {
    serde_json::to_string(&ids.iter().map(ObservationId::as_str).collect::<Vec<_>>())
        .unwrap_or_else(|_| "[]".to_string())
}

fn read_node(row: &Row<'_>) -> rusqlite::Result<GraphNode> {
    let type_str: String = row.get("node_type")?;
    let metadata: String = row.get("metadata")?;
    let ids: String = row.get("observation_ids")?;
    Ok(GraphNode {
        id: NodeId::from(row.get::<_, String>("id")?),
        project_hash: row.get("project_hash")?,
        node_type: NodeType::parse(&type_str).unwrap_or(NodeType::Reference),
        name: row.get("name")?,
        confidence: row.get::<_, f64>("confidence")? as f32,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        observation_ids: serde_json::from_str::<Vec<String>>(&ids)
            .unwrap_or_default()
            .into_iter()
            .map(ObservationId::from)
            .collect(),
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
    })
}

fn read_edge(row: &Row<'_>) -> rusqlite::Result<GraphEdge> {
    let type_str: String = row.get("edge_type")?;
    let metadata: String = row.get("metadata")?;
    Ok(GraphEdge {
        source: NodeId::from(row.get::<_, String>("source_id")?),
        target: NodeId::from(row.get::<_, String>("target_id")?),
        edge_type: EdgeType::parse(&type_str).unwrap_or(EdgeType::RelatedTo),
        weight: row.get::<_, f64>("weight")? as f32,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: from_millis(row.get("created_at")?),
    })
}

/// Decides whether two same-type nodes denote the same entity.
fn names_match(a: &GraphNode, b: &GraphNode) -> Option<String> {
    let (na, nb) = (a.name.as_str(), b.name.as_str());
    if expand_abbreviation(na) == expand_abbreviation(nb) {
        return Some("abbreviation".to_string());
    }
    if a.node_type == NodeType::File && paths_equivalent(na, nb) {
        return Some("path form".to_string());
    }
    let short = na.len() <= 12 && nb.len() <= 12;
    if short && levenshtein(na, nb) <= 2 && na != nb {
        return Some("edit distance".to_string());
    }
    if token_jaccard(na, nb) >= 0.7 && na != nb {
        return Some("token overlap".to_string());
    }
    None
}

fn expand_abbreviation(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| ABBREVIATIONS.get(t).copied().unwrap_or(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Path-form equality for file nodes: identical, or one is a suffix of the
/// other at a path-component boundary (`a.ts` vs `src/a.ts`).
fn paths_equivalent(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    a.ends_with(&format!("/{b}")) || b.ends_with(&format!("/{a}"))
}

/// Classic dynamic-programming Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Jaccard similarity over whitespace/punctuation tokens.
pub(crate) fn token_jaccard(a: &str, b: &str) -> f32 {
    let ta: HashSet<&str> = a
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let tb: HashSet<&str> = b
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count() as f32;
    let union = ta.union(&tb).count() as f32;
    inter / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> GraphStore {
        GraphStore::new(Storage::in_memory().unwrap())
    }

    fn node(graph: &GraphStore, name: &str) -> GraphNode {
        graph
            .upsert_node("p", NodeType::Decision, name, serde_json::json!({}), &[])
            .unwrap()
    }

    #[test]
    fn upsert_merges_observation_ids() {
        let graph = graph();
        let a = ObservationId::from("obs-a");
        let b = ObservationId::from("obs-b");
        graph
            .upsert_node("p", NodeType::File, "src/a.ts", serde_json::json!({}), &[a.clone()])
            .unwrap();
        let merged = graph
            .upsert_node(
                "p",
                NodeType::File,
                "src/a.ts",
                serde_json::json!({"lang": "ts"}),
                &[a.clone(), b.clone()],
            )
            .unwrap();
        assert_eq!(merged.observation_ids, vec![a, b]);
        assert_eq!(merged.metadata["lang"], "ts");
    }

    #[test]
    fn edge_unique_on_triple_and_rejects_self_loops() {
        let graph = graph();
        let a = node(&graph, "alpha");
        let b = node(&graph, "beta");

        assert!(graph
            .insert_edge(&a.id, &b.id, EdgeType::RelatedTo, 0.5, serde_json::json!({}))
            .unwrap());
        assert!(!graph
            .insert_edge(&a.id, &b.id, EdgeType::RelatedTo, 0.9, serde_json::json!({}))
            .unwrap());
        assert!(!graph
            .insert_edge(&a.id, &a.id, EdgeType::RelatedTo, 0.5, serde_json::json!({}))
            .unwrap());
        assert_eq!(graph.degree(&a.id).unwrap(), 1);
    }

    #[test]
    fn degree_cap_holds_after_every_insert() {
        let graph = graph();
        let hub = node(&graph, "hub");
        for i in 0..(MAX_NODE_DEGREE + 10) {
            let spoke = node(&graph, &format!("spoke-{i}"));
            let weight = 0.1 + (i as f32) * 0.01;
            graph
                .insert_edge(&hub.id, &spoke.id, EdgeType::RelatedTo, weight, serde_json::json!({}))
                .unwrap();
            assert!(graph.degree(&hub.id).unwrap() <= MAX_NODE_DEGREE);
        }
        // Highest-weight edges survive.
        let edges = graph.edges_of(&hub.id, Direction::Both).unwrap();
        assert_eq!(edges.len(), MAX_NODE_DEGREE);
        assert!(edges.iter().all(|e| e.weight >= 0.1 + 0.01 * 10.0 - 1e-6));
    }

    #[test]
    fn merge_unions_reroutes_and_drops_self_loops() {
        let graph = graph();
        let keep = graph
            .upsert_node(
                "p",
                NodeType::Decision,
                "use sqlite",
                serde_json::json!({}),
                &[ObservationId::from("o1")],
            )
            .unwrap();
        let merge = graph
            .upsert_node(
                "p",
                NodeType::Decision,
                "using sqlite",
                serde_json::json!({}),
                &[ObservationId::from("o2")],
            )
            .unwrap();
        let third = node(&graph, "third");

        // keep->third exists weakly; merge->third strongly; merge->keep becomes a self-loop.
        graph
            .insert_edge(&keep.id, &third.id, EdgeType::RelatedTo, 0.2, serde_json::json!({}))
            .unwrap();
        graph
            .insert_edge(&merge.id, &third.id, EdgeType::RelatedTo, 0.8, serde_json::json!({}))
            .unwrap();
        graph
            .insert_edge(&merge.id, &keep.id, EdgeType::RelatedTo, 0.5, serde_json::json!({}))
            .unwrap();

        graph.merge_entities(&keep.id, &merge.id).unwrap();

        assert!(graph.node_by_id(&merge.id).unwrap().is_none());
        let kept = graph.node_by_id(&keep.id).unwrap().unwrap();
        assert_eq!(kept.observation_ids.len(), 2);

        let edges = graph.edges_of(&keep.id, Direction::Both).unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].weight - 0.8).abs() < 1e-6);
    }

    #[test]
    fn duplicate_finder_layers() {
        let graph = graph();
        graph
            .upsert_node("p", NodeType::Reference, "ts handbook", serde_json::json!({}), &[])
            .unwrap();
        graph
            .upsert_node(
                "p",
                NodeType::Reference,
                "typescript handbook",
                serde_json::json!({}),
                &[],
            )
            .unwrap();
        graph
            .upsert_node("p", NodeType::File, "a.ts", serde_json::json!({}), &[])
            .unwrap();
        graph
            .upsert_node("p", NodeType::File, "src/a.ts", serde_json::json!({}), &[])
            .unwrap();
        graph
            .upsert_node("p", NodeType::Problem, "flaky test", serde_json::json!({}), &[])
            .unwrap();

        let groups = graph.find_duplicate_entities("p", None).unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn temporal_decay_floors_and_deletes() {
        let graph = graph();
        let a = node(&graph, "old-a");
        let b = node(&graph, "old-b");
        graph
            .insert_edge(&a.id, &b.id, EdgeType::RelatedTo, 0.9, serde_json::json!({}))
            .unwrap();

        // Age the edge by hand: 60 days with a 30-day half-life quarters it.
        let old = to_millis(Utc::now() - chrono::Duration::days(60));
        graph
            .storage
            .with_conn(|conn| {
                conn.execute("UPDATE graph_edges SET created_at = ?1", params![old])
                    .map_err(|e| Error::storage("test_age", e))
            })
            .unwrap();

        let stats = graph.apply_temporal_decay(&DecayConfig::default()).unwrap();
        assert_eq!(stats.updated, 1);
        let edges = graph.edges_of(&a.id, Direction::Both).unwrap();
        assert!((edges[0].weight - 0.225).abs() < 0.01);

        // Past max age the edge is deleted outright.
        let ancient = to_millis(Utc::now() - chrono::Duration::days(200));
        graph
            .storage
            .with_conn(|conn| {
                conn.execute("UPDATE graph_edges SET created_at = ?1", params![ancient])
                    .map_err(|e| Error::storage("test_age", e))
            })
            .unwrap();
        let stats = graph.apply_temporal_decay(&DecayConfig::default()).unwrap();
        assert_eq!(stats.deleted, 1);
    }

    #[test]
    fn traversal_is_depth_bounded() {
        let graph = graph();
        let chain: Vec<GraphNode> = (0..6).map(|i| node(&graph, &format!("n{i}"))).collect();
        for pair in chain.windows(2) {
            graph
                .insert_edge(
                    &pair[0].id,
                    &pair[1].id,
                    EdgeType::PrecededBy,
                    0.5,
                    serde_json::json!({}),
                )
                .unwrap();
        }

        let hops = graph
            .traverse_from(&chain[0].id, 2, None, Direction::Outgoing)
            .unwrap();
        assert_eq!(hops.len(), 2);
        assert!(hops.iter().all(|h| h.depth <= 2));

        // Depth clamps at 4 even when asked for more.
        let hops = graph
            .traverse_from(&chain[0].id, 10, None, Direction::Outgoing)
            .unwrap();
        assert_eq!(hops.len(), 4);
    }

    #[test]
    fn levenshtein_and_jaccard() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert!((token_jaccard("flaky auth test", "flaky auth tests run") - 0.4).abs() < 0.01);
        assert!(token_jaccard("", "x") < f32::EPSILON);
    }
}
