// src/algorithms/interaction_graph.rs

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::core::{unique_values, FeatureIndex, Node, Result, WatermarkError};

/// Features with more distinct values than this are left out of a seed's graph.
pub const MAX_USEFUL_UNIQUE_VALUES: usize = 50;

/// Directed graph over (feature, value) nodes with interaction-strength edge weights.
///
/// Adjacency is kept in ordered maps so node and edge iteration, and therefore
/// search tie-breaking, is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionGraph {
    adjacency: BTreeMap<Node, BTreeMap<Node, f64>>,
}

impl InteractionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `from -> to`, replacing the weight of an existing edge.
    pub fn add_edge(&mut self, from: Node, to: Node, weight: f64) {
        self.adjacency.entry(to).or_default();
        self.adjacency.entry(from).or_default().insert(to, weight);
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeMap::len).sum()
    }

    pub fn contains_node(&self, node: &Node) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.adjacency.keys()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&Node, &Node, f64)> {
        self.adjacency
            .iter()
            .flat_map(|(from, out)| out.iter().map(move |(to, w)| (from, to, *w)))
    }

    pub fn successors<'a>(&'a self, node: &Node) -> impl Iterator<Item = (&'a Node, f64)> + 'a {
        self.adjacency
            .get(node)
            .into_iter()
            .flat_map(|out| out.iter().map(|(to, w)| (to, *w)))
    }

    pub fn weight(&self, from: &Node, to: &Node) -> Option<f64> {
        self.adjacency.get(from).and_then(|out| out.get(to)).copied()
    }

    /// Unions `other` into `self`; on shared edges `other`'s weight wins.
    pub fn merge(&mut self, other: &InteractionGraph) {
        for (from, to, weight) in other.edges() {
            self.add_edge(*from, *to, weight);
        }
        for node in other.nodes() {
            self.adjacency.entry(*node).or_default();
        }
    }

    /// A copy of this graph without any node whose feature is in `retired`.
    pub fn without_features(&self, retired: &BTreeSet<FeatureIndex>) -> InteractionGraph {
        let adjacency = self
            .adjacency
            .iter()
            .filter(|(node, _)| !retired.contains(&node.feature))
            .map(|(node, out)| {
                let out = out
                    .iter()
                    .filter(|(to, _)| !retired.contains(&to.feature))
                    .map(|(to, w)| (*to, *w))
                    .collect();
                (*node, out)
            })
            .collect();
        InteractionGraph { adjacency }
    }
}

/// Which sign of summed interaction makes an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePolarity {
    Positive,
    Negative,
}

impl EdgePolarity {
    /// Sums `interactions[s, seed, other]` over samples with `seed == seed_value` and
    /// `other == other_value`; keeps the sum only if it is strictly of this polarity.
    ///
    /// An empty `seed == seed_value` subset means the caller enumerated a value that
    /// does not occur, which is reported as an internal error.
    pub fn edge_weight(
        self,
        samples: ArrayView2<'_, f64>,
        interactions: ArrayView3<'_, f32>,
        seed: FeatureIndex,
        seed_value: f64,
        other: FeatureIndex,
        other_value: f64,
    ) -> Result<Option<f64>> {
        if seed == other {
            return Err(WatermarkError::InternalError(format!(
                "Edge requested from feature {} to itself.",
                seed
            )));
        }

        let mut seed_matches = 0usize;
        let mut sum = 0.0f64;
        for (s, row) in samples.outer_iter().enumerate() {
            if row[seed] != seed_value {
                continue;
            }
            seed_matches += 1;
            if row[other] == other_value {
                sum += interactions[[s, seed, other]] as f64;
            }
        }
        if seed_matches == 0 {
            return Err(WatermarkError::InternalError(format!(
                "No sample has feature {} == {}.",
                seed, seed_value
            )));
        }

        let keep = match self {
            EdgePolarity::Positive => sum > 0.0,
            EdgePolarity::Negative => sum < 0.0,
        };
        Ok(if keep { Some(sum) } else { None })
    }
}

/// Builds the interaction graph of `seed` against `candidates`.
///
/// For each candidate with at most `max_unique_values` distinct values, every
/// (seed value, candidate value) pair is scored by `value_fn`; a `Some(weight)`
/// adds the edge `(seed, seed_value) -> (candidate, candidate_value)`.
pub fn build_interaction_graph<F>(
    seed: FeatureIndex,
    samples: ArrayView2<'_, f64>,
    interactions: ArrayView3<'_, f32>,
    mut value_fn: F,
    candidates: &[FeatureIndex],
    max_unique_values: usize,
) -> Result<InteractionGraph>
where
    F: FnMut(ArrayView2<'_, f64>, ArrayView3<'_, f32>, FeatureIndex, f64, FeatureIndex, f64) -> Result<Option<f64>>,
{
    let (n_samples, n_features_a, n_features_b) = interactions.dim();
    if samples.nrows() != n_samples || samples.ncols() != n_features_a || samples.ncols() != n_features_b {
        return Err(WatermarkError::IncompatibleDimensions(format!(
            "Samples are {:?} but interaction tensor is {:?}.",
            samples.dim(),
            interactions.dim()
        )));
    }
    if seed >= samples.ncols() {
        return Err(WatermarkError::UnknownFeature(seed));
    }

    let mut graph = InteractionGraph::new();
    let seed_values = unique_values(samples.column(seed));
    let mut pruned = 0usize;

    for &other in candidates {
        if other == seed {
            continue;
        }
        if other >= samples.ncols() {
            return Err(WatermarkError::UnknownFeature(other));
        }
        let other_values = unique_values(samples.column(other));
        if other_values.len() > max_unique_values {
            tracing::debug!(
                feature = other,
                unique_values = other_values.len(),
                "skipping feature with too many unique values"
            );
            pruned += 1;
            continue;
        }
        for &seed_value in &seed_values {
            for &other_value in &other_values {
                if let Some(weight) = value_fn(samples, interactions, seed, seed_value, other, other_value)? {
                    graph.add_edge(Node::new(seed, seed_value), Node::new(other, other_value), weight);
                }
            }
        }
    }

    tracing::debug!(
        seed,
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        pruned,
        "built seed interaction graph"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn n(feature: FeatureIndex, value: f64) -> Node {
        Node::new(feature, value)
    }

    #[test]
    fn constant_value_function_connects_every_value_pair() -> Result<()> {
        let samples = array![[0.0, 7.0], [1.0, 8.0], [2.0, 9.0], [1.0, 7.0]];
        let interactions = Array3::<f32>::zeros((4, 2, 2));

        let graph = build_interaction_graph(
            0,
            samples.view(),
            interactions.view(),
            |_, _, _, _, _, _| Ok(Some(2.5)),
            &[1],
            MAX_USEFUL_UNIQUE_VALUES,
        )?;

        // 3 seed values x 3 other values
        assert_eq!(graph.edge_count(), 9);
        assert!(graph.edges().all(|(from, to, w)| from.feature == 0 && to.feature == 1 && w == 2.5));
        assert_eq!(graph.weight(&n(0, 2.0), &n(1, 7.0)), Some(2.5));
        assert_eq!(graph.weight(&n(1, 7.0), &n(0, 2.0)), None);
        Ok(())
    }

    #[test]
    fn features_over_the_unique_value_ceiling_are_pruned() -> Result<()> {
        let samples = array![[0.0, 1.0, 5.0], [1.0, 2.0, 5.0], [0.0, 3.0, 6.0]];
        let interactions = Array3::<f32>::zeros((3, 3, 3));
        let graph = build_interaction_graph(
            0,
            samples.view(),
            interactions.view(),
            |_, _, _, _, _, _| Ok(Some(1.0)),
            &[0, 1, 2],
            2,
        )?;
        assert!(graph.nodes().all(|node| node.feature != 1));
        assert_eq!(graph.edge_count(), 4);
        Ok(())
    }

    #[test]
    fn simple_sum_respects_polarity_and_joint_subset() -> Result<()> {
        let samples = array![[1.0, 5.0], [1.0, 5.0], [1.0, 0.0], [0.0, 5.0]];
        let mut interactions = Array3::<f32>::zeros((4, 2, 2));
        interactions[[0, 0, 1]] = 4.0;
        interactions[[1, 0, 1]] = 6.0;
        interactions[[2, 0, 1]] = -3.0;
        interactions[[3, 0, 1]] = 100.0;

        let pos = EdgePolarity::Positive;
        assert_eq!(pos.edge_weight(samples.view(), interactions.view(), 0, 1.0, 1, 5.0)?, Some(10.0));
        assert_eq!(pos.edge_weight(samples.view(), interactions.view(), 0, 1.0, 1, 0.0)?, None);
        // no joint sample: sum is zero, no edge either way
        assert_eq!(pos.edge_weight(samples.view(), interactions.view(), 0, 0.0, 1, 0.0)?, None);

        let neg = EdgePolarity::Negative;
        assert_eq!(neg.edge_weight(samples.view(), interactions.view(), 0, 1.0, 1, 0.0)?, Some(-3.0));
        assert_eq!(neg.edge_weight(samples.view(), interactions.view(), 0, 1.0, 1, 5.0)?, None);
        Ok(())
    }

    #[test]
    fn absent_seed_value_is_an_invariant_violation() {
        let samples = array![[1.0, 5.0]];
        let interactions = Array3::<f32>::zeros((1, 2, 2));
        let err = EdgePolarity::Positive
            .edge_weight(samples.view(), interactions.view(), 0, 3.0, 1, 5.0)
            .unwrap_err();
        assert!(matches!(err, WatermarkError::InternalError(_)));
    }

    #[test]
    fn mismatched_tensor_shape_is_rejected() {
        let samples = array![[1.0, 5.0], [0.0, 1.0]];
        let interactions = Array3::<f32>::zeros((3, 2, 2));
        let err = build_interaction_graph(
            0,
            samples.view(),
            interactions.view(),
            |s, t, a, av, b, bv| EdgePolarity::Positive.edge_weight(s, t, a, av, b, bv),
            &[1],
            MAX_USEFUL_UNIQUE_VALUES,
        )
        .unwrap_err();
        assert!(matches!(err, WatermarkError::IncompatibleDimensions(_)));
    }

    #[test]
    fn projecting_out_a_feature_drops_all_its_values() {
        let mut graph = InteractionGraph::new();
        graph.add_edge(n(0, 1.0), n(1, 5.0), 3.0);
        graph.add_edge(n(0, 2.0), n(1, 6.0), 2.0);
        graph.add_edge(n(2, 0.0), n(1, 6.0), 1.0);
        graph.add_edge(n(2, 0.0), n(3, 1.0), 1.0);

        let retired: BTreeSet<FeatureIndex> = [1].into_iter().collect();
        let pruned = graph.without_features(&retired);
        assert!(pruned.nodes().all(|node| node.feature != 1));
        assert_eq!(pruned.edge_count(), 1);
        assert_eq!(pruned.node_count(), 4);
        // the original graph is untouched
        assert_eq!(graph.edge_count(), 4);
    }

    #[test]
    fn merge_unions_nodes_and_edges() {
        let mut a = InteractionGraph::new();
        a.add_edge(n(0, 1.0), n(1, 1.0), 1.0);
        let mut b = InteractionGraph::new();
        b.add_edge(n(0, 1.0), n(1, 1.0), 4.0);
        b.add_edge(n(2, 1.0), n(1, 1.0), 2.0);

        a.merge(&b);
        assert_eq!(a.node_count(), 3);
        assert_eq!(a.edge_count(), 2);
        assert_eq!(a.weight(&n(0, 1.0), &n(1, 1.0)), Some(4.0));
    }
}
