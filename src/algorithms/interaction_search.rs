// src/algorithms/interaction_search.rs

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::interaction_graph::{build_interaction_graph, EdgePolarity, InteractionGraph, MAX_USEFUL_UNIQUE_VALUES};
use crate::cache::{CacheKey, CacheStore, MappedInteractionTensor};
use crate::core::{FeatureIndex, Node, Result, SampleMatrix, WatermarkError};
use crate::traits::{FeatureSelector, InteractionSource, ValueSelector};

/// Search criteria of the global interaction selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCriteria {
    /// Keep positively summed interactions, maximise path weight.
    SimpleSumWeight,
    /// Keep negatively summed interactions, minimise path weight.
    SimpleSumWeightNeg,
}

impl SearchCriteria {
    pub fn name(&self) -> &'static str {
        match self {
            SearchCriteria::SimpleSumWeight => "shapi_simpsum_weight",
            SearchCriteria::SimpleSumWeightNeg => "shapi_simpsum_weight_neg",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SearchCriteria::SimpleSumWeight => {
                "Searches interactivity graph for values with largest summed interactivity"
            }
            SearchCriteria::SimpleSumWeightNeg => {
                "Searches interactivity graph for values with smallest summed interactivity"
            }
        }
    }

    pub fn polarity(&self) -> EdgePolarity {
        match self {
            SearchCriteria::SimpleSumWeight => EdgePolarity::Positive,
            SearchCriteria::SimpleSumWeightNeg => EdgePolarity::Negative,
        }
    }
}

impl FromStr for SearchCriteria {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shapi_simpsum_weight" => Ok(SearchCriteria::SimpleSumWeight),
            "shapi_simpsum_weight_neg" => Ok(SearchCriteria::SimpleSumWeightNeg),
            other => Err(WatermarkError::UnsupportedCriteria(other.to_string())),
        }
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for the global interaction search.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Candidate features with more distinct values are skipped when building graphs.
    pub max_unique_values: usize,
    /// Maximum number of edges on a searched path. `None` searches to any depth.
    pub depth_limit: Option<usize>,
    /// Rows of the bound matrix the interaction tensor is computed over.
    pub interaction_samples: usize,
    /// Seed for choosing those rows; fixed so cached tensors stay valid across runs.
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_unique_values: MAX_USEFUL_UNIQUE_VALUES,
            depth_limit: None,
            interaction_samples: 2000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Uninitialized,
    GraphBuilding,
    Searching,
    Done,
}

/// Merged graph as persisted, with the seeds it was built from.
#[derive(Serialize, Deserialize)]
struct MergedGraphArtifact {
    seeds: Vec<FeatureIndex>,
    graph: InteractionGraph,
}

/// One extracted chain of interacting (feature, value) nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPath {
    pub nodes: Vec<Node>,
    pub weight: f64,
}

fn improves(polarity: EdgePolarity, candidate: f64, best: f64) -> bool {
    match polarity {
        EdgePolarity::Positive => candidate > best,
        EdgePolarity::Negative => candidate < best,
    }
}

/// Finds the best cumulative-weight path in `graph`.
///
/// Every node is tried as a start and every simple path from it is scored, where
/// a path never holds two nodes of the same feature. Only paths strictly better
/// than zero in the polarity's direction count, and the first one found wins ties.
/// An empty graph yields an empty path of weight zero.
///
/// The enumeration is exhaustive, so its cost grows exponentially with path
/// length on dense graphs; `depth_limit` caps the number of edges per path.
pub fn find_best_path(graph: &InteractionGraph, polarity: EdgePolarity, depth_limit: Option<usize>) -> (Vec<Node>, f64) {
    let mut best: (Vec<Node>, f64) = (Vec::new(), 0.0);
    for start in graph.nodes() {
        let mut path = vec![*start];
        let mut path_features: HashSet<FeatureIndex> = HashSet::new();
        path_features.insert(start.feature);
        descend(
            graph,
            polarity,
            depth_limit,
            &mut path,
            &mut path_features,
            0.0,
            &mut best,
        );
    }
    best
}

#[allow(clippy::too_many_arguments)]
fn descend(
    graph: &InteractionGraph,
    polarity: EdgePolarity,
    depth_limit: Option<usize>,
    path: &mut Vec<Node>,
    path_features: &mut HashSet<FeatureIndex>,
    weight: f64,
    best: &mut (Vec<Node>, f64),
) {
    if depth_limit.map_or(false, |limit| path.len() > limit) {
        return;
    }
    let Some(&tail) = path.last() else {
        return;
    };
    for (next, edge_weight) in graph.successors(&tail) {
        if path_features.contains(&next.feature) {
            continue;
        }
        path.push(*next);
        path_features.insert(next.feature);

        let total = weight + edge_weight;
        if improves(polarity, total, best.1) {
            *best = (path.clone(), total);
        }
        descend(graph, polarity, depth_limit, path, path_features, total, best);

        path_features.remove(&next.feature);
        path.pop();
    }
}

/// Greedily extracts best paths until `num_features` features are found or the
/// graph has no useful structure left.
///
/// After each path, every node sharing a feature with the path is projected out,
/// so no feature is picked twice under different values.
pub fn extract_best_paths(
    mut graph: InteractionGraph,
    polarity: EdgePolarity,
    num_features: usize,
    depth_limit: Option<usize>,
) -> Vec<SearchPath> {
    let mut paths = Vec::new();
    let mut found = 0usize;
    while found < num_features {
        let (nodes, weight) = find_best_path(&graph, polarity, depth_limit);
        if nodes.is_empty() {
            tracing::info!(found, requested = num_features, "no more interactive features remaining");
            break;
        }
        tracing::info!(
            features = nodes.len(),
            weight,
            path = %nodes.iter().map(Node::to_string).collect::<Vec<_>>().join(" -> "),
            "found interactive path"
        );

        let retired: BTreeSet<FeatureIndex> = nodes.iter().map(|n| n.feature).collect();
        graph = graph.without_features(&retired);
        found += nodes.len();
        paths.push(SearchPath { nodes, weight });
    }
    paths
}

/// Feature and value selector driven by SHAP interaction graphs.
///
/// Seed features come from an upstream selector; each seed's interaction graph
/// against every other feature is built (or loaded from the cache), the graphs are
/// merged, and best-weight paths are extracted greedily. Requests the graph cannot
/// satisfy are padded from the seed feature and value selectors.
pub struct InteractionSearchSelector<'a> {
    criteria: SearchCriteria,
    seed_feature_selector: Box<dyn FeatureSelector + 'a>,
    seed_value_selector: Box<dyn ValueSelector + 'a>,
    interactions: Box<dyn InteractionSource + 'a>,
    cache: CacheStore,
    config: SearchConfig,
    samples: Option<SampleMatrix>,
    phase: SearchPhase,
    requested: usize,
    discovered: Vec<Node>,
    best_paths: Vec<SearchPath>,
}

impl<'a> InteractionSearchSelector<'a> {
    pub fn new(
        criteria: &str,
        seed_feature_selector: Box<dyn FeatureSelector + 'a>,
        seed_value_selector: Box<dyn ValueSelector + 'a>,
        interactions: Box<dyn InteractionSource + 'a>,
        cache: CacheStore,
        config: Option<SearchConfig>,
    ) -> Result<Self> {
        let criteria: SearchCriteria = criteria.parse()?;
        Ok(InteractionSearchSelector {
            criteria,
            seed_feature_selector,
            seed_value_selector,
            interactions,
            cache,
            config: config.unwrap_or_default(),
            samples: None,
            phase: SearchPhase::Uninitialized,
            requested: 0,
            discovered: Vec::new(),
            best_paths: Vec::new(),
        })
    }

    pub fn criteria(&self) -> SearchCriteria {
        self.criteria
    }

    pub fn description(&self) -> &'static str {
        self.criteria.description()
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    /// Binds the training matrix. Any previous search result is discarded.
    pub fn bind(&mut self, samples: SampleMatrix) {
        self.samples = Some(samples);
        self.reset();
    }

    pub fn is_bound(&self) -> bool {
        self.samples.is_some()
    }

    /// The interacting paths behind a request for `num_features` features.
    pub fn get_interactive_feature_tuples(&mut self, num_features: usize) -> Result<&[SearchPath]> {
        self.ensure_searched(num_features)?;
        Ok(&self.best_paths)
    }

    /// The (feature, value) pairs found by the graph search, at most the requested count.
    pub fn discovered(&self) -> &[Node] {
        &self.discovered
    }

    fn reset(&mut self) {
        self.phase = SearchPhase::Uninitialized;
        self.requested = 0;
        self.discovered.clear();
        self.best_paths.clear();
    }

    fn ensure_searched(&mut self, num_features: usize) -> Result<()> {
        if self.phase == SearchPhase::Done && self.requested == num_features {
            return Ok(());
        }
        self.reset();
        let outcome = self.run_pipeline(num_features);
        if outcome.is_err() {
            self.reset();
        }
        outcome
    }

    fn run_pipeline(&mut self, num_features: usize) -> Result<()> {
        if self.samples.is_none() {
            return Err(WatermarkError::InvalidInput(
                "Interaction search selector has no training samples bound.".to_string(),
            ));
        }

        self.phase = SearchPhase::GraphBuilding;
        let graph = self.create_interaction_graph(num_features)?;

        self.phase = SearchPhase::Searching;
        let paths = extract_best_paths(graph, self.criteria.polarity(), num_features, self.config.depth_limit);

        let mut discovered: Vec<Node> = paths.iter().flat_map(|p| p.nodes.iter().copied()).collect();
        discovered.truncate(num_features);
        self.discovered = discovered;
        self.best_paths = paths;
        self.requested = num_features;
        self.phase = SearchPhase::Done;
        Ok(())
    }

    /// Seed selector name plus the settings that shape a graph, e.g. `fixed-u50-s2000`.
    fn graph_tag(&self) -> String {
        format!(
            "{}-u{}-s{}",
            self.seed_feature_selector.name(),
            self.config.max_unique_values,
            self.config.interaction_samples
        )
    }

    fn seed_graph_key(&self, seed: FeatureIndex) -> CacheKey {
        CacheKey::SeedGraph {
            selector: self.graph_tag(),
            criteria: self.criteria.name().to_string(),
            seed,
        }
    }

    fn create_interaction_graph(&mut self, num_features: usize) -> Result<InteractionGraph> {
        let merged_key = CacheKey::MergedGraph {
            selector: self.graph_tag(),
            criteria: self.criteria.name().to_string(),
            features: num_features,
        };
        let seeds = self.seed_feature_selector.get_features(num_features)?;
        if let Some(stored) = self.cache.load::<MergedGraphArtifact>(&merged_key)? {
            if stored.seeds == seeds {
                return Ok(stored.graph);
            }
            tracing::debug!(?seeds, cached = ?stored.seeds, "merged graph built from other seeds, rebuilding");
        }

        let start = Instant::now();
        let missing = seeds.iter().any(|&s| !self.cache.exists(&self.seed_graph_key(s)));
        let prepared = if missing {
            Some(self.interaction_sample()?)
        } else {
            None
        };

        let mut merged = InteractionGraph::new();
        for (i, &seed) in seeds.iter().enumerate() {
            let key = self.seed_graph_key(seed);
            let graph = match self.cache.load::<InteractionGraph>(&key)? {
                Some(graph) => graph,
                None => {
                    let (subset, tensor) = prepared.as_ref().ok_or_else(|| {
                        WatermarkError::InternalError(format!("Seed graph for {} vanished from the cache.", seed))
                    })?;
                    let seed_start = Instant::now();
                    let candidates: Vec<FeatureIndex> = (0..subset.ncols()).filter(|&f| f != seed).collect();
                    let polarity = self.criteria.polarity();
                    let graph = build_interaction_graph(
                        seed,
                        subset.view(),
                        tensor.view()?,
                        |s, t, a, av, b, bv| polarity.edge_weight(s, t, a, av, b, bv),
                        &candidates,
                        self.config.max_unique_values,
                    )?;
                    tracing::info!(
                        seed,
                        nodes = graph.node_count(),
                        edges = graph.edge_count(),
                        elapsed_secs = seed_start.elapsed().as_secs_f64(),
                        "built seed interaction graph"
                    );
                    self.cache.store(&key, &graph)?;
                    graph
                }
            };
            merged.merge(&graph);
            tracing::debug!(processed = i + 1, total = seeds.len(), "merged seed graph");
        }

        tracing::info!(
            nodes = merged.node_count(),
            edges = merged.edge_count(),
            elapsed_secs = start.elapsed().as_secs_f64(),
            "final interaction graph"
        );
        let artifact = MergedGraphArtifact { seeds, graph: merged };
        self.cache.store(&merged_key, &artifact)?;
        Ok(artifact.graph)
    }

    /// Reproducible row subset of the bound matrix and its (cached) interaction tensor.
    fn interaction_sample(&self) -> Result<(SampleMatrix, MappedInteractionTensor)> {
        let samples = self.samples.as_ref().ok_or_else(|| {
            WatermarkError::InvalidInput("Interaction search selector has no training samples bound.".to_string())
        })?;
        let count = self.config.interaction_samples.min(samples.nrows());
        if count == 0 {
            return Err(WatermarkError::InvalidInput(
                "No samples available for interaction values.".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut rows = rand::seq::index::sample(&mut rng, samples.nrows(), count).into_vec();
        rows.sort_unstable();
        let subset = samples.select(Axis(0), &rows);

        let tensor = self
            .cache
            .load_or_compute_tensor(count, samples.ncols(), || self.interactions.interaction_values(subset.view()))?;
        Ok((subset, tensor))
    }
}

impl FeatureSelector for InteractionSearchSelector<'_> {
    fn name(&self) -> &str {
        self.criteria.name()
    }

    fn get_features(&mut self, num_features: usize) -> Result<Vec<FeatureIndex>> {
        self.ensure_searched(num_features)?;

        let mut result: Vec<FeatureIndex> = self.discovered.iter().map(|n| n.feature).collect();
        let missing = num_features - result.len();
        if missing > 0 {
            let wanted = num_features + result.len();
            let seeds = match self.seed_feature_selector.get_features(wanted) {
                Ok(seeds) => seeds,
                Err(WatermarkError::InsufficientFeatures { available, .. }) => {
                    self.seed_feature_selector.get_features(available)?
                }
                Err(e) => return Err(e),
            };
            let chosen: HashSet<FeatureIndex> = result.iter().copied().collect();
            result.extend(seeds.into_iter().filter(|f| !chosen.contains(f)).take(missing));
            if result.len() < num_features {
                return Err(WatermarkError::InsufficientFeatures {
                    requested: num_features,
                    available: result.len(),
                });
            }
            tracing::debug!(padded = missing, "padded interaction features from seed selector");
        }
        Ok(result)
    }
}

impl ValueSelector for InteractionSearchSelector<'_> {
    fn name(&self) -> &str {
        self.criteria.name()
    }

    fn get_feature_values(&mut self, feature_ids: &[FeatureIndex]) -> Result<Vec<f64>> {
        if self.phase != SearchPhase::Done {
            self.ensure_searched(feature_ids.len())?;
        }

        let found: HashMap<FeatureIndex, f64> = self.discovered.iter().map(|n| (n.feature, n.value)).collect();
        let pending: Vec<FeatureIndex> = feature_ids.iter().copied().filter(|f| !found.contains_key(f)).collect();
        let padded = if pending.is_empty() {
            Vec::new()
        } else {
            self.seed_value_selector.get_feature_values(&pending)?
        };
        if padded.len() != pending.len() {
            return Err(WatermarkError::InternalError(format!(
                "Seed value selector returned {} values for {} features.",
                padded.len(),
                pending.len()
            )));
        }

        let mut padded = padded.into_iter();
        let mut values = Vec::with_capacity(feature_ids.len());
        for feature in feature_ids {
            match found.get(feature) {
                Some(&value) => values.push(value),
                None => values.push(padded.next().ok_or_else(|| {
                    WatermarkError::InternalError("ran out of padded values".to_string())
                })?),
            }
        }
        Ok(values)
    }
}
