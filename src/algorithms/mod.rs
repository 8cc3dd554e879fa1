pub mod feature_selection;
pub mod interaction_graph;
pub mod interaction_search;
pub mod value_selection;

pub use feature_selection::{rank_features, FeatureCriteria, FixedFeatureSelector, ShapFeatureSelector};
pub use interaction_graph::{build_interaction_graph, EdgePolarity, InteractionGraph, MAX_USEFUL_UNIQUE_VALUES};
pub use interaction_search::{
    extract_best_paths, find_best_path, InteractionSearchSelector, SearchConfig, SearchCriteria, SearchPath,
    SearchPhase,
};
pub use value_selection::{choose_value, PopulationValueSelector, ValueCriteria};
