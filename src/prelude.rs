pub use crate::data::embedding::Embedding;
pub use crate::data::nearest_neighbours::{
    parse_ann_search, run_ann_search, AnnSearch, NearestNeighbourParams,
};
pub use crate::data::structures::{SparseMatrix, SparseRow};
pub use crate::error::{HsneError, Result};
pub use crate::evaluation::{
    compute_cluster_neighbourhood_preservation, compute_precision_recall,
    compute_precision_recall_with_mapping,
};
pub use crate::hsne::io::{load_hsne, save_hsne};
pub use crate::hsne::{
    AoiStrategy, Cluster, ClusterTree, HierarchicalSne, HsneParams, Scale, Statistics, NULL_LINK,
};
pub use crate::training::tsne_optimiser::{TsneParams, WeightedTsne};
pub use crate::{construct_tsne_affinities, embed_scale, tsne};
