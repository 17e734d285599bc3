use num_traits::{Float, FromPrimitive, ToPrimitive};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::ops::AddAssign;

use crate::data::structures::SparseRow;
use crate::error::{HsneError, Result};
use crate::hsne::HierarchicalSne;

/// Parent id of the clusters of the top scale
pub const NULL_LINK: i64 = -1;

/////////////
// Cluster //
/////////////

/// Named set of landmarks of one scale
///
/// ### Fields
///
/// * `id` - Identifier, unique within its scale
/// * `parent_id` - Cluster of the next scale containing this one, or
///   `NULL_LINK` on the top scale
/// * `landmarks` - Landmarks of the scale the cluster lives on
/// * `notes` - Free text
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cluster {
    pub id: i64,
    pub parent_id: i64,
    pub landmarks: FxHashSet<usize>,
    pub notes: String,
}

impl Cluster {
    pub fn new(id: i64, parent_id: i64) -> Self {
        Self {
            id,
            parent_id,
            ..Default::default()
        }
    }

    pub fn with_landmarks<I>(id: i64, parent_id: i64, landmarks: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        Self {
            id,
            parent_id,
            landmarks: landmarks.into_iter().collect(),
            notes: String::new(),
        }
    }
}

/// Sums of influence falling into each cluster, plus what no cluster claims
fn cluster_influence<'a, T, I>(clusters: I, influence: &SparseRow<T>, totals: &mut [T]) -> T
where
    T: Float,
    I: Iterator<Item = &'a Cluster> + Clone,
{
    let mut unclustered = T::zero();
    for (l, v) in influence.iter() {
        let mut found = false;
        for (i, cluster) in clusters.clone().enumerate() {
            if cluster.landmarks.contains(&l) {
                totals[i] = totals[i] + v;
                found = true;
            }
        }
        if !found {
            unclustered = unclustered + v;
        }
    }
    unclustered
}

/// Index of the strictly largest value above `floor`
fn strict_argmax<T: Float>(values: &[T], floor: T) -> Option<(usize, T)> {
    let mut best = None;
    let mut max = floor;
    for (i, &v) in values.iter().enumerate() {
        if v > max {
            max = v;
            best = Some((i, v));
        }
    }
    best
}

/////////////////
// ClusterTree //
/////////////////

/// Clusters of landmarks organised along the scales of a hierarchy
///
/// Every cluster below the top scale names a parent in the next scale.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterTree {
    cluster_tree: Vec<Vec<Cluster>>,
}

impl ClusterTree {
    /// Empty tree with `num_scales` scales
    pub fn new(num_scales: usize) -> Self {
        Self {
            cluster_tree: vec![Vec::new(); num_scales],
        }
    }

    /// Empty tree with the scales of a hierarchy
    pub fn from_hsne<T>(hsne: &HierarchicalSne<T>) -> Self
    where
        T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
    {
        Self::new(hsne.num_scales())
    }

    pub fn num_scales(&self) -> usize {
        self.cluster_tree.len()
    }

    /// Clusters of every scale
    pub fn cluster_tree(&self) -> &[Vec<Cluster>] {
        &self.cluster_tree
    }

    fn check_scale(&self, scale_id: usize, caller: &str) -> Result<()> {
        if scale_id >= self.cluster_tree.len() {
            return Err(HsneError::Logic(format!(
                "ClusterTree::{}: invalid scale {}",
                caller, scale_id
            )));
        }
        Ok(())
    }

    fn position(&self, scale_id: usize, cluster_id: i64) -> Option<usize> {
        self.cluster_tree[scale_id]
            .iter()
            .position(|c| c.id == cluster_id)
    }

    /// Smallest non-negative id not used on a scale
    pub fn get_free_cluster_id(&self, scale_id: usize) -> Result<i64> {
        self.check_scale(scale_id, "get_free_cluster_id")?;
        let used: FxHashSet<i64> = self.cluster_tree[scale_id].iter().map(|c| c.id).collect();
        Ok((0..).find(|id| !used.contains(id)).unwrap_or_default())
    }

    /// Add a cluster to a scale
    ///
    /// ### Returns
    ///
    /// `HsneError::Logic` if the scale is invalid, the id is taken, a top
    /// scale cluster has a parent or a lower scale cluster has none
    pub fn add_cluster(&mut self, scale_id: usize, cluster: Cluster) -> Result<()> {
        self.check_scale(scale_id, "add_cluster")?;
        if self.position(scale_id, cluster.id).is_some() {
            return Err(HsneError::Logic(format!(
                "ClusterTree::add_cluster: duplicated id {} at scale {}",
                cluster.id, scale_id
            )));
        }
        let is_top = scale_id == self.cluster_tree.len() - 1;
        if is_top && cluster.parent_id != NULL_LINK {
            return Err(HsneError::Logic(
                "ClusterTree::add_cluster: root clusters must have parent_id = NULL_LINK"
                    .to_string(),
            ));
        }
        if !is_top && cluster.parent_id == NULL_LINK {
            return Err(HsneError::Logic(
                "ClusterTree::add_cluster: non-root clusters must have a parent".to_string(),
            ));
        }
        self.cluster_tree[scale_id].push(cluster);
        Ok(())
    }

    /// Remove a cluster; unknown ids are ignored
    pub fn remove_cluster(&mut self, scale_id: usize, cluster_id: i64) -> Result<()> {
        self.check_scale(scale_id, "remove_cluster")?;
        if let Some(pos) = self.position(scale_id, cluster_id) {
            self.cluster_tree[scale_id].remove(pos);
        }
        Ok(())
    }

    pub fn has_cluster_id(&self, scale_id: usize, cluster_id: i64) -> Result<bool> {
        self.check_scale(scale_id, "has_cluster_id")?;
        Ok(self.position(scale_id, cluster_id).is_some())
    }

    pub fn cluster(&self, scale_id: usize, cluster_id: i64) -> Result<&Cluster> {
        self.check_scale(scale_id, "cluster")?;
        self.position(scale_id, cluster_id)
            .map(|pos| &self.cluster_tree[scale_id][pos])
            .ok_or_else(|| {
                HsneError::Logic(format!(
                    "ClusterTree::cluster: no cluster {} at scale {}",
                    cluster_id, scale_id
                ))
            })
    }

    /// Check that the parent of a cluster receives most of its influence
    ///
    /// The area of influence of the cluster's landmarks on the next scale is
    /// split between the clusters of that scale; the unclustered remainder
    /// competes as well. The cluster is consistent if its parent wins. Top
    /// scale clusters are always consistent.
    pub fn check_cluster_consistency<T>(
        &self,
        hsne: &HierarchicalSne<T>,
        scale_id: usize,
        cluster_id: i64,
    ) -> Result<bool>
    where
        T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
    {
        let cluster = self.cluster(scale_id, cluster_id)?;
        if scale_id == self.cluster_tree.len() - 1 {
            log::debug!(
                "Cluster {} at scale {} is a root node => valid",
                cluster_id,
                scale_id
            );
            return Ok(true);
        }

        let aoi = &hsne.scale(scale_id + 1)?.area_of_influence;
        let parents = &self.cluster_tree[scale_id + 1];
        let mut influence = vec![T::zero(); parents.len()];
        let mut unclustered = T::zero();

        for &e in &cluster.landmarks {
            let row = aoi.get(e).ok_or_else(|| {
                HsneError::InvalidArgument(format!(
                    "Cluster {} refers to landmark {} which does not exist at scale {}",
                    cluster_id, e, scale_id
                ))
            })?;
            unclustered =
                unclustered + cluster_influence(parents.iter(), row, &mut influence);
        }

        let winner = strict_argmax(&influence, unclustered).map(|(i, _)| parents[i].id);
        let valid = winner.unwrap_or(NULL_LINK) == cluster.parent_id;

        log::debug!(
            "Cluster {} at scale {} with parent {} ({}): unclustered {:.4}, winner {:?} => {}",
            cluster_id,
            scale_id,
            cluster.parent_id,
            cluster.notes,
            unclustered.to_f64().unwrap_or(f64::NAN),
            winner,
            if valid { "valid" } else { "INVALID" }
        );

        Ok(valid)
    }

    /// Check every cluster, top scale first
    pub fn check_tree_consistency<T>(&self, hsne: &HierarchicalSne<T>) -> Result<bool>
    where
        T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
    {
        let mut valid = true;
        for s in (0..self.cluster_tree.len()).rev() {
            for cluster in &self.cluster_tree[s] {
                valid &= self.check_cluster_consistency(hsne, s, cluster.id)?;
            }
        }
        if !valid {
            log::info!("Cluster tree is not consistent with the hierarchy");
        }
        Ok(valid)
    }

    /// Deepest cluster a data point belongs to
    ///
    /// Starting at the top scale, the cluster receiving most of the point's
    /// influence is chosen and the search continues among its children. The
    /// descent stops as soon as the unclustered influence wins.
    ///
    /// ### Returns
    ///
    /// `(scale, cluster_id, influence)`; `(top, NULL_LINK, 1)` if no top
    /// scale cluster claims the point
    pub fn compute_point_to_cluster_association<T>(
        &self,
        hsne: &HierarchicalSne<T>,
        pnt_id: usize,
    ) -> Result<(usize, i64, T)>
    where
        T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
    {
        let top = self.cluster_tree.len().checked_sub(1).ok_or_else(|| {
            HsneError::Logic("ClusterTree::compute_point_to_cluster_association: empty tree".into())
        })?;
        if self.cluster_tree.len() > hsne.num_scales() {
            return Err(HsneError::Logic(format!(
                "Cluster tree has {} scales but the hierarchy only {}",
                self.cluster_tree.len(),
                hsne.num_scales()
            )));
        }

        let influence = hsne.get_influence_on_data_point(pnt_id, T::zero(), false)?;
        let mut res = (top, NULL_LINK, T::one());
        let mut candidates: Vec<usize> = (0..self.cluster_tree[top].len()).collect();

        for s in (0..=top).rev() {
            if candidates.is_empty() {
                break;
            }
            let clusters = &self.cluster_tree[s];
            let mut totals = vec![T::zero(); candidates.len()];
            let unclustered = cluster_influence(
                candidates.iter().map(|&i| &clusters[i]),
                &influence[s],
                &mut totals,
            );

            let Some((best, max)) = strict_argmax(&totals, unclustered) else {
                break;
            };
            let cluster_id = clusters[candidates[best]].id;
            res = (s, cluster_id, max);

            candidates = if s > 0 {
                self.cluster_tree[s - 1]
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.parent_id == cluster_id)
                    .map(|(i, _)| i)
                    .collect()
            } else {
                Vec::new()
            };
        }

        Ok(res)
    }

    /// `compute_point_to_cluster_association` for every data point
    pub fn compute_points_to_cluster_association<T>(
        &self,
        hsne: &HierarchicalSne<T>,
    ) -> Result<Vec<(usize, i64, T)>>
    where
        T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
    {
        (0..hsne.num_data_points())
            .into_par_iter()
            .map(|i| self.compute_point_to_cluster_association(hsne, i))
            .collect()
    }
}
