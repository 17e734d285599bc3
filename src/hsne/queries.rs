use num_traits::{Float, FromPrimitive, ToPrimitive};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::ops::AddAssign;

use crate::data::structures::*;
use crate::error::{HsneError, Result};
use crate::hsne::HierarchicalSne;
use crate::utils::sparse_ops::{sparse_row_times_matrix, SparseAccumulator};

/// Previous-scale points need more influence than this to be followed by
/// `get_area_of_influence_top_down`.
const TOP_DOWN_INFLUENCE_THRESH: f64 = 0.3;

impl<T> HierarchicalSne<T>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
{
    fn check_scale(&self, scale_id: usize, caller: &str) -> Result<()> {
        if scale_id >= self.num_scales() {
            return Err(HsneError::Logic(format!(
                "{}: invalid scale {} (hierarchy has {} scales)",
                caller,
                scale_id,
                self.num_scales()
            )));
        }
        Ok(())
    }

    /// One accumulator per scale in `from..=to`
    fn accumulators(&self, from: usize, to: usize) -> Vec<SparseAccumulator<T>> {
        (from..=to)
            .map(|s| SparseAccumulator::new(self.hierarchy()[s].size()))
            .collect()
    }

    /// Push a row of scale `from - 1` through the areas of influence of the
    /// scales `from..=to`; `accs` comes from `accumulators(from, to)`
    fn compose_influence(
        &self,
        mut row: SparseRow<T>,
        from: usize,
        to: usize,
        accs: &mut [SparseAccumulator<T>],
    ) -> SparseRow<T> {
        let hierarchy = self.hierarchy();
        for s in from..=to {
            row = sparse_row_times_matrix(&row, &hierarchy[s].area_of_influence, &mut accs[s - from]);
        }
        row
    }

    /// Data point `i` expressed in the landmarks of `scale_id`; `accs` comes
    /// from `accumulators(2, scale_id)`
    fn influence_at_scale(
        &self,
        i: usize,
        scale_id: usize,
        accs: &mut [SparseAccumulator<T>],
    ) -> SparseRow<T> {
        if scale_id == 0 {
            return SparseRow::from_pairs(vec![(i, T::one())]);
        }
        let first = self.hierarchy()[1].area_of_influence[i].clone();
        self.compose_influence(first, 2, scale_id, accs)
    }

    fn resolve_scale(&self, scale: Option<usize>, caller: &str) -> Result<usize> {
        let scale_id = match scale {
            Some(s) => s,
            None => self.num_scales().checked_sub(1).ok_or_else(|| {
                HsneError::Logic(format!("{}: the hierarchy is empty", caller))
            })?,
        };
        self.check_scale(scale_id, caller)?;
        Ok(scale_id)
    }

    /// Previous-scale points influenced by a set of landmarks
    ///
    /// ### Params
    ///
    /// * `scale_id` - Scale of the landmarks (> 0)
    /// * `idxes` - Landmarks of `scale_id`
    ///
    /// ### Returns
    ///
    /// Point of scale `scale_id - 1` → summed influence of the selected
    /// landmarks, for every point with positive influence
    pub fn get_influenced_landmarks_in_previous_scale(
        &self,
        scale_id: usize,
        idxes: &[usize],
    ) -> Result<BTreeMap<usize, T>> {
        self.check_scale(scale_id, "get_influenced_landmarks_in_previous_scale")?;
        let selected: FxHashSet<usize> = idxes.iter().copied().collect();

        let neighbours = self.hierarchy()[scale_id]
            .area_of_influence
            .iter()
            .enumerate()
            .filter_map(|(d, row)| {
                let probability = row
                    .iter()
                    .filter(|(l, _)| selected.contains(l))
                    .fold(T::zero(), |acc, (_, v)| acc + v);
                (probability > T::zero()).then_some((d, probability))
            })
            .collect();

        Ok(neighbours)
    }

    /// Weights placing every data point relative to the landmarks of a scale
    ///
    /// ### Params
    ///
    /// * `scale` - Target scale; `None` selects the top scale
    ///
    /// ### Returns
    ///
    /// One row per data point with the landmarks of the scale as columns.
    /// `HsneError::Logic` for an invalid scale.
    pub fn get_interpolation_weights(&self, scale: Option<usize>) -> Result<SparseMatrix<T>> {
        let scale_id = self.resolve_scale(scale, "get_interpolation_weights")?;
        Ok((0..self.num_data_points())
            .into_par_iter()
            .map_init(
                || self.accumulators(2, scale_id),
                |accs, i| self.influence_at_scale(i, scale_id, accs),
            )
            .collect())
    }

    /// Interpolation weights for a subset of the data points
    ///
    /// ### Params
    ///
    /// * `data_points` - Data points of interest
    /// * `scale` - Target scale; `None` selects the top scale
    ///
    /// ### Returns
    ///
    /// One row per entry of `data_points`
    pub fn get_interpolation_weights_for(
        &self,
        data_points: &[usize],
        scale: Option<usize>,
    ) -> Result<SparseMatrix<T>> {
        let scale_id = self.resolve_scale(scale, "get_interpolation_weights_for")?;
        let n = self.num_data_points();
        if let Some(&bad) = data_points.iter().find(|&&i| i >= n) {
            return Err(HsneError::InvalidArgument(format!(
                "Data point {} out of range ({} points)",
                bad, n
            )));
        }
        Ok(data_points
            .par_iter()
            .map_init(
                || self.accumulators(2, scale_id),
                |accs, &i| self.influence_at_scale(i, scale_id, accs),
            )
            .collect())
    }

    /// Influence of the landmarks of every scale on one data point
    ///
    /// ### Params
    ///
    /// * `dp` - Data point
    /// * `thresh` - Only landmarks with at least this influence propagate to
    ///   the next scale
    /// * `normalized` - Rescale the influence of every scale (> 0) to sum 1
    ///
    /// ### Returns
    ///
    /// One row per scale; scale 0 only holds `dp` itself
    pub fn get_influence_on_data_point(
        &self,
        dp: usize,
        thresh: T,
        normalized: bool,
    ) -> Result<Vec<SparseRow<T>>> {
        if dp >= self.num_data_points() {
            return Err(HsneError::InvalidArgument(format!(
                "Data point {} out of range ({} points)",
                dp,
                self.num_data_points()
            )));
        }

        let hierarchy = self.hierarchy();
        let mut influence = Vec::with_capacity(hierarchy.len());
        influence.push(SparseRow::from_pairs(vec![(dp, T::one())]));
        if hierarchy.len() == 1 {
            return Ok(influence);
        }

        let mut first = hierarchy[1].area_of_influence[dp].clone();
        if normalized {
            first.normalise();
        }
        influence.push(first);

        for s in 2..hierarchy.len() {
            let mut filtered = influence[s - 1].clone();
            filtered.retain(|_, v| v >= thresh);
            let mut acc = SparseAccumulator::new(hierarchy[s].size());
            let mut row = sparse_row_times_matrix(&filtered, &hierarchy[s].area_of_influence, &mut acc);
            if normalized {
                row.normalise();
            }
            influence.push(row);
        }

        Ok(influence)
    }

    /// Position of points of one scale relative to the landmarks of a higher
    /// scale
    ///
    /// ### Params
    ///
    /// * `orig_scale` - Scale of the points
    /// * `dest_scale` - Target scale (> `orig_scale`)
    /// * `subset_orig_scale` - Points of `orig_scale`
    ///
    /// ### Returns
    ///
    /// One row per point of the subset with the landmarks of `dest_scale` as
    /// columns. `HsneError::Logic` for invalid scales.
    pub fn get_stochastic_location_at_higher_scale(
        &self,
        orig_scale: usize,
        dest_scale: usize,
        subset_orig_scale: &[usize],
    ) -> Result<SparseMatrix<T>> {
        if dest_scale <= orig_scale {
            return Err(HsneError::Logic(format!(
                "get_stochastic_location_at_higher_scale: destination scale {} is not above {}",
                dest_scale, orig_scale
            )));
        }
        self.check_scale(dest_scale, "get_stochastic_location_at_higher_scale")?;

        let aoi = &self.hierarchy()[orig_scale + 1].area_of_influence;
        if let Some(&bad) = subset_orig_scale.iter().find(|&&i| i >= aoi.len()) {
            return Err(HsneError::InvalidArgument(format!(
                "Point {} out of range for scale {}",
                bad, orig_scale
            )));
        }

        Ok(subset_orig_scale
            .par_iter()
            .map_init(
                || self.accumulators(orig_scale + 2, dest_scale),
                |accs, &i| self.compose_influence(aoi[i].clone(), orig_scale + 2, dest_scale, accs),
            )
            .collect())
    }

    /// Influence of a set of landmarks on every data point
    ///
    /// ### Params
    ///
    /// * `scale_id` - Scale of the landmarks
    /// * `selection` - Landmarks of `scale_id`
    ///
    /// ### Returns
    ///
    /// One value per data point
    pub fn get_area_of_influence(&self, scale_id: usize, selection: &[usize]) -> Result<Vec<T>> {
        self.check_scale(scale_id, "get_area_of_influence")?;
        let n = self.num_data_points();

        if scale_id == 0 {
            let mut aoi = vec![T::zero(); n];
            for &i in selection.iter().filter(|&&i| i < n) {
                aoi[i] = T::one();
            }
            return Ok(aoi);
        }

        let selected: FxHashSet<usize> = selection.iter().copied().collect();
        Ok((0..n)
            .into_par_iter()
            .map_init(
                || self.accumulators(2, scale_id),
                |accs, i| {
                    self.influence_at_scale(i, scale_id, accs)
                        .iter()
                        .filter(|(l, _)| selected.contains(l))
                        .fold(T::zero(), |acc, (_, v)| acc + v)
                },
            )
            .collect())
    }

    /// Data points reached by following strongly influenced points from a
    /// scale down to the data
    ///
    /// At every scale the points of the previous scale receiving more than
    /// 0.3 influence from the current selection form the next selection.
    ///
    /// ### Params
    ///
    /// * `scale_id` - Scale of the landmarks
    /// * `selection` - Landmarks of `scale_id`
    ///
    /// ### Returns
    ///
    /// One value per data point: 1 if reached, 0 otherwise
    pub fn get_area_of_influence_top_down(
        &self,
        scale_id: usize,
        selection: &[usize],
    ) -> Result<Vec<T>> {
        self.check_scale(scale_id, "get_area_of_influence_top_down")?;
        let thresh = T::from_f64(TOP_DOWN_INFLUENCE_THRESH).unwrap();

        let mut scale_selection = selection.to_vec();
        for s in (1..=scale_id).rev() {
            scale_selection = self
                .get_influenced_landmarks_in_previous_scale(s, &scale_selection)?
                .into_iter()
                .filter(|&(_, v)| v > thresh)
                .map(|(d, _)| d)
                .collect();
        }

        let n = self.num_data_points();
        let mut aoi = vec![T::zero(); n];
        for &i in scale_selection.iter().filter(|&&i| i < n) {
            aoi[i] = T::one();
        }
        Ok(aoi)
    }

    /// Call `functor(data_point, influence)` for the area of influence of a
    /// set of landmarks
    ///
    /// ### Params
    ///
    /// * `scale_id` - Scale of the landmarks
    /// * `idxes` - Landmarks of `scale_id`
    /// * `functor` - Receives every data point with its influence
    pub fn compute_aoi<F>(&self, scale_id: usize, idxes: &[usize], mut functor: F) -> Result<()>
    where
        F: FnMut(usize, T),
    {
        for (i, v) in self.get_area_of_influence(scale_id, idxes)?.into_iter().enumerate() {
            functor(i, v);
        }
        Ok(())
    }
}
