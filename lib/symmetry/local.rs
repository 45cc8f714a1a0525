//! Abelian ("local") symmetry backend.
//!
//! Quantum numbers of product states are plain sums, which the basis computes
//! itself, so all that is left here is choosing which states to drop on
//! truncation.

use crate::{
    config::TruncationParams,
    store::{ DataIn, DataOut, StoreResult },
};
use super::select_discarded;

/// Abelian backend. Carries no per-basis state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalSymmetry;

impl LocalSymmetry {
    /// Select states to discard: the lowest-weight states beyond the `kept`
    /// largest, then further states while the tolerance allows.
    pub fn calc_removed_indices(
        &self,
        weights: &[f64],
        kept: usize,
        params: &TruncationParams,
    ) -> Vec<usize>
    {
        if weights.len() <= kept && params.tolerance <= 0.0 {
            return Vec::new();
        }
        let groups: Vec<(f64, Vec<usize>)>
            = weights.iter().enumerate()
            .map(|(k, w)| (*w, vec![k]))
            .collect();
        select_discarded(groups, kept, params)
    }

    /// Abelian states are never degenerate within a partition label, so every
    /// state has flavor zero.
    pub fn flavor(&self, _i: usize) -> u32 { 0 }

    pub fn write<W>(&self, out: &mut W, prefix: &str) -> StoreResult<()>
    where W: DataOut
    {
        out.create_group(&format!("{prefix}Local"))
    }

    pub fn read<R>(_input: &mut R, _prefix: &str) -> StoreResult<Self>
    where R: DataIn
    {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_largest() {
        let local = LocalSymmetry;
        let w = [0.1, 0.6, 0.05, 0.25];
        let mut removed
            = local.calc_removed_indices(&w, 2, &TruncationParams::default());
        removed.sort();
        assert_eq!(removed, vec![0, 2]);
        assert!(
            local.calc_removed_indices(&w, 4, &TruncationParams::default())
            .is_empty()
        );
    }
}
