//! The two interchangeable symmetry backends and the per-state data they
//! operate on.
//!
//! A [`Basis`][crate::basis::Basis] holds one [`StateRecord`] per basis state
//! and one [`Symmetry`] value. Whenever the basis is reordered or truncated, the
//! records are moved as a unit, so electron counts, parity bits, and backend
//! labels can never fall out of step with each other; the backend then
//! rebuilds whatever tables it derives from the records.

use crate::{
    config::{ SymmetryKind, TruncationParams },
    store::{ DataIn, DataOut, StoreResult },
};

pub mod local;
pub mod su2;

pub use local::LocalSymmetry;
pub use su2::{ Jm, SparseFactors, Su2Symmetry };

/// Everything known about a single basis state apart from its quantum number.
///
/// The quantum number itself is stored once per partition by the basis.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StateRecord {
    electrons: u32,
    odd: bool,
    /// Spin labels; always [`Jm::ZERO`] under the local backend.
    pub jm: Jm,
    /// Distinguishes otherwise degenerate multiplets under the SU(2) backend;
    /// always `0` under the local backend.
    pub flavor: u32,
}

impl StateRecord {
    /// Create a new record for an abelian state.
    pub fn new(electrons: u32) -> Self {
        Self { electrons, odd: electrons & 1 == 1, jm: Jm::ZERO, flavor: 0 }
    }

    /// Create a new record carrying spin labels.
    pub fn with_spin(electrons: u32, jm: Jm, flavor: u32) -> Self {
        Self { electrons, odd: electrons & 1 == 1, jm, flavor }
    }

    /// Return the electron count.
    pub fn electrons(&self) -> u32 { self.electrons }

    /// Set the electron count, updating the parity bit.
    pub fn set_electrons(&mut self, electrons: u32) {
        self.electrons = electrons;
        self.odd = electrons & 1 == 1;
    }

    /// Return `true` if the state has an odd number of electrons.
    pub fn is_odd(&self) -> bool { self.odd }
}

/// Pick states to discard, smallest weight first, where states are handled in
/// indivisible groups.
///
/// Groups are dropped until no more than `kept` states remain (the last group
/// is never dropped), and then, if a tolerance is set, until the next group
/// would push the total discarded weight above the tolerance or the number of
/// remaining states below `params.min_kept`.
pub(crate) fn select_discarded(
    mut groups: Vec<(f64, Vec<usize>)>,
    kept: usize,
    params: &TruncationParams,
) -> Vec<usize>
{
    let total: usize = groups.iter().map(|(_, g)| g.len()).sum();
    if total == 0 { return Vec::new(); }
    // group weight is summed over its states, so compare by the mean
    groups.sort_by(|(wa, ga), (wb, gb)| {
        let ma = wa / ga.len().max(1) as f64;
        let mb = wb / gb.len().max(1) as f64;
        ma.total_cmp(&mb)
    });
    let ngroups = groups.len();
    let mut remaining = total;
    let mut discarded_weight = 0.0;
    let mut removed: Vec<usize> = Vec::new();
    let mut k: usize = 0;
    while k + 1 < ngroups && remaining > kept {
        let (w, g) = &groups[k];
        remaining -= g.len();
        discarded_weight += w;
        removed.extend(g.iter().copied());
        k += 1;
    }
    if params.tolerance > 0.0 {
        while k + 1 < ngroups {
            let (w, g) = &groups[k];
            if remaining.saturating_sub(g.len()) < params.min_kept
                || discarded_weight + w > params.tolerance
            {
                break;
            }
            remaining -= g.len();
            discarded_weight += w;
            removed.extend(g.iter().copied());
            k += 1;
        }
    }
    removed
}

/// Active symmetry backend for a single basis.
#[derive(Clone, Debug, PartialEq)]
pub enum Symmetry {
    Local(LocalSymmetry),
    Su2(Su2Symmetry),
}

impl Symmetry {
    /// Create an empty backend of the given kind.
    pub fn new(kind: SymmetryKind) -> Self {
        match kind {
            SymmetryKind::Local => Self::Local(LocalSymmetry::default()),
            SymmetryKind::Su2 => Self::Su2(Su2Symmetry::default()),
        }
    }

    /// Return which backend this is.
    pub fn kind(&self) -> SymmetryKind {
        match self {
            Self::Local(_) => SymmetryKind::Local,
            Self::Su2(_) => SymmetryKind::Su2,
        }
    }

    /// Rebuild derived tables after the records have been replaced.
    pub fn rebuild(&mut self, records: &[StateRecord]) {
        match self {
            Self::Local(_) => { },
            Self::Su2(su2) => { su2.rebuild(records); },
        }
    }

    /// Update for a truncation; `records` are the surviving states.
    pub fn truncate(&mut self, records: &[StateRecord]) {
        match self {
            Self::Local(_) => { },
            Self::Su2(su2) => { su2.truncate(records); },
        }
    }

    /// Select the states to discard given per-state weights (in basis order),
    /// the target number of kept states, and the truncation controls.
    ///
    /// The result is in selection order, not sorted.
    pub fn calc_removed_indices(
        &self,
        weights: &[f64],
        kept: usize,
        params: &TruncationParams,
    ) -> Vec<usize>
    {
        match self {
            Self::Local(local) => local.calc_removed_indices(weights, kept, params),
            Self::Su2(su2) => su2.calc_removed_indices(weights, kept, params),
        }
    }

    /// Return the flavor of state `i`.
    pub fn flavor(&self, records: &[StateRecord], i: usize) -> u32 {
        match self {
            Self::Local(local) => local.flavor(i),
            Self::Su2(_) => records[i].flavor,
        }
    }

    /// Write the backend-specific sub-group under `prefix`.
    pub fn write<W>(&self, out: &mut W, prefix: &str, records: &[StateRecord])
        -> StoreResult<()>
    where W: DataOut
    {
        match self {
            Self::Local(local) => local.write(out, prefix),
            Self::Su2(su2) => su2.write(out, prefix, records),
        }
    }

    /// Read the backend-specific sub-group under `prefix`, filling in the
    /// backend's part of `records`.
    pub fn read<R>(
        kind: SymmetryKind,
        input: &mut R,
        prefix: &str,
        records: &mut [StateRecord],
    ) -> StoreResult<Self>
    where R: DataIn
    {
        match kind {
            SymmetryKind::Local
                => LocalSymmetry::read(input, prefix).map(Self::Local),
            SymmetryKind::Su2
                => Su2Symmetry::read(input, prefix, records).map(Self::Su2),
        }
    }
}
