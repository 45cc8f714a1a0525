//! Packing of several conserved labels into one "effective" quantum number.
//!
//! Each basis state carries `N` non-negative conserved labels
//! *q*<sub>*α*</sub>, all bounded by a common radix *Q*. They are combined as
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>q</i> = Σ<sub><i>α</i></sub> <i>q</i><sub><i>α</i></sub>
//!     <i>Q</i><sup><i>α</i></sup>
//!   </p>
//! </blockquote>
//! which is a bijection, preserves the lexicographic order of the label tuples
//! read from the last label to the first, and is additive whenever no label sum
//! reaches *Q*. The additivity is what lets the abelian backend compose product
//! states by plain integer addition.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QnError {
    /// Returned when a label is not strictly less than the radix.
    #[error("error in quantum number encoding: label {label} at position {pos} is not less than the base {base}")]
    LabelOutOfRange { label: u64, pos: usize, base: u64 },

    /// Returned when the wrong number of labels is passed.
    #[error("error in quantum number encoding: expected {expected} labels, got {got}")]
    WrongLabelCount { expected: usize, got: usize },

    /// Returned when the encoded value would overflow a `u64`.
    #[error("error in quantum number encoding: {base}^{labels} overflows u64")]
    Overflow { base: u64, labels: usize },
}
use QnError::*;
pub type QnResult<T> = Result<T, QnError>;

/// Order-preserving encoder of label tuples.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QnEncoder {
    base: u64,
    labels: usize,
}

impl QnEncoder {
    /// Create a new encoder for `labels` labels, each less than `base`.
    ///
    /// Fails if `base^labels` does not fit in a `u64`.
    pub fn new(base: u64, labels: usize) -> QnResult<Self> {
        let fits
            = (0..labels)
            .try_fold(1_u64, |acc, _| acc.checked_mul(base))
            .is_some();
        if fits { Ok(Self { base, labels }) } else { Err(Overflow { base, labels }) }
    }

    /// Return the radix.
    pub fn base(&self) -> u64 { self.base }

    /// Return the number of labels.
    pub fn labels(&self) -> usize { self.labels }

    /// Encode a label tuple.
    pub fn encode(&self, q: &[u64]) -> QnResult<u64> {
        if q.len() != self.labels {
            return Err(WrongLabelCount { expected: self.labels, got: q.len() });
        }
        let mut acc: u64 = 0;
        for (pos, &label) in q.iter().enumerate().rev() {
            if label >= self.base {
                return Err(LabelOutOfRange { label, pos, base: self.base });
            }
            acc = acc * self.base + label;
        }
        Ok(acc)
    }

    /// Decode an effective quantum number back into its labels.
    pub fn decode(&self, mut q: u64) -> Vec<u64> {
        (0..self.labels)
            .map(|_| {
                let label = q % self.base;
                q /= self.base;
                label
            })
            .collect()
    }

    /// Pseudo effective number used by the SU(2) backend to group states by
    /// electron number and total spin (`j2` is twice the total spin).
    pub fn pseudo(base: u64, electrons: u32, j2: u32) -> QnResult<u64> {
        Self::new(base, 2)?.encode(&[u64::from(electrons), u64::from(j2)])
    }
}
