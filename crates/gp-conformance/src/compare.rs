use std::collections::BTreeMap;
use std::fmt;

use gp_core::DenseTensor;
use serde::Serialize;

use crate::CaseFailure;

pub const DEFAULT_TOLERANCE: f64 = 1e-4;

/// How a candidate output must relate to its reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EquivalencePolicy {
    /// Bit-identical values.
    Exact,
    /// `|a - b| <= atol + rtol * |b|` with `b` the candidate value.
    Close { atol: f64, rtol: f64 },
}

impl EquivalencePolicy {
    pub fn close(atol: f64, rtol: f64) -> Result<Self, String> {
        if !(atol.is_finite() && atol >= 0.0) || !(rtol.is_finite() && rtol >= 0.0) {
            return Err(format!(
                "tolerances must be finite and non-negative: atol={atol} rtol={rtol}"
            ));
        }
        Ok(Self::Close { atol, rtol })
    }

    #[must_use]
    pub fn default_close() -> Self {
        Self::Close {
            atol: DEFAULT_TOLERANCE,
            rtol: DEFAULT_TOLERANCE,
        }
    }

    #[must_use]
    pub fn admits(&self, reference: f64, candidate: f64) -> bool {
        match *self {
            Self::Exact => reference.to_bits() == candidate.to_bits(),
            Self::Close { atol, rtol } => {
                if reference.is_nan() || candidate.is_nan() {
                    return false;
                }
                if reference == candidate {
                    return true;
                }
                (reference - candidate).abs() <= rtol.mul_add(candidate.abs(), atol)
            }
        }
    }
}

impl fmt::Display for EquivalencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Close { atol, rtol } => write!(f, "close(atol={atol:e}, rtol={rtol:e})"),
        }
    }
}

/// Case default plus per-output overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    default: EquivalencePolicy,
    overrides: BTreeMap<usize, EquivalencePolicy>,
}

impl PolicySet {
    #[must_use]
    pub fn uniform(default: EquivalencePolicy) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn exact() -> Self {
        Self::uniform(EquivalencePolicy::Exact)
    }

    #[must_use]
    pub fn with_override(mut self, output: usize, policy: EquivalencePolicy) -> Self {
        self.overrides.insert(output, policy);
        self
    }

    #[must_use]
    pub fn policy_for(&self, output: usize) -> EquivalencePolicy {
        self.overrides.get(&output).copied().unwrap_or(self.default)
    }
}

/// Outcome of one reference/candidate output pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputCheck {
    pub index: usize,
    pub policy: EquivalencePolicy,
    pub shape: Vec<usize>,
    pub passed: bool,
    pub mismatch_count: usize,
    pub max_abs_diff: f64,
    pub first_mismatch: Option<usize>,
    pub reference_digest: u64,
    pub candidate_digest: u64,
}

/// Pairs outputs positionally and applies each position's policy.
///
/// Arity, shape or dtype disagreement is structural and fails regardless of
/// policy. A numeric failure is reported per output through
/// [`OutputCheck::passed`].
pub fn compare_outputs(
    reference: &[DenseTensor],
    candidate: &[DenseTensor],
    policies: &PolicySet,
) -> Result<Vec<OutputCheck>, CaseFailure> {
    if reference.len() != candidate.len() {
        return Err(CaseFailure::StructuralMismatch {
            reason: format!(
                "output arity mismatch: reference={} candidate={}",
                reference.len(),
                candidate.len()
            ),
        });
    }

    let mut checks = Vec::with_capacity(reference.len());
    for (index, (expected, actual)) in reference.iter().zip(candidate).enumerate() {
        if expected.shape() != actual.shape() {
            return Err(CaseFailure::StructuralMismatch {
                reason: format!(
                    "output {index} shape mismatch: reference={:?} candidate={:?}",
                    expected.shape(),
                    actual.shape()
                ),
            });
        }
        if expected.dtype() != actual.dtype() {
            return Err(CaseFailure::StructuralMismatch {
                reason: format!(
                    "output {index} dtype mismatch: reference={} candidate={}",
                    expected.dtype().label(),
                    actual.dtype().label()
                ),
            });
        }
        checks.push(check_pair(index, expected, actual, policies.policy_for(index)));
    }
    Ok(checks)
}

fn check_pair(
    index: usize,
    reference: &DenseTensor,
    candidate: &DenseTensor,
    policy: EquivalencePolicy,
) -> OutputCheck {
    let mut mismatch_count = 0usize;
    let mut max_abs_diff = 0.0f64;
    let mut first_mismatch = None;
    for (position, (a, b)) in reference
        .values()
        .iter()
        .zip(candidate.values())
        .enumerate()
    {
        let diff = (a - b).abs();
        if diff.is_nan() {
            if a.to_bits() != b.to_bits() {
                max_abs_diff = f64::INFINITY;
            }
        } else {
            max_abs_diff = max_abs_diff.max(diff);
        }
        if !policy.admits(*a, *b) {
            mismatch_count += 1;
            first_mismatch.get_or_insert(position);
        }
    }
    OutputCheck {
        index,
        policy,
        shape: reference.shape().to_vec(),
        passed: mismatch_count == 0,
        mismatch_count,
        max_abs_diff,
        first_mismatch,
        reference_digest: reference.digest64(),
        candidate_digest: candidate.digest64(),
    }
}

#[cfg(test)]
mod tests {
    use gp_core::{DType, DenseTensor};
    use proptest::prelude::*;

    use super::{EquivalencePolicy, PolicySet, compare_outputs};
    use crate::CaseFailure;

    fn tensor(values: &[f64]) -> DenseTensor {
        DenseTensor::new(vec![values.len()], DType::F64, values.to_vec()).expect("tensor")
    }

    #[test]
    fn exact_policy_is_bitwise() {
        let exact = EquivalencePolicy::Exact;
        assert!(exact.admits(0.25, 0.25));
        assert!(!exact.admits(0.0, -0.0));
        assert!(!exact.admits(1.0, 1.0 + f64::EPSILON));
    }

    #[test]
    fn close_policy_uses_candidate_as_scale() {
        let policy = EquivalencePolicy::close(0.0, 0.1).expect("policy");
        // |a-b| = 1, rtol*|b| = 1.0 when b = 10 but 0.9 when b = 9
        assert!(policy.admits(9.0, 10.0));
        assert!(!policy.admits(10.0, 9.0));
    }

    #[test]
    fn close_policy_rejects_nan_and_accepts_matching_infinity() {
        let policy = EquivalencePolicy::default_close();
        assert!(!policy.admits(f64::NAN, f64::NAN));
        assert!(!policy.admits(1.0, f64::NAN));
        assert!(policy.admits(f64::INFINITY, f64::INFINITY));
        assert!(!policy.admits(f64::INFINITY, f64::NEG_INFINITY));
    }

    #[test]
    fn negative_tolerances_are_rejected() {
        assert!(EquivalencePolicy::close(-1e-4, 1e-4).is_err());
        assert!(EquivalencePolicy::close(1e-4, f64::NAN).is_err());
        assert!(EquivalencePolicy::close(0.0, 0.0).is_ok());
    }

    #[test]
    fn structural_mismatches_fail_regardless_of_policy() {
        let loose = PolicySet::uniform(EquivalencePolicy::close(1e9, 1e9).expect("loose"));
        let arity = compare_outputs(&[tensor(&[1.0])], &[], &loose).expect_err("arity");
        assert!(matches!(arity, CaseFailure::StructuralMismatch { .. }));

        let shape = compare_outputs(&[tensor(&[1.0])], &[tensor(&[1.0, 2.0])], &loose)
            .expect_err("shape");
        assert!(matches!(shape, CaseFailure::StructuralMismatch { ref reason } if reason.contains("shape")));

        let narrow = DenseTensor::new(vec![1], DType::F32, vec![1.0]).expect("f32");
        let dtype = compare_outputs(&[tensor(&[1.0])], &[narrow], &loose).expect_err("dtype");
        assert!(matches!(dtype, CaseFailure::StructuralMismatch { ref reason } if reason.contains("dtype")));
    }

    #[test]
    fn checks_report_mismatch_statistics() {
        let checks = compare_outputs(
            &[tensor(&[1.0, 2.0, 3.0]), tensor(&[0.5])],
            &[tensor(&[1.0, 2.5, 3.5]), tensor(&[0.5])],
            &PolicySet::exact().with_override(1, EquivalencePolicy::default_close()),
        )
        .expect("same structure");
        assert!(!checks[0].passed);
        assert_eq!(checks[0].mismatch_count, 2);
        assert_eq!(checks[0].first_mismatch, Some(1));
        assert!((checks[0].max_abs_diff - 0.5).abs() < f64::EPSILON);
        assert!(checks[1].passed);
        assert_eq!(checks[1].policy, EquivalencePolicy::default_close());
        assert_eq!(checks[1].reference_digest, checks[1].candidate_digest);
    }

    proptest! {
        #[test]
        fn prop_widening_tolerance_never_turns_pass_into_fail(
            reference in -100.0f64..100.0,
            delta in -1.0f64..1.0,
            atol in 0.0f64..0.5,
            rtol in 0.0f64..0.5,
            widen in 0.0f64..1.0,
        ) {
            let candidate = reference + delta;
            let narrow = EquivalencePolicy::close(atol, rtol).expect("narrow");
            let wide = EquivalencePolicy::close(atol + widen, rtol + widen).expect("wide");
            if narrow.admits(reference, candidate) {
                prop_assert!(wide.admits(reference, candidate));
            }
        }

        #[test]
        fn prop_exact_implies_close(value in proptest::num::f64::NORMAL) {
            prop_assert!(EquivalencePolicy::Exact.admits(value, value));
            prop_assert!(EquivalencePolicy::default_close().admits(value, value));
        }
    }
}
