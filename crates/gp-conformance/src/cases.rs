//! Built-in conformance cases.

use gp_core::{DType, DenseTensor, InputSpec};
use gp_graph::{GraphDef, GraphError, GraphSession, PARTIAL_ADAPTIVE_POOL_MIN_VERSION, ValueId};

use crate::{Backend, EquivalencePolicy, ExportPath, GraphCase, PolicySet};

/// Three constant pads applied in sequence.
struct ConstantPad3dChain;

impl GraphDef for ConstantPad3dChain {
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError> {
        let x = session.constant_pad(inputs[0], &[(2, 2), (2, 2), (2, 2)], 0.3)?;
        let x = session.constant_pad(x, &[(1, 2), (3, 4), (5, 6)], 0.0)?;
        let x = session.constant_pad(x, &[(1, 0), (2, 0), (0, 3)], 1.1)?;
        Ok(vec![x])
    }
}

struct AminTriple;

impl GraphDef for AminTriple {
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError> {
        let x = session.amin(inputs[0], &[0], false)?;
        let y = session.amin(inputs[1], &[1, 2], false)?;
        let z = session.amin(inputs[2], &[0, 3], true)?;
        Ok(vec![x, y, z])
    }
}

/// Two PReLU layers shared across four inputs of increasing rank.
struct PreluStack {
    channel_slopes: DenseTensor,
    shared_slope: DenseTensor,
}

impl PreluStack {
    fn new() -> Self {
        Self {
            channel_slopes: DenseTensor::full(vec![12], DType::F32, 0.25),
            shared_slope: DenseTensor::full(vec![1], DType::F32, 0.12),
        }
    }
}

impl GraphDef for PreluStack {
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let scaled = session.mul_scalar(*input, 2.0)?;
            let centered = session.add_scalar(scaled, -1.0)?;
            let slopes = session.parameter("prelu_0.weight", &self.channel_slopes)?;
            let x = session.prelu(centered, slopes)?;
            let slope = session.parameter("prelu_1.weight", &self.shared_slope)?;
            outputs.push(session.prelu(x, slope)?);
        }
        Ok(outputs)
    }

    fn parameters(&self) -> Vec<(String, DenseTensor)> {
        vec![
            ("prelu_0.weight".to_string(), self.channel_slopes.clone()),
            ("prelu_1.weight".to_string(), self.shared_slope.clone()),
        ]
    }
}

/// Cumulative product over every axis of every input.
struct CumprodAxes;

impl GraphDef for CumprodAxes {
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError> {
        let mut outputs = Vec::new();
        for input in inputs {
            let rank = session.shape(*input)?.len();
            for dim in 0..rank {
                outputs.push(session.cumprod(*input, dim)?);
            }
        }
        Ok(outputs)
    }
}

/// Partial output sizes need format version 11; older versions get the
/// first two outputs only.
struct AdaptivePoolGated;

impl GraphDef for AdaptivePoolGated {
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError> {
        let x = inputs[0];
        let out0 = session.adaptive_avg_pool2d(x, [Some(4), Some(16)])?;
        let out1 = session.adaptive_avg_pool2d(x, [Some(1), Some(1)])?;
        if !session
            .capabilities()
            .at_least(PARTIAL_ADAPTIVE_POOL_MIN_VERSION)
        {
            return Ok(vec![out0, out1]);
        }
        let out2 = session.adaptive_avg_pool2d(x, [None, Some(8)])?;
        let out3 = session.adaptive_avg_pool2d(x, [Some(3), None])?;
        Ok(vec![out0, out1, out2, out3])
    }
}

/// Branches on the input mean, so only a trace can capture it.
struct MeanGatedBranch;

impl GraphDef for MeanGatedBranch {
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError> {
        let x = inputs[0];
        let y = if session.mean(x)? > 0.5 {
            session.mul_scalar(x, 2.0)?
        } else {
            session.add_scalar(x, 1.0)?
        };
        Ok(vec![y])
    }
}

/// Dropout followed by scaling; identity dropout in eval mode.
struct DropoutAffine;

impl GraphDef for DropoutAffine {
    fn forward(
        &self,
        session: &mut GraphSession,
        inputs: &[ValueId],
    ) -> Result<Vec<ValueId>, GraphError> {
        let x = session.dropout(inputs[0], 0.5)?;
        let x = session.mul_scalar(x, 3.0)?;
        Ok(vec![x])
    }
}

/// Every built-in case in registry order.
#[must_use]
pub fn builtin_cases() -> Vec<GraphCase> {
    let close = PolicySet::uniform(EquivalencePolicy::default_close());
    vec![
        GraphCase::new(
            "nn_ConstantPad3d",
            Box::new(ConstantPad3dChain),
            vec![InputSpec::uniform01(vec![1, 12, 13, 13, 13])],
            ExportPath::Trace,
            Backend::Ncnn,
            close.clone(),
        ),
        GraphCase::new(
            "torch_amin",
            Box::new(AminTriple),
            vec![
                InputSpec::uniform01(vec![3, 16]),
                InputSpec::uniform01(vec![5, 9, 11]),
                InputSpec::uniform01(vec![8, 5, 9, 10]),
            ],
            ExportPath::Trace,
            Backend::Ncnn,
            PolicySet::exact(),
        ),
        GraphCase::new(
            "nn_PReLU",
            Box::new(PreluStack::new()),
            vec![
                InputSpec::uniform01(vec![1, 12]),
                InputSpec::uniform01(vec![1, 12, 64]),
                InputSpec::uniform01(vec![1, 12, 24, 64]),
                InputSpec::uniform01(vec![1, 12, 24, 32, 64]),
            ],
            ExportPath::Declarative,
            Backend::Pnnx,
            PolicySet::exact(),
        ),
        GraphCase::new(
            "torch_cumprod",
            Box::new(CumprodAxes),
            vec![
                InputSpec::uniform01(vec![2, 3, 16]),
                InputSpec::uniform01(vec![5, 9]),
                InputSpec::uniform01(vec![14]),
            ],
            ExportPath::Trace,
            Backend::Pnnx,
            PolicySet::exact(),
        ),
        GraphCase::new(
            "F_adaptive_avg_pool2d",
            Box::new(AdaptivePoolGated),
            vec![InputSpec::uniform01(vec![1, 12, 24, 64])],
            ExportPath::Declarative,
            Backend::Pnnx,
            close,
        ),
        GraphCase::new(
            "mean_gated_branch",
            Box::new(MeanGatedBranch),
            vec![InputSpec::uniform01(vec![4, 8])],
            ExportPath::Trace,
            Backend::Pnnx,
            PolicySet::exact(),
        ),
        GraphCase::new(
            "nn_Dropout_eval",
            Box::new(DropoutAffine),
            vec![InputSpec::uniform01(vec![2, 6, 5])],
            ExportPath::Declarative,
            Backend::Ncnn,
            PolicySet::exact(),
        ),
    ]
}

#[must_use]
pub fn case_names() -> Vec<String> {
    builtin_cases().into_iter().map(|case| case.name).collect()
}

/// Looks a case up by display name or canonical stem.
pub fn case_by_name(name: &str) -> Result<GraphCase, String> {
    let wanted = crate::canonical_case_name(name);
    builtin_cases()
        .into_iter()
        .find(|case| case.name == name || case.stem() == wanted)
        .ok_or_else(|| {
            format!(
                "unknown case '{name}' (known: {})",
                case_names().join(", ")
            )
        })
}
