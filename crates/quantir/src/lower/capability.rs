use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::graph::quant::{Dequantization, Granularity};
use crate::graph::spec::{DType, Operation, PoolingKind};

/// Decides whether a dequantization descriptor may legally commute through an
/// operation of the associated kind. Receives the descriptors carried by the
/// operation's data inputs, in input order.
pub type CommutePredicate = fn(op: &Operation, descriptors: &[Dequantization], tolerance: f32) -> bool;

/// Capability table for one execution target: which operation kinds and
/// element types it can lower, and which operations are transparent to
/// dequantization descriptors.
///
/// Capabilities are plain values passed into the compiler entry point, so
/// concurrent compilations with different capability sets never interfere.
#[derive(Clone, Default)]
pub struct DeviceCapabilities {
    supported_ops: BTreeSet<String>,
    supported_dtypes: HashSet<DType>,
    commute: BTreeMap<String, CommutePredicate>,
}

impl DeviceCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability set covering every built-in operation kind and dtype, with
    /// the stock commutation rules.
    pub fn with_default_ops() -> Self {
        let mut caps = Self::new();
        for kind in [
            "parameter",
            "result",
            "constant",
            "convert",
            "convert_layout",
            "resize",
            "normalize",
            "convolution",
            "pooling",
            "eltwise",
            "concat",
            "relu",
            "reshape",
            "softmax",
            "fake_quantize",
            "quantize",
        ] {
            caps.supported_ops.insert(kind.to_string());
        }
        for dtype in [
            DType::Si8,
            DType::Ui8,
            DType::Si16,
            DType::Ui16,
            DType::Si32,
            DType::F16,
            DType::Bf16,
            DType::F32,
        ] {
            caps.supported_dtypes.insert(dtype);
        }
        caps.commute.insert("convolution".into(), convolution_commutes);
        caps.commute.insert("pooling".into(), pooling_commutes);
        caps.commute.insert("relu".into(), relu_commutes);
        caps.commute.insert("concat".into(), concat_commutes);
        caps
    }

    pub fn allow_op(mut self, kind: impl Into<String>) -> Self {
        self.supported_ops.insert(kind.into());
        self
    }

    pub fn deny_op(mut self, kind: &str) -> Self {
        self.supported_ops.remove(kind);
        self
    }

    pub fn allow_dtype(mut self, dtype: DType) -> Self {
        self.supported_dtypes.insert(dtype);
        self
    }

    pub fn deny_dtype(mut self, dtype: DType) -> Self {
        self.supported_dtypes.remove(&dtype);
        self
    }

    pub fn set_commute(mut self, kind: impl Into<String>, predicate: CommutePredicate) -> Self {
        self.commute.insert(kind.into(), predicate);
        self
    }

    pub fn clear_commute(mut self, kind: &str) -> Self {
        self.commute.remove(kind);
        self
    }

    pub fn supports_op(&self, kind: &str) -> bool {
        self.supported_ops.contains(kind)
    }

    pub fn supports_dtype(&self, dtype: DType) -> bool {
        self.supported_dtypes.contains(&dtype)
    }

    /// The commutation predicate for `kind`; absence means the kind is
    /// opaque to descriptors (the conservative default).
    pub fn commute_predicate(&self, kind: &str) -> Option<CommutePredicate> {
        self.commute.get(kind).copied()
    }
}

impl std::fmt::Debug for DeviceCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCapabilities")
            .field("supported_ops", &self.supported_ops)
            .field("supported_dtypes", &self.supported_dtypes)
            .field("commute_kinds", &self.commute.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Weights are folded against a per-tensor scale only; offsets would leak
/// into the accumulator.
fn convolution_commutes(_op: &Operation, descriptors: &[Dequantization], tolerance: f32) -> bool {
    descriptors.len() == 1
        && descriptors[0].granularity() == Granularity::PerTensor
        && descriptors[0].offsets_zero(tolerance)
}

fn pooling_commutes(op: &Operation, descriptors: &[Dequantization], _tolerance: f32) -> bool {
    let [descriptor] = descriptors else {
        return false;
    };
    match op {
        // max(a*x + b) = a*max(x) + b only when a keeps the order.
        Operation::Pooling(spec) if spec.kind == PoolingKind::Max => descriptor.scales_positive(),
        // Averaging is linear; any affine descriptor passes through.
        Operation::Pooling(_) => true,
        _ => false,
    }
}

fn relu_commutes(_op: &Operation, descriptors: &[Dequantization], tolerance: f32) -> bool {
    let [descriptor] = descriptors else {
        return false;
    };
    descriptor.scales_positive() && descriptor.offsets_zero(tolerance)
}

/// Concatenation passes a descriptor through when all inputs agree on one
/// per-tensor transform, or when every input is per-channel (the engine then
/// concatenates the channel transforms). Mixed granularity is non-fusible.
fn concat_commutes(_op: &Operation, descriptors: &[Dequantization], tolerance: f32) -> bool {
    if descriptors.is_empty() {
        return false;
    }
    let all_per_tensor = descriptors
        .iter()
        .all(|d| d.granularity() == Granularity::PerTensor);
    if all_per_tensor {
        return descriptors
            .windows(2)
            .all(|pair| pair[0].approx_eq(&pair[1], tolerance));
    }
    descriptors
        .iter()
        .all(|d| d.granularity() == Granularity::PerChannel)
}
