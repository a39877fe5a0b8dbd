use std::fmt;
use std::sync::Arc;

use serde::{ser::SerializeStruct, Deserialize, Serialize};

use crate::graph::quant::{QuantBounds, QuantizationDetails};

/// Enumerates scalar element types the compiler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    F16,
    Bf16,
    F32,
}

impl DType {
    /// Returns `true` when the dtype is any signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::Si8 | DType::Ui8 | DType::Si16 | DType::Ui16 | DType::Si32
        )
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(self, DType::Si8 | DType::Si16 | DType::Si32)
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(self, DType::Ui8 | DType::Ui16)
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32)
    }

    pub fn bitwidth(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si8 | DType::Ui8 => 8,
            DType::Si16 | DType::Ui16 | DType::F16 | DType::Bf16 => 16,
            DType::Si32 | DType::F32 => 32,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::Ui16 | DType::F16 | DType::Bf16 => 2,
            DType::Si32 | DType::F32 => 4,
        }
    }

    /// Representable range when the dtype stores discretized values.
    pub fn integer_range(self) -> Option<(i64, i64)> {
        match self {
            DType::Si8 => Some((i8::MIN as i64, i8::MAX as i64)),
            DType::Ui8 => Some((0, u8::MAX as i64)),
            DType::Si16 => Some((i16::MIN as i64, i16::MAX as i64)),
            DType::Ui16 => Some((0, u16::MAX as i64)),
            DType::Si32 => Some((i32::MIN as i64, i32::MAX as i64)),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::I1 => "i1",
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si16 => "si16",
            DType::Ui16 => "ui16",
            DType::Si32 => "si32",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// Names a symbolic dynamic dimension (e.g. `?B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dimension {
    pub fn from_usize(value: usize) -> Self {
        Self::Static(value)
    }

    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(*value),
            Dimension::Dynamic(_) => None,
        }
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Convenience constructor for fully static shapes.
    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<&Dimension> {
        self.dims.get(axis)
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }

    /// Reorders dimensions by the given permutation.
    pub fn permute(&self, perm: &[usize]) -> Option<Shape> {
        if perm.len() != self.dims.len() {
            return None;
        }
        let mut dims = Vec::with_capacity(perm.len());
        for &axis in perm {
            dims.push(self.dims.get(axis)?.clone());
        }
        Some(Shape { dims })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str("x")?;
            }
            match dim {
                Dimension::Static(value) => write!(f, "{value}")?,
                Dimension::Dynamic(symbol) => write!(f, "?{}", symbol.as_str())?,
            }
        }
        Ok(())
    }
}

/// Ordered symbolic axis labels, e.g. `NCHW` or `NHWC`.
///
/// A layout names what each shape axis means; conversions between layouts are
/// expressed as permutations computed from the labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout(String);

impl Layout {
    pub fn new(labels: impl Into<String>) -> Self {
        Self(labels.into())
    }

    pub fn nchw() -> Self {
        Self::new("NCHW")
    }

    pub fn nhwc() -> Self {
        Self::new("NHWC")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.chars().count()
    }

    /// Index of the axis labelled `label`, if present.
    pub fn index_of(&self, label: char) -> Option<usize> {
        self.0.chars().position(|c| c == label)
    }

    pub fn channel_index(&self) -> Option<usize> {
        self.index_of('C')
    }

    /// Height/width axis indices, when the layout is spatial.
    pub fn spatial_indices(&self) -> Option<(usize, usize)> {
        Some((self.index_of('H')?, self.index_of('W')?))
    }

    /// Permutation mapping axes of `self` onto axes of `target`:
    /// `perm[i]` is the source axis feeding target axis `i`.
    ///
    /// Returns `None` when the two layouts are not label permutations of one
    /// another (including duplicate labels).
    pub fn permutation_to(&self, target: &Layout) -> Option<Vec<usize>> {
        if self.rank() != target.rank() {
            return None;
        }
        let source: Vec<char> = self.0.chars().collect();
        let mut perm = Vec::with_capacity(source.len());
        let mut used = vec![false; source.len()];
        for label in target.0.chars() {
            let axis = source
                .iter()
                .enumerate()
                .position(|(idx, c)| *c == label && !used[idx])?;
            used[axis] = true;
            perm.push(axis);
        }
        Some(perm)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tensor metadata coupling dtype, shape, and layout.
///
/// Descriptors are immutable once attached to a produced value; rewrites
/// construct new descriptors rather than editing in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
    pub layout: Layout,
}

impl TensorDesc {
    pub fn new(dtype: DType, shape: Shape, layout: Layout) -> Self {
        Self {
            dtype,
            shape,
            layout,
        }
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            shape: self.shape.clone(),
            layout: self.layout.clone(),
        }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Static extent of the channel axis, when known.
    pub fn channel_count(&self) -> Option<usize> {
        let axis = self.layout.channel_index()?;
        self.shape.dim(axis)?.as_static()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{}, {}, {}>", self.dtype, self.shape, self.layout)
    }
}

/// Dense literal tensor payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLiteral {
    pub desc: TensorDesc,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(desc: TensorDesc, bytes: Arc<[u8]>) -> Self {
        Self { desc, bytes }
    }

    /// Builds an f32 literal from host values.
    pub fn from_f32s(shape: Shape, layout: Layout, values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            desc: TensorDesc::new(DType::F32, shape, layout),
            bytes: Arc::<[u8]>::from(bytes),
        }
    }

    /// Decodes the payload as f32 values when the dtype permits.
    pub fn as_f32s(&self) -> Option<Vec<f32>> {
        if self.desc.dtype != DType::F32 || self.bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }

    /// Single scalar value, for literals with one element.
    pub fn scalar_f32(&self) -> Option<f32> {
        let values = self.as_f32s()?;
        if values.len() == 1 {
            Some(values[0])
        } else {
            None
        }
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("desc", &self.desc)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            desc: TensorDesc,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            desc: helper.desc,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Attribute payload for `convert` (element type conversion).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// Attribute payload for layout conversion; the permutation is recorded at
/// insertion time so lowering does not re-derive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConvertSpec {
    pub perm: Vec<usize>,
    pub target: Layout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResizeAlgorithm {
    Nearest,
    Linear,
    Cubic,
}

impl fmt::Display for ResizeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResizeAlgorithm::Nearest => "nearest",
            ResizeAlgorithm::Linear => "linear",
            ResizeAlgorithm::Cubic => "cubic",
        };
        f.write_str(name)
    }
}

/// Attribute payload for spatial `resize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSpec {
    pub algorithm: ResizeAlgorithm,
    pub sizes: (usize, usize),
}

/// Attribute payload for per-channel mean/scale normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeSpec {
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
}

/// Attribute payload for `convolution`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionSpec {
    pub strides: Vec<usize>,
    pub pads_begin: Vec<usize>,
    pub pads_end: Vec<usize>,
    pub dilations: Vec<usize>,
    pub groups: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingKind {
    Max,
    Avg,
}

/// Attribute payload for `pooling`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingSpec {
    pub kind: PoolingKind,
    pub window: Vec<usize>,
    pub strides: Vec<usize>,
    pub pads_begin: Vec<usize>,
    pub pads_end: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EltwiseOp {
    Add,
    Sub,
    Mul,
    Maximum,
}

/// Attribute payload for elementwise binary arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EltwiseSpec {
    pub op: EltwiseOp,
}

/// Attribute payload for `concat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Attribute payload for `reshape`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Shape,
}

/// Attribute payload for `softmax`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftmaxSpec {
    pub axis: usize,
}

/// Attribute payload for `quantize`: clamp into `[low, high]` and discretize
/// onto the storage range of `dtype` with `levels` representable steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizeSpec {
    pub dtype: DType,
    pub levels: u32,
    pub low: QuantBounds,
    pub high: QuantBounds,
}

/// Declarative form of graph operations.
///
/// The set is deliberately non-exhaustive; the lowering registry is the open
/// extension point for new kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Parameter,
    Result,
    Constant(TensorLiteral),
    Convert(CastSpec),
    ConvertLayout(LayoutConvertSpec),
    Resize(ResizeSpec),
    Normalize(NormalizeSpec),
    Convolution(ConvolutionSpec),
    Pooling(PoolingSpec),
    Eltwise(EltwiseSpec),
    Concat(ConcatSpec),
    Relu,
    Reshape(ReshapeSpec),
    Softmax(SoftmaxSpec),
    FakeQuantize(QuantizationDetails),
    Quantize(QuantizeSpec),
}

impl Operation {
    /// Stable kind name used by capability tables and the lowering registry.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::Parameter => "parameter",
            Operation::Result => "result",
            Operation::Constant(_) => "constant",
            Operation::Convert(_) => "convert",
            Operation::ConvertLayout(_) => "convert_layout",
            Operation::Resize(_) => "resize",
            Operation::Normalize(_) => "normalize",
            Operation::Convolution(_) => "convolution",
            Operation::Pooling(_) => "pooling",
            Operation::Eltwise(_) => "eltwise",
            Operation::Concat(_) => "concat",
            Operation::Relu => "relu",
            Operation::Reshape(_) => "reshape",
            Operation::Softmax(_) => "softmax",
            Operation::FakeQuantize(_) => "fake_quantize",
            Operation::Quantize(_) => "quantize",
        }
    }
}
