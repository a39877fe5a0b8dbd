//! Quantization metadata: interval descriptions attached to boundary markers
//! and the affine dequantization descriptors carried on graph edges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::spec::DType;

/// One bound value per tensor, or one per channel index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuantBounds {
    PerTensor(f32),
    PerChannel(Vec<f32>),
}

impl QuantBounds {
    pub fn is_per_channel(&self) -> bool {
        matches!(self, QuantBounds::PerChannel(_))
    }

    /// Number of channel entries, `None` for per-tensor bounds.
    pub fn channel_count(&self) -> Option<usize> {
        match self {
            QuantBounds::PerTensor(_) => None,
            QuantBounds::PerChannel(values) => Some(values.len()),
        }
    }

    /// Bound for channel `channel`, broadcasting per-tensor values.
    pub fn at(&self, channel: usize) -> f32 {
        match self {
            QuantBounds::PerTensor(value) => *value,
            QuantBounds::PerChannel(values) => values[channel % values.len()],
        }
    }

    pub fn values(&self) -> Vec<f32> {
        match self {
            QuantBounds::PerTensor(value) => vec![*value],
            QuantBounds::PerChannel(values) => values.clone(),
        }
    }

    fn componentwise_le(&self, other: &QuantBounds) -> bool {
        let count = self
            .channel_count()
            .or_else(|| other.channel_count())
            .unwrap_or(1);
        (0..count).all(|c| self.at(c) <= other.at(c))
    }
}

/// Interval description of a quantization boundary marker: clamp into the
/// input interval, discretize into `levels` steps, reconstruct onto the
/// output interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationDetails {
    pub levels: u32,
    pub input_low: QuantBounds,
    pub input_high: QuantBounds,
    pub output_low: QuantBounds,
    pub output_high: QuantBounds,
}

impl QuantizationDetails {
    /// Per-tensor interval with identical input and output bounds.
    pub fn symmetric(levels: u32, low: f32, high: f32) -> Self {
        Self {
            levels,
            input_low: QuantBounds::PerTensor(low),
            input_high: QuantBounds::PerTensor(high),
            output_low: QuantBounds::PerTensor(low),
            output_high: QuantBounds::PerTensor(high),
        }
    }

    /// Checks the interval invariants: ordered bounds, `levels >= 2`, and
    /// agreeing channel counts across per-channel bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.levels < 2 {
            return Err(format!("levels must be >= 2, got {}", self.levels));
        }
        if !self.input_low.componentwise_le(&self.input_high) {
            return Err("input_low exceeds input_high".to_string());
        }
        if !self.output_low.componentwise_le(&self.output_high) {
            return Err("output_low exceeds output_high".to_string());
        }
        let counts: Vec<usize> = [
            &self.input_low,
            &self.input_high,
            &self.output_low,
            &self.output_high,
        ]
        .iter()
        .filter_map(|b| b.channel_count())
        .collect();
        if counts.windows(2).any(|w| w[0] != w[1]) {
            return Err("per-channel bounds disagree on channel count".to_string());
        }
        Ok(())
    }

    pub fn is_per_channel(&self) -> bool {
        self.input_low.is_per_channel()
            || self.input_high.is_per_channel()
            || self.output_low.is_per_channel()
            || self.output_high.is_per_channel()
    }

    pub fn channel_count(&self) -> Option<usize> {
        self.input_low
            .channel_count()
            .or_else(|| self.input_high.channel_count())
            .or_else(|| self.output_low.channel_count())
            .or_else(|| self.output_high.channel_count())
    }

    /// Storage dtype selected from the output interval: unsigned when the
    /// interval never goes below zero, signed when it straddles zero; the
    /// level count decides 8-bit versus 16-bit storage.
    pub fn storage_dtype(&self) -> DType {
        let count = self.channel_count().unwrap_or(1);
        let unsigned = (0..count).all(|c| self.output_low.at(c) >= 0.0);
        match (unsigned, self.levels <= 256) {
            (true, true) => DType::Ui8,
            (false, true) => DType::Si8,
            (true, false) => DType::Ui16,
            (false, false) => DType::Si16,
        }
    }
}

/// Granularity of a dequantization descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    PerTensor,
    PerChannel,
}

/// Affine reconstruction `f(x) = scale * x + offset` attached to an edge,
/// mapping discretized values back to approximate real values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dequantization {
    pub scale: Vec<f32>,
    pub offset: Vec<f32>,
}

impl Dequantization {
    pub fn per_tensor(scale: f32, offset: f32) -> Self {
        Self {
            scale: vec![scale],
            offset: vec![offset],
        }
    }

    pub fn per_channel(scale: Vec<f32>, offset: Vec<f32>) -> Self {
        debug_assert_eq!(scale.len(), offset.len());
        Self { scale, offset }
    }

    pub fn granularity(&self) -> Granularity {
        if self.scale.len() > 1 || self.offset.len() > 1 {
            Granularity::PerChannel
        } else {
            Granularity::PerTensor
        }
    }

    pub fn channel_count(&self) -> usize {
        self.scale.len().max(self.offset.len())
    }

    pub fn scale_at(&self, channel: usize) -> f32 {
        self.scale[channel % self.scale.len()]
    }

    pub fn offset_at(&self, channel: usize) -> f32 {
        self.offset[channel % self.offset.len()]
    }

    /// Applies the reconstruction to one value of channel `channel`.
    pub fn apply(&self, value: f32, channel: usize) -> f32 {
        self.scale_at(channel) * value + self.offset_at(channel)
    }

    /// Composes `self` followed by `next`, yielding one descriptor whose
    /// effect equals applying `self` first and `next` second.
    pub fn then(&self, next: &Dequantization) -> Dequantization {
        let count = self.channel_count().max(next.channel_count());
        let mut scale = Vec::with_capacity(count);
        let mut offset = Vec::with_capacity(count);
        for c in 0..count {
            scale.push(next.scale_at(c) * self.scale_at(c));
            offset.push(next.scale_at(c) * self.offset_at(c) + next.offset_at(c));
        }
        Dequantization { scale, offset }
    }

    /// `true` when the descriptor is the identity within `tolerance`.
    pub fn is_identity(&self, tolerance: f32) -> bool {
        self.scale.iter().all(|s| (s - 1.0).abs() <= tolerance)
            && self.offset.iter().all(|o| o.abs() <= tolerance)
    }

    /// `true` when every channel scale is strictly positive.
    pub fn scales_positive(&self) -> bool {
        self.scale.iter().all(|s| *s > 0.0)
    }

    /// `true` when every channel offset is zero within `tolerance`.
    pub fn offsets_zero(&self, tolerance: f32) -> bool {
        self.offset.iter().all(|o| o.abs() <= tolerance)
    }

    /// Componentwise equality within `tolerance`.
    pub fn approx_eq(&self, other: &Dequantization, tolerance: f32) -> bool {
        let count = self.channel_count().max(other.channel_count());
        (0..count).all(|c| {
            (self.scale_at(c) - other.scale_at(c)).abs() <= tolerance
                && (self.offset_at(c) - other.offset_at(c)).abs() <= tolerance
        })
    }

    /// Concatenates per-channel descriptors along the channel axis.
    pub fn concat(parts: &[(&Dequantization, usize)]) -> Dequantization {
        let mut scale = Vec::new();
        let mut offset = Vec::new();
        for (part, channels) in parts {
            for c in 0..*channels {
                scale.push(part.scale_at(c));
                offset.push(part.offset_at(c));
            }
        }
        Dequantization { scale, offset }
    }

    /// Reconstruction descriptor for a boundary with the given interval,
    /// accounting for the storage range of `dtype`.
    ///
    /// Stored values occupy `0..levels-1` for unsigned storage and
    /// `-(levels/2)..levels/2 - 1` for signed storage; the offset absorbs the
    /// signed shift so identity intervals come out with offset zero.
    pub fn from_details(details: &QuantizationDetails, dtype: DType) -> Dequantization {
        let count = details.channel_count().unwrap_or(1);
        let qmin = if dtype.is_signed_integer() {
            -((details.levels / 2) as f32)
        } else {
            0.0
        };
        let steps = (details.levels - 1) as f32;
        let mut scale = Vec::with_capacity(count);
        let mut offset = Vec::with_capacity(count);
        for c in 0..count {
            let low = details.output_low.at(c);
            let high = details.output_high.at(c);
            let s = (high - low) / steps;
            scale.push(s);
            offset.push(low - s * qmin);
        }
        Dequantization { scale, offset }
    }
}

impl fmt::Display for Dequantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.granularity() {
            Granularity::PerTensor => {
                write!(f, "dq[scale={}, offset={}]", self.scale[0], self.offset[0])
            }
            Granularity::PerChannel => {
                write!(f, "dq[per-channel x{}]", self.channel_count())
            }
        }
    }
}
