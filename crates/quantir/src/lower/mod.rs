//! Primitive lowering: maps each logical operation node onto backend
//! execution primitives and wires them into an executable dependency graph.

mod builder;
mod capability;
mod registry;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CompileError, CompileResult};

pub use builder::build_program;
pub use capability::{CommutePredicate, DeviceCapabilities};
pub use registry::{LoweringCtx, LoweringFn, LoweringRegistry};

/// Identifier of a primitive within a program; dependencies reference these
/// by name, never by ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimitiveId(pub String);

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend parameter bag entry. Attributes are limited to simple primitives
/// and arrays so they stay easy to serialize, hash, and validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
}

impl AttrValue {
    pub fn from_usizes(values: &[usize]) -> Self {
        AttrValue::I64Array(values.iter().map(|v| *v as i64).collect())
    }

    pub fn from_f32s(values: &[f32]) -> Self {
        AttrValue::F64Array(values.iter().map(|v| *v as f64).collect())
    }
}

/// The lowered, backend-facing counterpart of a graph node: a kind, the ids
/// of the primitives it depends on, and a parameter bag derived from the
/// originating node's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    pub id: PrimitiveId,
    pub kind: String,
    pub inputs: Vec<PrimitiveId>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Primitive {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, inputs: Vec<PrimitiveId>) -> Self {
        Self {
            id: PrimitiveId(id.into()),
            kind: kind.into(),
            inputs,
            attrs: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// Complete executable program: ordered primitives plus the mapping from each
/// graph Result (by name, in declaration order) to the primitive producing it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrimitiveProgram {
    pub primitives: Vec<Primitive>,
    pub outputs: Vec<(String, PrimitiveId)>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum ProgramIoError {
    #[error(transparent)]
    Serialization(#[from] ProgramSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl PrimitiveProgram {
    /// Checks that the program is a well-formed dependency DAG: unique ids,
    /// and every dependency emitted before its consumer.
    pub fn validate_topology(&self) -> CompileResult<()> {
        let mut emitted: HashSet<&PrimitiveId> = HashSet::with_capacity(self.primitives.len());
        for primitive in &self.primitives {
            for (idx, input) in primitive.inputs.iter().enumerate() {
                if !emitted.contains(input) {
                    return Err(CompileError::UnresolvedDependency {
                        node: primitive.id.0.clone(),
                        input: idx,
                    });
                }
            }
            if !emitted.insert(&primitive.id) {
                return Err(CompileError::invalid_graph(
                    &primitive.id.0,
                    "duplicate primitive id",
                ));
            }
        }
        for (name, id) in &self.outputs {
            if !emitted.contains(id) {
                return Err(CompileError::invalid_graph(
                    name,
                    format!("output maps to unknown primitive '{id}'"),
                ));
            }
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        serde_json::from_str(src).map_err(ProgramSerdeError::from)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ProgramSerdeError> {
        bincode::serialize(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ProgramSerdeError> {
        bincode::deserialize(bytes).map_err(ProgramSerdeError::from)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ProgramIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ProgramIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ProgramIoError> {
        let contents = fs::read_to_string(path).map_err(ProgramIoError::from)?;
        Self::from_json_str(&contents).map_err(ProgramIoError::from)
    }
}

impl fmt::Display for PrimitiveProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {{")?;
        for primitive in &self.primitives {
            write!(f, "  {} = {}(", primitive.id, primitive.kind)?;
            for (idx, input) in primitive.inputs.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{input}")?;
            }
            writeln!(f, ")")?;
        }
        for (name, id) in &self.outputs {
            writeln!(f, "  output {name} <- {id}")?;
        }
        writeln!(f, "}}")
    }
}
