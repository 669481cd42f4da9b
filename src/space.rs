//! Action and observation spaces declared by the server, and their shapes.

use std::collections::BTreeMap;

use anyhow::Context;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::api::dims;
use crate::error::{Error, Result};

/// A space as declared on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Space {
    Box(BoxSpace),
    Discrete(DiscreteSpace),
    MultiDiscrete(MultiDiscreteSpace),
    Struct(StructSpace),
    /// Any variant this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Continuous space bounded element-wise by `low` and `high`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxSpace {
    pub high: Vec<f32>,
    pub low: Vec<f32>,
    pub shape: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteSpace {
    pub n: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiDiscreteSpace {
    pub discrete_spaces: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructSpace {
    pub spaces: BTreeMap<String, Space>,
}

/// Bounds of a box space as tensors of the declared shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxTensors {
    pub high: ArrayD<f32>,
    pub low: ArrayD<f32>,
    pub shape: Vec<usize>,
}

impl BoxSpace {
    pub fn to_tensors(&self) -> anyhow::Result<BoxTensors> {
        let shape = dims(&self.shape)?;
        let high = ArrayD::from_shape_vec(IxDyn(&shape), self.high.clone())
            .with_context(|| format!("high bound does not fit shape {shape:?}"))?;
        let low = ArrayD::from_shape_vec(IxDyn(&shape), self.low.clone())
            .with_context(|| format!("low bound does not fit shape {shape:?}"))?;
        Ok(BoxTensors { high, low, shape })
    }
}

impl Space {
    /// Shape of one element of the space.
    ///
    /// A discrete space is a single value, so its shape is `[1]`; a multi-discrete space holds
    /// one value per sub-space.
    pub fn shape(&self) -> Result<Vec<usize>> {
        let shape = match self {
            Space::Box(b) => box_shape(b)?,
            Space::Discrete(_) => vec![1],
            Space::MultiDiscrete(m) => vec![m.discrete_spaces.len()],
            Space::Struct(_) => return Err(unsupported("struct space")),
            Space::Unknown => return Err(unsupported("unknown space type")),
        };
        non_empty(shape, self)
    }

    /// Shape of a tensor holding one potential per possible value.
    ///
    /// Unlike [`Space::shape`], a discrete space is sized by its cardinality and a multi-discrete
    /// space by the cardinality of each sub-space.
    pub fn potentials_shape(&self) -> Result<Vec<usize>> {
        let shape = match self {
            Space::Box(b) => box_shape(b)?,
            Space::Discrete(d) => vec![cardinality(d.n)?],
            Space::MultiDiscrete(m) => m
                .discrete_spaces
                .iter()
                .map(|&n| cardinality(n))
                .collect::<Result<_>>()?,
            Space::Struct(_) => return Err(unsupported("struct space")),
            Space::Unknown => return Err(unsupported("unknown space type")),
        };
        non_empty(shape, self)
    }

    pub fn as_box(&self) -> Option<&BoxSpace> {
        match self {
            Space::Box(b) => Some(b),
            _ => None,
        }
    }
}

/// Shape of the given space. See [`Space::shape`].
pub fn space_shape(space: &Space) -> Result<Vec<usize>> {
    space.shape()
}

/// Potentials shape of the given space. See [`Space::potentials_shape`].
pub fn potentials_shape(space: &Space) -> Result<Vec<usize>> {
    space.potentials_shape()
}

fn box_shape(b: &BoxSpace) -> Result<Vec<usize>> {
    dims(&b.shape).map_err(|e| unsupported(&format!("{e:#}")))
}

fn cardinality(n: i32) -> Result<usize> {
    usize::try_from(n).map_err(|_| unsupported(&format!("negative cardinality {n}")))
}

fn non_empty(shape: Vec<usize>, space: &Space) -> Result<Vec<usize>> {
    if shape.is_empty() {
        return Err(unsupported(&format!("space had no shape: {space:?}")));
    }
    Ok(shape)
}

fn unsupported(reason: &str) -> Error {
    Error::UnsupportedSpace(reason.to_string())
}
