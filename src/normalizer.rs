//! Observation normalizers.
//!
//! A [`Normalizer`] is attached to an environment with
//! [`with_normalizer`](crate::env::with_normalizer). It is initialised once with the environment
//! description, then transforms every observation returned by `step` and `reset`.

use anyhow::{bail, ensure, Context};
use ndarray::{ArrayD, Axis, IxDyn, Zip};

use crate::api::EnvDescription;
use crate::space::BoxTensors;

/// Transforms raw observations before they are handed to the caller.
pub trait Normalizer: Send + Sync {
    /// Called once, when the normalizer is attached to an environment.
    fn init(&mut self, env: &EnvDescription) -> anyhow::Result<()>;

    fn norm(&self, observation: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>>;
}

fn observation_bounds(env: &EnvDescription) -> anyhow::Result<BoxTensors> {
    env.observation_space
        .as_box()
        .with_context(|| format!("observation space of {} is not a box space", env.id))?
        .to_tensors()
}

fn check_shape(observation: &ArrayD<f32>, bounds: &ArrayD<f32>) -> anyhow::Result<()> {
    ensure!(
        observation.shape() == bounds.shape(),
        "observation of shape {:?} does not match space shape {:?}",
        observation.shape(),
        bounds.shape()
    );
    Ok(())
}

/// Rescales every value into `[0, 1]` using the bounds of the observation box space.
///
/// Dimensions with equal bounds map to 0. Unbounded dimensions (infinite or overflowing range)
/// are passed through unchanged.
#[derive(Debug, Clone, Default)]
pub struct MinMaxNormalizer {
    bounds: Option<BoxTensors>,
}

impl MinMaxNormalizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Normalizer for MinMaxNormalizer {
    fn init(&mut self, env: &EnvDescription) -> anyhow::Result<()> {
        self.bounds = Some(observation_bounds(env)?);
        Ok(())
    }

    fn norm(&self, mut observation: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let bounds = self.bounds.as_ref().context("normalizer was not initialised")?;
        check_shape(&observation, &bounds.low)?;
        Zip::from(&mut observation)
            .and(&bounds.low)
            .and(&bounds.high)
            .for_each(|x, &low, &high| {
                let range = high - low;
                if range == 0.0 {
                    *x = 0.0;
                } else if range.is_finite() {
                    *x = (*x - low) / range;
                }
            });
        Ok(observation)
    }
}

/// Inserts a unit axis at `axis`, e.g. to turn one observation into a batch of one.
#[derive(Debug, Clone, Copy)]
pub struct ExpandDimsNormalizer {
    axis: usize,
}

impl ExpandDimsNormalizer {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }
}

impl Normalizer for ExpandDimsNormalizer {
    fn init(&mut self, _env: &EnvDescription) -> anyhow::Result<()> {
        Ok(())
    }

    fn norm(&self, observation: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        if self.axis > observation.ndim() {
            bail!(
                "cannot insert axis {} in an observation of {} dimension(s)",
                self.axis,
                observation.ndim()
            );
        }
        Ok(observation.insert_axis(Axis(self.axis)))
    }
}

/// Reshapes observations. The element count must not change.
#[derive(Debug, Clone)]
pub struct ReshapeNormalizer {
    shape: Vec<usize>,
}

impl ReshapeNormalizer {
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape }
    }
}

impl Normalizer for ReshapeNormalizer {
    fn init(&mut self, _env: &EnvDescription) -> anyhow::Result<()> {
        Ok(())
    }

    fn norm(&self, observation: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let from = observation.shape().to_vec();
        observation
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(IxDyn(&self.shape))
            .with_context(|| format!("cannot reshape {from:?} into {:?}", self.shape))
    }
}

/// Discretizes every value into one of `intervals` equal-width bins between the bounds.
///
/// Values outside the bounds land in the first or last bin. Bounds come from the observation box
/// space unless given with [`EqWidthBinNormalizer::with_bounds`]; they must be finite.
#[derive(Debug, Clone)]
pub struct EqWidthBinNormalizer {
    intervals: usize,
    bounds: Option<(ArrayD<f32>, ArrayD<f32>)>,
}

impl EqWidthBinNormalizer {
    pub fn new(intervals: usize) -> Self {
        Self {
            intervals,
            bounds: None,
        }
    }

    pub fn with_bounds(mut self, low: ArrayD<f32>, high: ArrayD<f32>) -> Self {
        self.bounds = Some((low, high));
        self
    }
}

impl Normalizer for EqWidthBinNormalizer {
    fn init(&mut self, env: &EnvDescription) -> anyhow::Result<()> {
        ensure!(self.intervals > 0, "at least one interval is required");
        if self.bounds.is_none() {
            let bounds = observation_bounds(env)?;
            self.bounds = Some((bounds.low, bounds.high));
        }
        let (low, high) = self.bounds.as_ref().context("no bounds")?;
        ensure!(
            low.shape() == high.shape(),
            "low and high bounds have different shapes"
        );
        ensure!(
            low.iter().chain(high.iter()).all(|v| v.is_finite()),
            "equal width bins need finite bounds"
        );
        Ok(())
    }

    fn norm(&self, mut observation: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let (low, high) = self.bounds.as_ref().context("normalizer was not initialised")?;
        check_shape(&observation, low)?;
        check_shape(&observation, high)?;
        let last = (self.intervals - 1) as f32;
        let intervals = self.intervals as f32;
        Zip::from(&mut observation)
            .and(low)
            .and(high)
            .for_each(|x, &low, &high| {
                let width = (high - low) / intervals;
                *x = if width > 0.0 {
                    ((*x - low) / width).floor().clamp(0.0, last)
                } else {
                    0.0
                };
            });
        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{BoxSpace, DiscreteSpace, Space};
    use ndarray::arr1;

    fn env(high: Vec<f32>, low: Vec<f32>) -> EnvDescription {
        let shape = vec![high.len() as i32];
        EnvDescription {
            id: "env-1".to_string(),
            model_name: "Test-v0".to_string(),
            action_space: Space::Discrete(DiscreteSpace { n: 2 }),
            observation_space: Space::Box(BoxSpace { high, low, shape }),
        }
    }

    #[test]
    fn min_max_rescales_bounded_dimensions() {
        let mut norm = MinMaxNormalizer::new();
        norm.init(&env(vec![10.0, 1.0, f32::MAX], vec![0.0, 1.0, f32::MIN]))
            .unwrap();
        let out = norm.norm(arr1(&[5.0, 1.0, 42.0]).into_dyn()).unwrap();
        assert_eq!(out, arr1(&[0.5, 0.0, 42.0]).into_dyn());
    }

    #[test]
    fn min_max_requires_box_space() {
        let mut description = env(vec![1.0], vec![0.0]);
        description.observation_space = Space::Discrete(DiscreteSpace { n: 4 });
        assert!(MinMaxNormalizer::new().init(&description).is_err());
    }

    #[test]
    fn min_max_rejects_shape_mismatch() {
        let mut norm = MinMaxNormalizer::new();
        norm.init(&env(vec![1.0, 1.0], vec![0.0, 0.0])).unwrap();
        assert!(norm.norm(arr1(&[0.5]).into_dyn()).is_err());
    }

    #[test]
    fn expand_dims_adds_batch_axis() {
        let norm = ExpandDimsNormalizer::new(0);
        let out = norm.norm(arr1(&[1.0, 2.0, 3.0]).into_dyn()).unwrap();
        assert_eq!(out.shape(), &[1, 3]);
        assert!(ExpandDimsNormalizer::new(3)
            .norm(arr1(&[1.0]).into_dyn())
            .is_err());
    }

    #[test]
    fn reshape_keeps_element_count() {
        let norm = ReshapeNormalizer::new(vec![2, 2]);
        let out = norm.norm(arr1(&[1.0, 2.0, 3.0, 4.0]).into_dyn()).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert!(ReshapeNormalizer::new(vec![3])
            .norm(arr1(&[1.0, 2.0]).into_dyn())
            .is_err());
    }

    #[test]
    fn equal_width_bins() {
        let mut norm = EqWidthBinNormalizer::new(4);
        norm.init(&env(vec![8.0, 8.0, 8.0], vec![0.0, 0.0, 0.0]))
            .unwrap();
        let out = norm.norm(arr1(&[1.0, 5.0, 100.0]).into_dyn()).unwrap();
        assert_eq!(out, arr1(&[0.0, 2.0, 3.0]).into_dyn());
    }

    #[test]
    fn equal_width_bins_need_finite_bounds() {
        let mut norm = EqWidthBinNormalizer::new(4);
        assert!(norm.init(&env(vec![f32::INFINITY], vec![0.0])).is_err());
    }
}
