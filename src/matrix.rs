use rand::Rng;
use rand::distr::Distribution;
use rand_distr::Normal;

use crate::error::{Result, SimError};

/// Largest accepted coefficient magnitude. A single source contributes at
/// most `|coefficient|` to a particle's force, so forces summed over any
/// realistic particle count stay finite.
pub const MAX_COEFFICIENT: f32 = 1.0e6;

fn check_coefficient(i: usize, j: usize, c: f32) -> Result<()> {
    if c.is_finite() && c.abs() <= MAX_COEFFICIENT {
        Ok(())
    } else {
        Err(SimError::MalformedMatrix(format!(
            "coefficient [{i}][{j}] = {c} is outside [-{MAX_COEFFICIENT}, {MAX_COEFFICIENT}]"
        )))
    }
}

/// K×K table of signed force strengths. `get(i, j)` is what class `i`
/// feels from class `j`; the table is not symmetric.
///
/// There is no mutating API, so sharing it between jobs needs no lock.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionMatrix {
    size: usize,
    coefficients: Vec<f32>,
}

impl InteractionMatrix {
    /// Draws every coefficient independently from `distribution`.
    pub fn sample<D, R>(size: usize, distribution: &D, rng: &mut R) -> Result<Self>
    where
        D: Distribution<f32>,
        R: Rng + ?Sized,
    {
        if size == 0 {
            return Err(SimError::MalformedMatrix("matrix must have at least one class".into()));
        }
        let coefficients: Vec<f32> = (0..size * size)
            .map(|_| distribution.sample(rng))
            .collect();
        for (k, &c) in coefficients.iter().enumerate() {
            check_coefficient(k / size, k % size, c)?;
        }
        Ok(Self { size, coefficients })
    }

    /// The reference distribution: normal with the given mean and deviation.
    pub fn normal<R>(size: usize, mean: f32, std_dev: f32, rng: &mut R) -> Result<Self>
    where
        R: Rng + ?Sized,
    {
        let distribution =
            Normal::new(mean, std_dev).map_err(|e| SimError::Distribution(e.to_string()))?;
        Self::sample(size, &distribution, rng)
    }

    /// Builds a matrix from explicit rows, e.g. a hand-tuned scenario.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let size = rows.len();
        if size == 0 {
            return Err(SimError::MalformedMatrix("matrix has no rows".into()));
        }
        let mut coefficients = Vec::with_capacity(size * size);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != size {
                return Err(SimError::MalformedMatrix(format!(
                    "row {i} has {} entries, expected {size}",
                    row.len()
                )));
            }
            for (j, &c) in row.iter().enumerate() {
                check_coefficient(i, j, c)?;
            }
            coefficients.extend(row);
        }
        Ok(Self { size, coefficients })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Panics if either class is out of range.
    pub fn get(&self, target: usize, source: usize) -> f32 {
        assert!(target < self.size && source < self.size, "class out of range");
        self.coefficients[target * self.size + source]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.coefficients.chunks_exact(self.size)
    }
}
