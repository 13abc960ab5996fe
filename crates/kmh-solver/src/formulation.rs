//! The binary k-medoids program.
//!
//! Variables: `y_i` (point `i` is a medoid) and `x_ij` (medoid `i` serves
//! point `j`). Constraints:
//!
//! * assignment: `Σ_i x_ij = 1` for every point `j`
//! * linking: `x_ij ≤ y_i`
//! * cardinality: `Σ_i y_i = k`
//! * self-assignment: `x_ii = y_i`
//!
//! Objective: minimise `Σ_ij D_ij x_ij`.
//!
//! The solvers never materialize the full program; they search over medoid
//! sets. [`KMedoidsModel`] maps a medoid set back onto the program so a
//! result can be checked against every constraint.

use std::fmt;

use kmh_types::{DistanceMatrix, SolverError};

/// A medoid set expressed as the program's variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Incidence {
    /// `y[i]`
    pub y: Vec<bool>,
    /// `x[i][j]`, row-major over (candidate, point).
    pub x: Vec<bool>,
    n: usize,
}

impl Incidence {
    #[inline]
    pub fn x(&self, i: usize, j: usize) -> bool {
        self.x[i * self.n + j]
    }
}

/// What is wrong with a candidate solution.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    Assignment { point: usize, served_by: usize },
    Linking { medoid: usize, point: usize },
    Cardinality { expected: usize, actual: usize },
    SelfAssignment { point: usize },
    OutOfRange { medoid: usize, n: usize },
    Duplicate { medoid: usize },
    ObjectiveMismatch { reported: f64, actual: f64 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assignment { point, served_by } => {
                write!(f, "point {} served by {} medoids", point, served_by)
            }
            Self::Linking { medoid, point } => {
                write!(f, "point {} assigned to non-medoid {}", point, medoid)
            }
            Self::Cardinality { expected, actual } => {
                write!(f, "{} medoids selected, expected {}", actual, expected)
            }
            Self::SelfAssignment { point } => write!(f, "medoid {} does not serve itself", point),
            Self::OutOfRange { medoid, n } => write!(f, "medoid {} outside [0, {})", medoid, n),
            Self::Duplicate { medoid } => write!(f, "medoid {} selected twice", medoid),
            Self::ObjectiveMismatch { reported, actual } => write!(
                f,
                "reported objective {} but the medoids cost {}",
                reported, actual
            ),
        }
    }
}

/// Relative slack allowed between a reported and a recomputed objective.
const OBJECTIVE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct KMedoidsModel<'a> {
    distances: &'a DistanceMatrix,
    k: usize,
}

impl<'a> KMedoidsModel<'a> {
    pub fn new(distances: &'a DistanceMatrix, k: usize) -> Result<Self, SolverError> {
        validate_input(distances, k)?;
        Ok(Self { distances, k })
    }

    pub fn n(&self) -> usize {
        self.distances.len()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn distances(&self) -> &'a DistanceMatrix {
        self.distances
    }

    /// `n` selection variables plus `n²` assignment variables.
    pub fn num_variables(&self) -> usize {
        let n = self.n();
        n + n * n
    }

    /// `n` assignment rows, `n²` linking rows, one cardinality row and `n`
    /// self-assignment rows.
    pub fn num_constraints(&self) -> usize {
        let n = self.n();
        n + n * n + 1 + n
    }

    /// Serving medoid of every point: the nearest medoid, and a medoid
    /// always serves itself even when another medoid is equally close.
    pub fn assign(&self, medoids: &[usize]) -> Vec<usize> {
        let n = self.n();
        let mut is_medoid = vec![false; n];
        for &m in medoids {
            is_medoid[m] = true;
        }
        (0..n)
            .map(|j| {
                if is_medoid[j] {
                    return j;
                }
                let mut best = medoids[0];
                let mut best_d = self.distances.get(best, j);
                for &m in &medoids[1..] {
                    let d = self.distances.get(m, j);
                    if d < best_d {
                        best = m;
                        best_d = d;
                    }
                }
                best
            })
            .collect()
    }

    /// Objective of the nearest-medoid assignment of `medoids`.
    pub fn evaluate(&self, medoids: &[usize]) -> f64 {
        self.objective(&self.assign(medoids))
    }

    /// `Σ_j D[assignment[j]][j]`.
    pub fn objective(&self, assignment: &[usize]) -> f64 {
        assignment
            .iter()
            .enumerate()
            .map(|(j, &i)| self.distances.get(i, j))
            .sum()
    }

    pub fn incidence(&self, medoids: &[usize], assignment: &[usize]) -> Incidence {
        let n = self.n();
        let mut y = vec![false; n];
        for &m in medoids {
            y[m] = true;
        }
        let mut x = vec![false; n * n];
        for (j, &i) in assignment.iter().enumerate() {
            x[i * n + j] = true;
        }
        Incidence { y, x, n }
    }

    /// Every violated constraint of `incidence`; empty means feasible.
    pub fn violations(&self, incidence: &Incidence) -> Vec<Violation> {
        let n = self.n();
        let mut out = Vec::new();

        for j in 0..n {
            let served_by = (0..n).filter(|&i| incidence.x(i, j)).count();
            if served_by != 1 {
                out.push(Violation::Assignment { point: j, served_by });
            }
            for i in 0..n {
                if incidence.x(i, j) && !incidence.y[i] {
                    out.push(Violation::Linking { medoid: i, point: j });
                }
            }
            if incidence.x(j, j) != incidence.y[j] {
                out.push(Violation::SelfAssignment { point: j });
            }
        }

        let actual = incidence.y.iter().filter(|&&v| v).count();
        if actual != self.k {
            out.push(Violation::Cardinality {
                expected: self.k,
                actual,
            });
        }
        out
    }

    pub fn is_feasible(&self, medoids: &[usize], assignment: &[usize]) -> bool {
        assignment.len() == self.n() && self.violations(&self.incidence(medoids, assignment)).is_empty()
    }

    /// Check an incumbent produced by any solver: `k` distinct medoids in
    /// `[0, n)` whose nearest-medoid assignment is feasible and costs
    /// `objective`.
    pub fn check_incumbent(&self, medoids: &[usize], objective: f64) -> Result<(), Violation> {
        let n = self.n();
        let mut seen = vec![false; n];
        for &medoid in medoids {
            if medoid >= n {
                return Err(Violation::OutOfRange { medoid, n });
            }
            if seen[medoid] {
                return Err(Violation::Duplicate { medoid });
            }
            seen[medoid] = true;
        }
        if medoids.len() != self.k {
            return Err(Violation::Cardinality {
                expected: self.k,
                actual: medoids.len(),
            });
        }

        let assignment = self.assign(medoids);
        if let Some(violation) = self
            .violations(&self.incidence(medoids, &assignment))
            .into_iter()
            .next()
        {
            return Err(violation);
        }

        let actual = self.objective(&assignment);
        let slack = OBJECTIVE_TOLERANCE * actual.abs().max(1.0);
        if !objective.is_finite() || (objective - actual).abs() > slack {
            return Err(Violation::ObjectiveMismatch {
                reported: objective,
                actual,
            });
        }
        Ok(())
    }

    /// Every non-medoid pays at least its nearest-neighbour distance and at
    /// most `n - k` points are non-medoids, so the sum of the `n - k`
    /// smallest nearest-neighbour distances bounds the optimum from below.
    pub fn root_lower_bound(&self) -> f64 {
        let n = self.n();
        if n <= self.k {
            return 0.0;
        }
        let mut nearest: Vec<f64> = (0..n)
            .map(|j| {
                (0..n)
                    .filter(|&i| i != j)
                    .map(|i| self.distances.get(i, j))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        nearest.sort_by(|a, b| a.total_cmp(b));
        nearest.iter().take(n - self.k).sum()
    }
}

/// Largest tolerated difference between `D[i][j]` and `D[j][i]`.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// `D` must be a non-empty distance matrix (finite, non-negative,
/// symmetric, zero diagonal) and `k` within `[1, n]`.
pub fn validate_input(distances: &DistanceMatrix, k: usize) -> Result<(), SolverError> {
    let n = distances.len();
    if n == 0 {
        return Err(SolverError::InvalidInput {
            message: "distance matrix is empty".to_string(),
        });
    }
    if k == 0 || k > n {
        return Err(SolverError::InvalidInput {
            message: format!("k={} outside [1, {}]", k, n),
        });
    }
    distances
        .validate(SYMMETRY_TOLERANCE)
        .map_err(|e| SolverError::InvalidInput {
            message: e.to_string(),
        })
}
