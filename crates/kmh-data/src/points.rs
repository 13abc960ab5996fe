//! Point matrices, column standardization and pairwise Euclidean distances.

use kmh_types::{DataError, DistanceMatrix};
use rayon::prelude::*;

/// Dense n×d point matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PointMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl PointMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, DataError> {
        let n = rows.len();
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(n * cols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != cols {
                return Err(DataError::InvalidPoints {
                    message: format!("row {} has {} columns, expected {}", i, row.len(), cols),
                });
            }
            data.extend(row);
        }
        Ok(Self { rows: n, cols, data })
    }

    pub fn n_points(&self) -> usize {
        self.rows
    }

    pub fn dims(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn column_mean(&self, j: usize) -> f64 {
        if self.rows == 0 {
            return f64::NAN;
        }
        (0..self.rows).map(|i| self.get(i, j)).sum::<f64>() / self.rows as f64
    }

    /// Sample standard deviation (denominator n - 1).
    pub fn column_std(&self, j: usize) -> f64 {
        if self.rows < 2 {
            return f64::NAN;
        }
        let mean = self.column_mean(j);
        let ss: f64 = (0..self.rows)
            .map(|i| {
                let d = self.get(i, j) - mean;
                d * d
            })
            .sum();
        (ss / (self.rows - 1) as f64).sqrt()
    }

    /// Center every column and scale it by its sample standard deviation.
    ///
    /// A column whose deviation is exactly zero (or undefined) is divided by
    /// 1, so a constant column ends up all zeros.
    pub fn standardized(&self) -> PointMatrix {
        let mut means = Vec::with_capacity(self.cols);
        let mut scales = Vec::with_capacity(self.cols);
        for j in 0..self.cols {
            means.push(self.column_mean(j));
            let sigma = self.column_std(j);
            scales.push(if sigma == 0.0 || !sigma.is_finite() { 1.0 } else { sigma });
        }

        let mut data = self.data.clone();
        for row in data.chunks_mut(self.cols.max(1)) {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (*v - means[j]) / scales[j];
            }
        }
        PointMatrix {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Pairwise Euclidean distances via ‖x−y‖² = ‖x‖² + ‖y‖² − 2·x·y.
    ///
    /// Negative squares left by cancellation are clamped to zero and the
    /// diagonal is forced to exactly zero.
    pub fn distance_matrix(&self) -> Result<DistanceMatrix, DataError> {
        let n = self.rows;
        let norms: Vec<f64> = (0..n)
            .map(|i| self.row(i).iter().map(|v| v * v).sum())
            .collect();

        let mut data = vec![0.0; n * n];
        data.par_chunks_mut(n.max(1))
            .enumerate()
            .for_each(|(i, out)| {
                let xi = self.row(i);
                for (j, cell) in out.iter_mut().enumerate() {
                    let dot: f64 = xi.iter().zip(self.row(j)).map(|(a, b)| a * b).sum();
                    let sq = norms[i] + norms[j] - 2.0 * dot;
                    *cell = sq.max(0.0).sqrt();
                }
                out[i] = 0.0;
            });

        DistanceMatrix::from_flat(n, data)
    }
}
