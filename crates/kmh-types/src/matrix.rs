//! Dense pairwise distance matrix shared by the loader, the solvers and the
//! worker wire format.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::DataError;

/// Square, row-major n×n matrix of pairwise distances.
///
/// On the wire it is a list of rows (`matrix<float>`), so a worker input is
/// readable by any JSON consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    n: usize,
    data: Vec<f64>,
}

impl DistanceMatrix {
    /// Build from a flat row-major buffer of length `n * n`.
    pub fn from_flat(n: usize, data: Vec<f64>) -> Result<Self, DataError> {
        if data.len() != n * n {
            return Err(DataError::InvalidDistances {
                message: format!("expected {} entries for n={}, got {}", n * n, n, data.len()),
            });
        }
        Ok(Self { n, data })
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, DataError> {
        let n = rows.len();
        let mut data = Vec::with_capacity(n * n);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n {
                return Err(DataError::InvalidDistances {
                    message: format!("row {} has {} entries, expected {}", i, row.len(), n),
                });
            }
            data.extend(row);
        }
        Ok(Self { n, data })
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks(self.n.max(1))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Check the distance-matrix invariants: finite, non-negative entries,
    /// exactly zero diagonal, symmetric within `tolerance`.
    pub fn validate(&self, tolerance: f64) -> Result<(), DataError> {
        for i in 0..self.n {
            if self.get(i, i) != 0.0 {
                return Err(DataError::InvalidDistances {
                    message: format!("diagonal entry ({i},{i}) is {}", self.get(i, i)),
                });
            }
            for j in 0..self.n {
                let v = self.get(i, j);
                if !v.is_finite() || v < 0.0 {
                    return Err(DataError::InvalidDistances {
                        message: format!("entry ({i},{j}) is {v}"),
                    });
                }
                if j > i && (v - self.get(j, i)).abs() > tolerance {
                    return Err(DataError::InvalidDistances {
                        message: format!("entries ({i},{j}) and ({j},{i}) differ: {} vs {}", v, self.get(j, i)),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Serialize for DistanceMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows())
    }
}

impl<'de> Deserialize<'de> for DistanceMatrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<Vec<f64>>::deserialize(deserializer)?;
        DistanceMatrix::from_rows(rows).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_matrix(points: &[f64]) -> DistanceMatrix {
        let rows = points
            .iter()
            .map(|a| points.iter().map(|b| (a - b).abs()).collect())
            .collect();
        DistanceMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = DistanceMatrix::from_rows(vec![vec![0.0, 1.0], vec![1.0]]).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn validate_accepts_line_distances() {
        let d = line_matrix(&[0.0, 1.0, 2.0, 10.0, 11.0]);
        assert_eq!(d.len(), 5);
        assert_eq!(d.get(0, 3), 10.0);
        assert!(d.validate(1e-12).is_ok());
    }

    #[test]
    fn validate_flags_asymmetry_and_diagonal() {
        let asym = DistanceMatrix::from_flat(2, vec![0.0, 1.0, 2.0, 0.0]).unwrap();
        assert!(asym.validate(1e-9).is_err());

        let diag = DistanceMatrix::from_flat(2, vec![0.5, 1.0, 1.0, 0.0]).unwrap();
        assert!(diag.validate(1e-9).is_err());
    }

    #[test]
    fn serializes_as_list_of_rows() {
        let d = line_matrix(&[0.0, 3.0]);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "[[0.0,3.0],[3.0,0.0]]");

        let back: DistanceMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn empty_matrix_round_trips() {
        let d = DistanceMatrix::from_rows(Vec::new()).unwrap();
        assert!(d.is_empty());
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "[]");
    }
}
