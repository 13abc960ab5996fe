//! Exact k-medoids by depth-first branch and bound over medoid subsets.
//!
//! Medoids are chosen in increasing index order. At a node that has chosen
//! some medoids and will pick the rest from `c..n`, every point `j` pays at
//! least `min(cur[j], suffix_min[c][j])`, where `cur[j]` is its distance to
//! the nearest chosen medoid and `suffix_min[c][j] = min_{i >= c} D[i][j]`.
//! Summing over points gives the node bound. The same bound taken at a
//! sibling index `i` covers every later sibling too, so sibling loops stop
//! at the first `i` whose bound reaches the incumbent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use kmh_types::{DistanceMatrix, SolveStatus, SolverError};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::formulation::KMedoidsModel;
use crate::grasp::GraspSolver;
use crate::solver::{relative_gap, Solution, Solver, SolverParams};

/// Deadline and interrupt are polled once per this many nodes per thread.
const CHECK_EVERY: u64 = 1024;
/// Starts of the heuristic that seeds the incumbent.
const WARM_START_ITERATIONS: usize = 8;

#[derive(Debug, Clone)]
pub struct ExactSolver {
    warm_start: bool,
}

impl Default for ExactSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ExactSolver {
    pub fn new() -> Self {
        Self { warm_start: true }
    }

    /// Start from an empty incumbent instead of a heuristic one.
    pub fn without_warm_start() -> Self {
        Self { warm_start: false }
    }

    /// Bytes held during the search: the distance matrix and the suffix-min
    /// table, both `n²` doubles.
    pub fn estimated_bytes(n: usize) -> f64 {
        2.0 * (n as f64) * (n as f64) * 8.0
    }
}

impl Solver for ExactSolver {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn solve(
        &self,
        distances: &DistanceMatrix,
        k: usize,
        params: &SolverParams,
    ) -> Result<Solution, SolverError> {
        let start = Instant::now();
        let model = KMedoidsModel::new(distances, k)?;
        let n = model.n();

        if let Some(limit_mb) = params.memlimit_mb {
            let needed_mb = Self::estimated_bytes(n) / (1024.0 * 1024.0);
            if needed_mb > limit_mb {
                if params.verbose() {
                    tracing::warn!(
                        "Exact search on n={} needs ~{:.1} MB, limit is {:.1} MB",
                        n,
                        needed_mb,
                        limit_mb
                    );
                }
                return Ok(Solution::without_incumbent(
                    SolveStatus::MemLimit,
                    start.elapsed().as_secs_f64(),
                    f64::NAN,
                ));
            }
        }

        if k == n {
            let medoids: Vec<usize> = (0..n).collect();
            let assignment = model.assign(&medoids);
            return Ok(Solution {
                status: SolveStatus::Optimal,
                objective: 0.0,
                medoids,
                assignment,
                runtime_sec: start.elapsed().as_secs_f64(),
                mip_gap: 0.0,
                lower_bound: 0.0,
                upper_bound: 0.0,
            });
        }

        let deadline = params.deadline(start);
        let search = BranchAndBound::new(&model, deadline, params);

        if self.warm_start {
            let warm = GraspSolver::new(crate::grasp::DEFAULT_ALPHA, WARM_START_ITERATIONS)
                .search(&model, params, deadline);
            search.offer(warm.objective, &warm.medoids);
        }

        let root_bound = model.root_lower_bound();
        if params.verbose() {
            tracing::info!(
                "Exact search on n={} k={}: {} variables, {} constraints, root bound {:.6}, warm start {:.6}",
                n,
                k,
                model.num_variables(),
                model.num_constraints(),
                root_bound,
                search.best()
            );
        }

        match params.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| SolverError::ExecutionFailed {
                        message: format!("failed to build thread pool: {}", e),
                    })?;
                pool.install(|| search.run());
            }
            None => search.run(),
        }

        let stopped = search.stop.load(Ordering::Relaxed);
        let nodes = search.nodes.load(Ordering::Relaxed);
        let incumbent = search.incumbent.into_inner();
        let runtime_sec = start.elapsed().as_secs_f64();

        let status = if !stopped {
            SolveStatus::Optimal
        } else if params.interrupted() {
            SolveStatus::Interrupted
        } else {
            SolveStatus::TimeLimit
        };

        if incumbent.medoids.is_empty() {
            return Ok(Solution::without_incumbent(status, runtime_sec, root_bound));
        }

        let assignment = model.assign(&incumbent.medoids);
        let objective = model.objective(&assignment);
        let lower_bound = if status == SolveStatus::Optimal {
            objective
        } else {
            root_bound.min(objective)
        };

        if params.verbose() {
            tracing::info!(
                "Exact search {:?} after {} nodes in {:.3}s: objective {:.6}, bound {:.6}",
                status,
                nodes,
                runtime_sec,
                objective,
                lower_bound
            );
        }

        Ok(Solution {
            status,
            objective,
            medoids: incumbent.medoids,
            assignment,
            runtime_sec,
            mip_gap: relative_gap(objective, lower_bound),
            lower_bound,
            upper_bound: objective,
        })
    }
}

#[derive(Debug)]
struct Incumbent {
    cost: f64,
    medoids: Vec<usize>,
}

struct BranchAndBound<'a> {
    d: &'a DistanceMatrix,
    n: usize,
    k: usize,
    /// `(n + 1) × n`; row `n` is all infinity.
    suffix_min: Vec<f64>,
    incumbent: Mutex<Incumbent>,
    /// Incumbent cost bits, readable without the lock.
    best_bits: AtomicU64,
    stop: AtomicBool,
    nodes: AtomicU64,
    deadline: Option<Instant>,
    params: &'a SolverParams,
}

impl<'a> BranchAndBound<'a> {
    fn new(model: &KMedoidsModel<'a>, deadline: Option<Instant>, params: &'a SolverParams) -> Self {
        let d = model.distances();
        let n = model.n();
        let mut suffix_min = vec![f64::INFINITY; (n + 1) * n];
        for c in (0..n).rev() {
            let (head, tail) = suffix_min.split_at_mut((c + 1) * n);
            let current = &mut head[c * n..];
            let next = &tail[..n];
            for (j, cell) in current.iter_mut().enumerate() {
                *cell = d.get(c, j).min(next[j]);
            }
        }

        Self {
            d,
            n,
            k: model.k(),
            suffix_min,
            incumbent: Mutex::new(Incumbent {
                cost: f64::INFINITY,
                medoids: Vec::new(),
            }),
            best_bits: AtomicU64::new(f64::INFINITY.to_bits()),
            stop: AtomicBool::new(false),
            nodes: AtomicU64::new(0),
            deadline,
            params,
        }
    }

    fn suffix(&self, c: usize) -> &[f64] {
        &self.suffix_min[c * self.n..(c + 1) * self.n]
    }

    fn best(&self) -> f64 {
        f64::from_bits(self.best_bits.load(Ordering::Relaxed))
    }

    fn offer(&self, cost: f64, medoids: &[usize]) {
        if cost >= self.best() {
            return;
        }
        let mut incumbent = self.incumbent.lock();
        if cost < incumbent.cost {
            incumbent.cost = cost;
            incumbent.medoids = medoids.to_vec();
            self.best_bits.store(cost.to_bits(), Ordering::Relaxed);
        }
    }

    fn should_stop(&self, nodes: &mut u64) -> bool {
        if *nodes % CHECK_EVERY == 0 {
            let expired = self.deadline.map_or(false, |d| Instant::now() >= d);
            if expired || self.params.interrupted() {
                self.stop.store(true, Ordering::Relaxed);
            }
        }
        *nodes += 1;
        self.stop.load(Ordering::Relaxed)
    }

    /// Fan the first medoid out over the current rayon pool.
    fn run(&self) {
        (0..=self.n - self.k).into_par_iter().for_each(|first| {
            let mut nodes = 0;
            if self.should_stop(&mut nodes) {
                return;
            }
            let open: f64 = self.suffix(first).iter().sum();
            if open >= self.best() {
                self.nodes.fetch_add(nodes, Ordering::Relaxed);
                return;
            }

            let cur = self.d.row(first).to_vec();
            let mut chosen = vec![first];
            if self.k == 1 {
                self.offer(cur.iter().sum(), &chosen);
            } else if bound(&cur, self.suffix(first + 1)) < self.best() {
                self.descend(first + 1, self.k - 1, &mut chosen, &cur, &mut nodes);
            }
            self.nodes.fetch_add(nodes, Ordering::Relaxed);
        });
    }

    fn descend(
        &self,
        next: usize,
        remaining: usize,
        chosen: &mut Vec<usize>,
        cur: &[f64],
        nodes: &mut u64,
    ) {
        if self.should_stop(nodes) {
            return;
        }
        for i in next..=(self.n - remaining) {
            if bound(cur, self.suffix(i)) >= self.best() {
                break;
            }
            let child: Vec<f64> = cur
                .iter()
                .zip(self.d.row(i))
                .map(|(a, b)| a.min(*b))
                .collect();
            chosen.push(i);
            if remaining == 1 {
                self.offer(child.iter().sum(), chosen);
            } else if bound(&child, self.suffix(i + 1)) < self.best() {
                self.descend(i + 1, remaining - 1, chosen, &child, nodes);
            }
            chosen.pop();
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
        }
    }
}

fn bound(cur: &[f64], suffix: &[f64]) -> f64 {
    cur.iter().zip(suffix).map(|(a, b)| a.min(*b)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn line(points: &[f64]) -> DistanceMatrix {
        let rows = points
            .iter()
            .map(|a| points.iter().map(|b| (a - b).abs()).collect())
            .collect();
        DistanceMatrix::from_rows(rows).unwrap()
    }

    fn planar(points: &[(f64, f64)]) -> DistanceMatrix {
        let rows = points
            .iter()
            .map(|a| {
                points
                    .iter()
                    .map(|b| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt())
                    .collect()
            })
            .collect();
        DistanceMatrix::from_rows(rows).unwrap()
    }

    fn scattered(n: usize) -> DistanceMatrix {
        let pts: Vec<(f64, f64)> = (0..n)
            .map(|i| {
                let t = i as f64;
                ((t * 1.618).sin() * 10.0 + (i % 5) as f64, (t * 0.577).cos() * 7.0)
            })
            .collect();
        planar(&pts)
    }

    /// Enumerate every k-subset.
    fn brute_force(d: &DistanceMatrix, k: usize) -> f64 {
        let model = KMedoidsModel::new(d, k).unwrap();
        let n = d.len();
        let mut best = f64::INFINITY;
        let mut subset: Vec<usize> = (0..k).collect();
        loop {
            best = best.min(model.evaluate(&subset));
            let Some(i) = (0..k).rev().find(|&i| subset[i] < n - k + i) else {
                return best;
            };
            subset[i] += 1;
            for j in i + 1..k {
                subset[j] = subset[j - 1] + 1;
            }
        }
    }

    #[test]
    fn five_point_line_two_clusters() {
        let d = line(&[0.0, 1.0, 2.0, 10.0, 11.0]);
        let solution = ExactSolver::new()
            .solve(&d, 2, &SolverParams::default())
            .unwrap();

        assert_eq!(solution.status, SolveStatus::Optimal);
        assert_eq!(solution.objective, 3.0);
        assert_eq!(solution.medoids[0], 1);
        assert!(solution.medoids[1] == 3 || solution.medoids[1] == 4);
        assert_eq!(solution.mip_gap, 0.0);
        assert_eq!(solution.lower_bound, solution.objective);
        assert_eq!(solution.objective, brute_force(&d, 2));

        let model = KMedoidsModel::new(&d, 2).unwrap();
        assert!(model.is_feasible(&solution.medoids, &solution.assignment));
    }

    #[test]
    fn cold_start_matches_warm_start() {
        let d = scattered(14);
        let params = SolverParams::default();
        let warm = ExactSolver::new().solve(&d, 3, &params).unwrap();
        let cold = ExactSolver::without_warm_start().solve(&d, 3, &params).unwrap();
        assert_eq!(cold.status, SolveStatus::Optimal);
        assert!((warm.objective - cold.objective).abs() < 1e-9);
        assert!((cold.objective - brute_force(&d, 3)).abs() < 1e-9);
    }

    #[test]
    fn all_points_as_medoids_costs_nothing() {
        let d = scattered(6);
        let solution = ExactSolver::new()
            .solve(&d, 6, &SolverParams::default())
            .unwrap();
        assert_eq!(solution.status, SolveStatus::Optimal);
        assert_eq!(solution.objective, 0.0);
        assert_eq!(solution.medoids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn single_medoid_is_the_one_median() {
        let d = line(&[0.0, 1.0, 2.0, 3.0, 100.0]);
        let solution = ExactSolver::without_warm_start()
            .solve(&d, 1, &SolverParams::default())
            .unwrap();
        assert_eq!(solution.medoids, vec![2]);
        assert_eq!(solution.objective, 2.0 + 1.0 + 0.0 + 1.0 + 98.0);
    }

    #[test]
    fn thread_counts_agree() {
        let d = scattered(18);
        let one = ExactSolver::new()
            .solve(&d, 4, &SolverParams::default().with_threads(1))
            .unwrap();
        let four = ExactSolver::new()
            .solve(&d, 4, &SolverParams::default().with_threads(4))
            .unwrap();
        assert_eq!(one.status, SolveStatus::Optimal);
        assert_eq!(four.status, SolveStatus::Optimal);
        assert!((one.objective - four.objective).abs() < 1e-9);
    }

    #[test]
    fn zero_time_limit_keeps_the_warm_start() {
        let d = scattered(60);
        let params = SolverParams::default().with_time_limit(Duration::ZERO);
        let solution = ExactSolver::new().solve(&d, 5, &params).unwrap();

        assert_eq!(solution.status, SolveStatus::TimeLimit);
        assert!(solution.has_incumbent());
        assert_eq!(solution.medoids.len(), 5);
        assert!(solution.lower_bound <= solution.upper_bound);
        assert!(solution.mip_gap >= 0.0);
    }

    #[test]
    fn raised_interrupt_stops_with_incumbent() {
        let d = scattered(60);
        let params = SolverParams::default().with_interrupt(Arc::new(AtomicBool::new(true)));
        let solution = ExactSolver::new().solve(&d, 5, &params).unwrap();
        assert_eq!(solution.status, SolveStatus::Interrupted);
        assert!(solution.has_incumbent());
    }

    #[test]
    fn interrupt_without_warm_start_has_no_incumbent() {
        let d = scattered(30);
        let params = SolverParams::default().with_interrupt(Arc::new(AtomicBool::new(true)));
        let solution = ExactSolver::without_warm_start().solve(&d, 3, &params).unwrap();
        assert_eq!(solution.status, SolveStatus::Interrupted);
        assert!(!solution.has_incumbent());
        assert!(solution.objective.is_nan());
        assert!(solution.medoids.is_empty());
    }

    #[test]
    fn tiny_memory_limit_gives_up() {
        let d = scattered(20);
        let params = SolverParams::default().with_memlimit_mb(0.001);
        let solution = ExactSolver::new().solve(&d, 3, &params).unwrap();
        assert_eq!(solution.status, SolveStatus::MemLimit);
        assert!(solution.objective.is_nan());
        assert!(solution.medoids.is_empty());
        assert!(!solution.status.is_usable());
    }

    #[test]
    fn out_of_range_k_is_an_error() {
        let d = scattered(4);
        let solver = ExactSolver::new();
        assert!(matches!(
            solver.solve(&d, 5, &SolverParams::default()),
            Err(SolverError::InvalidInput { .. })
        ));
        assert!(matches!(
            solver.solve(&d, 0, &SolverParams::default()),
            Err(SolverError::InvalidInput { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_exact_matches_enumeration(
            coords in prop::collection::vec((-50.0f64..50.0, -50.0f64..50.0), 2..9),
            k_seed in 0usize..100,
        ) {
            let d = planar(&coords);
            let k = 1 + k_seed % coords.len();
            let solution = ExactSolver::new().solve(&d, k, &SolverParams::default()).unwrap();
            prop_assert_eq!(solution.status, SolveStatus::Optimal);
            prop_assert!((solution.objective - brute_force(&d, k)).abs() <= 1e-9 * brute_force(&d, k).max(1.0));

            let model = KMedoidsModel::new(&d, k).unwrap();
            prop_assert!(model.is_feasible(&solution.medoids, &solution.assignment));
        }

        #[test]
        fn prop_grasp_never_beats_exact(
            coords in prop::collection::vec((-20.0f64..20.0, -20.0f64..20.0), 3..10),
            seed in any::<u64>(),
        ) {
            let d = planar(&coords);
            let k = 2.min(coords.len());
            let exact = ExactSolver::new().solve(&d, k, &SolverParams::default()).unwrap();
            let grasp = GraspSolver::default()
                .solve(&d, k, &SolverParams::default().with_seed(seed))
                .unwrap();
            prop_assert!(grasp.objective >= exact.objective - 1e-9);
        }
    }
}
