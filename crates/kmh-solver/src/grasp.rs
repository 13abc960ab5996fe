//! Greedy randomized adaptive search for k-medoids.
//!
//! Each start builds a medoid set by repeatedly drawing from a restricted
//! candidate list (the insertions within `alpha` of the best one), then
//! improves it with best-improvement swaps until no swap helps.

use std::time::Instant;

use kmh_types::{DistanceMatrix, SolveStatus, SolverError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::formulation::KMedoidsModel;
use crate::solver::{relative_gap, Solution, Solver, SolverParams};

pub const DEFAULT_ALPHA: f64 = 0.1;
pub const DEFAULT_ITERATIONS: usize = 64;
pub(crate) const DEFAULT_SEED: u64 = 42;

const IMPROVEMENT_EPS: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct GraspSolver {
    alpha: f64,
    iterations: usize,
}

impl Default for GraspSolver {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA, DEFAULT_ITERATIONS)
    }
}

/// Best medoid set over all completed starts.
#[derive(Debug, Clone)]
pub(crate) struct GraspOutcome {
    pub medoids: Vec<usize>,
    pub objective: f64,
    pub starts: usize,
    /// A deadline or interrupt ended the search before every start
    /// reached a local optimum.
    pub cut_short: bool,
}

impl GraspSolver {
    /// `alpha` is clamped to `[0, 1]`; at least one start always runs.
    pub fn new(alpha: f64, iterations: usize) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            iterations: iterations.max(1),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Run up to `iterations` starts. The first construction always
    /// completes so there is an incumbent even with an expired deadline.
    pub(crate) fn search(
        &self,
        model: &KMedoidsModel<'_>,
        params: &SolverParams,
        deadline: Option<Instant>,
    ) -> GraspOutcome {
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed.unwrap_or(DEFAULT_SEED));
        let stop = || params.interrupted() || deadline.map_or(false, |d| Instant::now() >= d);

        let mut state = SwapState::construct(model.distances(), model.k(), self.alpha, &mut rng);
        let converged = state.local_search(&stop);
        let mut best = GraspOutcome {
            medoids: state.sorted_medoids(),
            objective: state.cost(),
            starts: 1,
            cut_short: !converged,
        };
        if best.cut_short {
            return best;
        }

        while best.starts < self.iterations {
            if stop() {
                best.cut_short = true;
                break;
            }
            let mut state = SwapState::construct(model.distances(), model.k(), self.alpha, &mut rng);
            let converged = state.local_search(&stop);
            best.starts += 1;
            let cost = state.cost();
            if cost < best.objective {
                best.medoids = state.sorted_medoids();
                best.objective = cost;
            }
            if !converged {
                best.cut_short = true;
                break;
            }
        }
        best
    }
}

impl Solver for GraspSolver {
    fn name(&self) -> &'static str {
        "grasp"
    }

    fn solve(
        &self,
        distances: &DistanceMatrix,
        k: usize,
        params: &SolverParams,
    ) -> Result<Solution, SolverError> {
        let start = Instant::now();
        let model = KMedoidsModel::new(distances, k)?;
        let outcome = self.search(&model, params, params.deadline(start));

        let assignment = model.assign(&outcome.medoids);
        let objective = model.objective(&assignment);
        let lower_bound = model.root_lower_bound().min(objective);
        // Only the root bound can certify a heuristic incumbent. Otherwise
        // the status says why the search ended: every start ran to a local
        // optimum (IterationLimit), or an interrupt or deadline stopped it.
        let status = if objective <= lower_bound {
            SolveStatus::Optimal
        } else if !outcome.cut_short {
            SolveStatus::IterationLimit
        } else if params.interrupted() {
            SolveStatus::Interrupted
        } else {
            SolveStatus::TimeLimit
        };

        if params.verbose() {
            tracing::info!(
                "GRASP finished {} starts on n={} k={}: objective {:.6}, bound {:.6}",
                outcome.starts,
                model.n(),
                k,
                objective,
                lower_bound
            );
        }

        Ok(Solution {
            status,
            objective,
            medoids: outcome.medoids,
            assignment,
            runtime_sec: start.elapsed().as_secs_f64(),
            mip_gap: relative_gap(objective, lower_bound),
            lower_bound,
            upper_bound: objective,
        })
    }
}

/// A medoid set with, per point, the nearest and second-nearest medoid
/// distance so a swap can be priced in O(n).
struct SwapState<'a> {
    d: &'a DistanceMatrix,
    medoids: Vec<usize>,
    in_set: Vec<bool>,
    near: Vec<f64>,
    near_idx: Vec<usize>,
    second: Vec<f64>,
}

impl<'a> SwapState<'a> {
    fn empty(d: &'a DistanceMatrix, k: usize) -> Self {
        let n = d.len();
        Self {
            d,
            medoids: Vec::with_capacity(k),
            in_set: vec![false; n],
            near: vec![f64::INFINITY; n],
            near_idx: vec![usize::MAX; n],
            second: vec![f64::INFINITY; n],
        }
    }

    fn construct(d: &'a DistanceMatrix, k: usize, alpha: f64, rng: &mut ChaCha8Rng) -> Self {
        let mut state = Self::empty(d, k);
        while state.medoids.len() < k {
            let candidates: Vec<(usize, f64)> = (0..d.len())
                .filter(|&c| !state.in_set[c])
                .map(|c| (c, state.insertion_cost(c)))
                .collect();
            if candidates.is_empty() {
                break;
            }

            let (min, max) = candidates
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, dc)| {
                    (lo.min(dc), hi.max(dc))
                });
            let threshold = if max > min { min + alpha * (max - min) } else { min };
            let rcl: Vec<usize> = candidates
                .iter()
                .filter(|(_, dc)| *dc <= threshold)
                .map(|(c, _)| *c)
                .collect();

            let chosen = match rcl.len() {
                0 => candidates[0].0,
                len => rcl[rng.gen_range(0..len)],
            };
            state.add(chosen);
        }
        state
    }

    /// Change in total cost when `c` joins the set. On an empty set this
    /// is the cost of `c` serving everything.
    fn insertion_cost(&self, c: usize) -> f64 {
        let row = self.d.row(c);
        if self.medoids.is_empty() {
            return row.iter().sum();
        }
        row.iter()
            .zip(&self.near)
            .map(|(dist, near)| (dist - near).min(0.0))
            .sum()
    }

    fn add(&mut self, c: usize) {
        self.medoids.push(c);
        self.in_set[c] = true;
        self.absorb(c);
    }

    fn absorb(&mut self, c: usize) {
        for (j, &dist) in self.d.row(c).iter().enumerate() {
            if dist < self.near[j] {
                self.second[j] = self.near[j];
                self.near[j] = dist;
                self.near_idx[j] = c;
            } else if dist < self.second[j] {
                self.second[j] = dist;
            }
        }
    }

    fn swap_delta(&self, incoming: usize, outgoing: usize) -> f64 {
        let row = self.d.row(incoming);
        (0..self.d.len())
            .map(|j| {
                let kept = if self.near_idx[j] == outgoing {
                    self.second[j]
                } else {
                    self.near[j]
                };
                kept.min(row[j]) - self.near[j]
            })
            .sum()
    }

    fn swap(&mut self, incoming: usize, outgoing: usize) {
        if let Some(slot) = self.medoids.iter_mut().find(|m| **m == outgoing) {
            *slot = incoming;
        }
        self.in_set[outgoing] = false;
        self.in_set[incoming] = true;

        self.near.fill(f64::INFINITY);
        self.second.fill(f64::INFINITY);
        self.near_idx.fill(usize::MAX);
        for m in self.medoids.clone() {
            self.absorb(m);
        }
    }

    /// Best-improvement swaps until a local optimum (returns `true`) or
    /// until `stop` fires (returns `false`).
    fn local_search(&mut self, stop: &impl Fn() -> bool) -> bool {
        loop {
            let mut best_delta = 0.0;
            let mut best_move = None;
            for incoming in 0..self.d.len() {
                if self.in_set[incoming] {
                    continue;
                }
                if stop() {
                    return false;
                }
                for &outgoing in &self.medoids {
                    let delta = self.swap_delta(incoming, outgoing);
                    if delta < best_delta - IMPROVEMENT_EPS {
                        best_delta = delta;
                        best_move = Some((incoming, outgoing));
                    }
                }
            }
            match best_move {
                Some((incoming, outgoing)) => self.swap(incoming, outgoing),
                None => return true,
            }
        }
    }

    fn cost(&self) -> f64 {
        self.near.iter().sum()
    }

    fn sorted_medoids(&self) -> Vec<usize> {
        let mut medoids = self.medoids.clone();
        medoids.sort_unstable();
        medoids
    }
}
