//! k-medoids solver strategies.
//!
//! Every strategy implements [`Solver`] over a precomputed distance matrix.
//! [`ExactSolver`] proves optimality by branch and bound; [`GraspSolver`] is
//! a randomized heuristic that also seeds the exact search.

pub mod exact;
pub mod formulation;
pub mod grasp;
pub mod solver;

pub use exact::ExactSolver;
pub use formulation::{validate_input, Incidence, KMedoidsModel, Violation};
pub use grasp::GraspSolver;
pub use solver::{relative_gap, solver_by_name, Solution, Solver, SolverParams, SOLVER_NAMES};
