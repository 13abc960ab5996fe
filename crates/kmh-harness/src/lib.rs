//! Process-isolated batch harness for k-medoids optimization runs.
//!
//! A [`BatchDriver`] walks every instance × k pair, a [`Supervisor`] runs
//! each job in its own worker process under a wall-clock budget, and a
//! [`ResultAccumulator`] keeps the checkpointed result table.

pub mod accumulator;
pub mod channel;
pub mod driver;
pub mod supervisor;
pub mod worker;

pub use accumulator::ResultAccumulator;
pub use channel::{Envelope, FileChannel};
pub use driver::{BatchDriver, BatchState, BatchStatus};
pub use supervisor::{JobOutcome, JobState, Supervisor, WorkerCommand, KILLED_EXIT_CODE};
pub use worker::{execute_job, execute_named_job, run_worker};
