pub mod submission;
pub mod task;
pub mod worker;
pub mod workflow;

pub use submission::{Submission, SubmissionState};
pub use task::{ExecutorType, Task, TaskState};
pub use worker::{Worker, WorkerRuntime, WorkerState};
pub use workflow::Workflow;
