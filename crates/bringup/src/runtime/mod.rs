//! Runtime components: graph, probes, scheduling and the process boundary

pub mod executor;
pub mod graph;
pub mod invoker;
pub mod node;
pub mod probe;
pub mod process;
pub mod report;
pub mod scheduler;

pub use executor::*;
pub use graph::*;
pub use invoker::*;
pub use node::*;
pub use probe::*;
pub use process::*;
pub use report::*;
pub use scheduler::*;
