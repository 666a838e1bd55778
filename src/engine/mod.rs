//! Flow engine: the run loop, the flow controller, and task execution.

mod execution;
pub mod flow;
pub mod listener;
pub mod looper;

pub use flow::{Flow, FlowBuilder};
pub use listener::FlowListener;
pub use looper::{Dispatcher, Job, LoopLauncher, Looper};
