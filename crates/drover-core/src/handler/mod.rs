//! The task-body plug-in seam: the [`TaskHandler`] trait and the
//! tag-keyed [`HandlerRegistry`].

mod registry;
mod trait_def;

pub use registry::HandlerRegistry;
pub use trait_def::{HandlerOutput, TaskHandler};
