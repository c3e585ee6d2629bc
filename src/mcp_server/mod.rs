//! Tool server side: registry, dispatcher, and the stdio host loop.
//!
//! A server process builds a [`ToolRegistry`], wraps it in a
//! [`Dispatcher`], and hands that to a [`ServerHost`], which speaks the
//! protocol on stdin/stdout until the client goes away or a termination
//! signal arrives.

pub mod dispatcher;
pub mod host;
pub mod registry;
pub mod time_tools;

pub use dispatcher::Dispatcher;
pub use host::{ServerHost, ShutdownReason};
pub use registry::{HandlerResult, RegistryError, ToolFault, ToolHandler, ToolRegistry};
