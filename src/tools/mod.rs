// Tool execution system
//
// Executors for the tool tags the model may emit, plus the registry the
// stream processor resolves them through.

pub mod executor;
pub mod implementations;
pub mod registry;

pub use executor::{format_secs, InvocationContext, ToolError, ToolExecutor};
pub use registry::{ToolRegistration, ToolRegistry, ToolRegistryBuilder, ToolSettings};
