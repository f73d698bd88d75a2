// GLAD - AI coworker with inline tool execution
// Library exports

pub mod agent; // Turn loop and conversation history
pub mod claude;
pub mod config;
pub mod console;
pub mod errors;
pub mod ledger; // Task lifecycle tracking
pub mod memory;
pub mod processor; // Streaming tag processor
pub mod runtime;
pub mod tags;
pub mod tools; // Tool execution system
