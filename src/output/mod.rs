// Output module: errors, progress events and terminal rendering

pub mod errors;
pub mod events;
pub mod terminal;

pub use errors::*;
pub use events::*;
pub use terminal::*;

/// Output format for the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON document
    Json,
}
