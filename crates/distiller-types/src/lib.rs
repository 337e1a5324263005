mod event;
mod job;
mod provider;

pub use event::*;
pub use job::*;
pub use provider::*;

/// Sentinel the model emits once the source material is fully covered.
pub const END_OF_BOOK_MARKER: &str = "<end_of_book>";
/// Prompt sent for every turn after the first.
pub const NEXT_PROMPT: &str = "Next";
/// Internal-reasoning token that must never reach the document.
pub const THOUGHT_LEAK_MARKER: &str = "<ctrl94>";
