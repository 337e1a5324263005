pub mod config;
pub mod credential;
pub mod error;
pub mod event_bus;
pub mod history;
pub mod machine;
pub mod output;
pub mod paths;
pub mod retry;
pub mod trace;
pub mod turn_loop;

pub use config::*;
pub use credential::*;
pub use error::*;
pub use event_bus::*;
pub use history::*;
pub use machine::{Distiller, DistillerOptions};
pub use output::*;
pub use paths::*;
pub use retry::*;
pub use trace::*;
pub use turn_loop::{metadata_trace_text, user_trace_text, validate_reply};
