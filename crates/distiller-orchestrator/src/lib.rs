mod model;
mod reducer;

pub use model::*;
pub use reducer::*;
