//! Monitor data model, status evaluation and uptime aggregation.

mod evaluator;
mod spec;
mod state;
mod uptime;

pub use evaluator::*;
pub use spec::*;
pub use state::*;
pub use uptime::*;
