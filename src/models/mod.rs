//! Domain models

mod charge;
mod credits;

pub use charge::*;
pub use credits::*;
