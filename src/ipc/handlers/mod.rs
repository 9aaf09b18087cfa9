pub mod assessment;
pub mod core;
pub mod instruments;
pub mod program;
pub mod self_assessment;
