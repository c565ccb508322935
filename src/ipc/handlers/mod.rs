pub mod backup;
pub mod core;
pub mod indirect;
pub mod outcomes;
pub mod program;
pub mod reports;
pub mod results;
pub mod setup;
pub mod thresholds;
