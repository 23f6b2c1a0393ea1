pub mod agent;
pub mod pane;
pub mod wrap;
