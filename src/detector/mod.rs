pub mod classifier;
pub mod evaluator;

pub use classifier::classify;
pub use evaluator::{evaluate, AlertWindow, CloseCause, Decision};
