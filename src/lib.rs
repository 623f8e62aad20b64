pub mod cli;
pub mod data;
pub mod dataset;
pub mod epoch;
pub mod error;
pub mod logging;
pub mod model;
pub mod tracking;
pub mod training;

pub use error::TrainingError;
