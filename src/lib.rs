pub mod control;
pub mod error;
pub mod estimate;
pub mod math;
pub mod models;
pub mod processing;

pub use control::{ControlMap, StandControlMap};
pub use error::{ProcessingError, StateError};
pub use models::{Layer, LayerType, Polygon, SpeciesRecord, UtilizationClass, UtilizationVector};
pub use processing::{Bank, ProcessingEngine, ProcessingState, ProcessingStep};
