pub mod error;
pub mod ids;
pub mod item;
pub mod position;

pub use error::CoreError;
pub use ids::*;
pub use item::Item;
pub use position::{
    GapDiagnostic, PlacementRule, PositionChange, PositionGroup, PositionPolicy, Sibling,
};
