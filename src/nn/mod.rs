//! Neural network components

pub mod layers;
pub mod models;
pub mod losses;

pub use layers::*;
pub use models::*;
pub use losses::*;
