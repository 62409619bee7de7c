/*
[INPUT]:  Schema of the task record store
[OUTPUT]: Domain enums and records
[POS]:    Data layer - type definitions
[UPDATE]: When entities or status variants change
*/

pub mod enums;
pub mod models;

pub use enums::*;
pub use models::*;
