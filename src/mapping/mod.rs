//! Result storage: mapping units, the hub that owns them, and exporters.

pub mod export;
pub mod hub;
pub mod unit;

pub use hub::MappingHub;
pub use unit::{Column, MappingUnit, Row, UnitEvent, UnitMetadata, UnitSummary};
