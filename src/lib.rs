//! Healthcare revenue-cycle batch pipeline.
//!
//! Five sequenced stages over flat files: extract from the hospital
//! sources, clean, build the star schema, reconcile the patient dimension
//! with SCD Type 2 history, and load the warehouse.

pub mod clean;
pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod scd;
pub mod star;
pub mod store;
pub mod table;
pub mod warehouse;
