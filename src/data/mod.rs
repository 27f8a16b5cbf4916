//! Data layer: core types, loading, and selection.
//!
//! Architecture:
//! ```text
//!  .tsv / .csv / .json / .parquet
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse + validate rows → Dataset
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │ Dataset   │  Vec<Measurement>, identifier sets
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  filter   │  selection → row indices → curve groups
//!   └──────────┘
//! ```

pub mod loader;
pub mod model;
pub mod filter;
