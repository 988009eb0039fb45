pub mod aggregate;
pub mod entities;
pub mod facts;
pub mod inputs;
pub mod snapshots;
