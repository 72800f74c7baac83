//! Shared vocabulary for herald: time and identifiers, the Notice aggregate
//! with its conditional mutation engine, integrity records, gate and
//! delivery records, repository traits and external capability contracts.

pub mod crypto;
pub mod error;
pub mod integrity;
pub mod notice;
pub mod records;
pub mod traits;
pub mod types;

pub use crypto::*;
pub use error::*;
pub use integrity::*;
pub use notice::*;
pub use records::*;
pub use traits::*;
pub use types::*;
