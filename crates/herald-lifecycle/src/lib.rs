//! Notice lifecycle
//!
//! The canonical state lives on the notice and moves forward through typed
//! mutations. Everything a person looks at (the semaphore, the status view)
//! is derived from timestamps at read time. The scheduled commit of the
//! terminal `firm` state, impugnment and the physical track are recorded
//! here, as is issuance of new notices.

pub mod error;
pub mod firmness;
pub mod impugnment;
pub mod issuance;
pub mod physical;
pub mod semaphore;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{LifecycleError, LifecycleResult};
pub use firmness::{promote_due_notices, FirmnessReport};
pub use impugnment::{record_impugnment, resolve_impugnment, ImpugnmentResolution};
pub use issuance::{IssuedNotice, Issuer};
pub use physical::record_physical_dispatch;
pub use semaphore::{derive_semaphore, Semaphore, ALERT_AFTER_SECS, EXPIRING_SOON_SECS};
pub use status::{status_view, Milestones, NoticeStatus};
