pub mod diff;
pub mod integrity;
pub mod lock;
pub mod reconcile;

pub use diff::{diff, merge, Patch, PatchOp};
pub use integrity::{fingerprint, scoped_fingerprint, verify, Integrity};
pub use lock::{arbitrate, is_locked, LockRequest};
pub use reconcile::{Reconciled, Reconciler, Role};
