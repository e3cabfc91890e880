use std::time::Duration;
use serde_json::Value;
use crate::error::{SyncError, SyncResult};
use crate::task::{lookup, CommandArgs, Task};

/// A lock untouched for this long is considered abandoned.
pub const LOCK_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// True iff the task is locked by a node other than `self_id`.
pub fn is_locked(task: &Task, self_id: &str) -> bool {
    task.locked_by().is_some_and(|holder| holder != self_id)
}

pub fn lock_holder(doc: &Value) -> Option<&str> {
    lookup(doc, "meta.locked").and_then(Value::as_str)
}

/// [`is_locked`] over a raw document.
pub fn is_locked_value(doc: &Value, self_id: &str) -> bool {
    lock_holder(doc).is_some_and(|holder| holder != self_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockRequest {
    pub lock: bool,
    pub unlock: bool,
    pub bypass: bool,
}

impl LockRequest {
    pub fn from_args(args: &CommandArgs) -> Self {
        Self {
            lock: args.lock,
            unlock: args.unlock,
            bypass: args.lock_bypass,
        }
    }

    pub fn from_value(args: Option<&Value>) -> Self {
        let flag = |name: &str| {
            args.and_then(|a| a.get(name))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        Self {
            lock: flag("lock"),
            unlock: flag("unlock"),
            bypass: flag("lockBypass"),
        }
    }
}

/// Relay-side arbitration of a write from `initiator`. Returns the holder
/// after the write, or a conflict if someone else holds a live lock.
///
/// - a write from a non-holder is refused unless it bypasses, unlocks, or
///   the lock has expired
/// - `lock` takes a free lock
/// - `unlock` releases
/// - the holder's next write without `lock` releases implicitly
pub fn arbitrate(
    instance_id: &str,
    holder: Option<&str>,
    updated_at: Option<i64>,
    request: LockRequest,
    initiator: &str,
    now_ms: i64,
) -> SyncResult<Option<String>> {
    let holder = match holder {
        Some(h) if h != initiator => {
            // A lock that was never stamped counts as abandoned.
            let expired = updated_at
                .is_none_or(|at| now_ms.saturating_sub(at) > LOCK_EXPIRY.as_millis() as i64);
            if expired {
                None
            } else if !request.bypass && !request.unlock {
                return Err(SyncError::LockConflict {
                    instance_id: instance_id.to_string(),
                    holder: h.to_string(),
                });
            } else {
                Some(h)
            }
        }
        other => other,
    };

    if request.unlock {
        return Ok(None);
    }
    match holder {
        None if request.lock => Ok(Some(initiator.to_string())),
        None => Ok(None),
        Some(h) if h == initiator => {
            if request.lock {
                Ok(Some(initiator.to_string()))
            } else {
                Ok(None)
            }
        }
        Some(h) => Ok(Some(h.to_string())),
    }
}
