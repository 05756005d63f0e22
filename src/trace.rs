//! Structured engine trace for debugging and deterministic assertions.
//!
//! When enabled on a context, every enqueue, dispatch, completion, and user
//! event transition appends one [`TraceEvent`] to an in-memory buffer under
//! the engine lock, so the recorded order is the order the engine actually
//! committed state in. Events are serde-serializable so a trace can be
//! stored alongside a bug report and replayed through assertions later.
//!
//! Tracing is off by default and costs one branch per engine transition.

use serde::{Deserialize, Serialize};

use crate::queue::CommandKind;

/// One engine transition.
///
/// `queue`, `seq`, and `event` are the stable ids assigned at enqueue time;
/// they let a trace consumer reconstruct per-queue ordering and dependency
/// resolution without holding any engine objects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEvent {
    /// Command accepted into the pending set.
    Enqueue {
        queue: u64,
        seq: u64,
        kind: CommandKind,
        event: u64,
    },
    /// Command became eligible and started running.
    Dispatch {
        queue: u64,
        seq: u64,
        kind: CommandKind,
        event: u64,
    },
    /// Command finished; its completion event is now COMPLETE.
    Complete { event: u64 },
    /// Command failed; its completion event is now ERROR.
    Failed { event: u64, detail: String },
    /// A user event was completed by its owner.
    UserComplete { event: u64 },
    /// A user event was failed by its owner.
    UserError { event: u64 },
}

/// Appends to an optional trace buffer. No-op when tracing is disabled.
#[inline]
pub(crate) fn record(buf: &mut Option<Vec<TraceEvent>>, event: TraceEvent) {
    if let Some(buf) = buf {
        buf.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip() {
        let trace = vec![
            TraceEvent::Enqueue {
                queue: 3,
                seq: 0,
                kind: CommandKind::Signal,
                event: 11,
            },
            TraceEvent::Dispatch {
                queue: 3,
                seq: 0,
                kind: CommandKind::Signal,
                event: 11,
            },
            TraceEvent::Complete { event: 11 },
            TraceEvent::Failed {
                event: 12,
                detail: "dependency event failed".to_string(),
            },
        ];

        let json = serde_json::to_string(&trace).unwrap();
        let back: Vec<TraceEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trace);
    }

    #[test]
    fn record_is_noop_when_disabled() {
        let mut buf = None;
        record(&mut buf, TraceEvent::Complete { event: 1 });
        assert!(buf.is_none());

        let mut buf = Some(Vec::new());
        record(&mut buf, TraceEvent::Complete { event: 1 });
        assert_eq!(buf.unwrap().len(), 1);
    }
}
