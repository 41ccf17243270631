//! Panic recovery helpers.
//!
//! RPC handlers, timer callbacks and off-module jobs all run under
//! panic capture so a misbehaving handler cannot take down its runloop.
//! The captured payload is formatted here, with a backtrace capped at
//! the process-wide length from [`crate::config::stack_trace_len`].

use std::any::Any;
use std::backtrace::Backtrace;

use crate::config;

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Format a panic payload with a length-capped backtrace.
///
/// The trace is captured at recovery time, which still points at the
/// runloop that executed the handler. A zero configured length drops
/// the trace entirely.
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    let msg = panic_message(payload);
    let cap = config::stack_trace_len();
    if cap == 0 {
        return msg;
    }

    let mut trace = Backtrace::force_capture().to_string();
    if trace.len() > cap {
        // Truncate on a char boundary; backtraces are ASCII in practice.
        let mut end = cap;
        while end > 0 && !trace.is_char_boundary(end) {
            end -= 1;
        }
        trace.truncate(end);
    }
    format!("{msg}: {trace}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_panic_message_str() {
        let payload = catch_unwind(AssertUnwindSafe(|| panic!("boom"))).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }

    #[test]
    fn test_panic_message_string() {
        let payload =
            catch_unwind(AssertUnwindSafe(|| panic!("{} exploded", "handler"))).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "handler exploded");
    }

    #[test]
    fn test_describe_panic_includes_message() {
        let payload = catch_unwind(AssertUnwindSafe(|| panic!("boom"))).unwrap_err();
        let described = describe_panic(payload.as_ref());
        assert!(described.starts_with("boom"));
    }

    #[test]
    fn test_zero_length_drops_trace() {
        let payload = catch_unwind(AssertUnwindSafe(|| panic!("bare"))).unwrap_err();
        config::set_stack_trace_len(0);
        let described = describe_panic(payload.as_ref());
        config::set_stack_trace_len(4096);
        assert_eq!(described, "bare");
    }
}
