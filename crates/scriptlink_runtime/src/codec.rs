//! Scoped Event Names
//!
//! Every script process shares the same transport, so wire-level event names
//! carry the id of the process they belong to: `<event>@<process id>`.

/// Token separating the event name from the process id.
pub const SEPARATOR: char = '@';

// ─────────────────────────────────────────────────────────────────────────────
// Codec Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised when an event name cannot be scoped or unscoped
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid event name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Malformed scoped event name: '{0}'")]
    MalformedName(String),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

// ─────────────────────────────────────────────────────────────────────────────
// Scope / Unscope
// ─────────────────────────────────────────────────────────────────────────────

/// Check that a local event name can be scoped.
pub fn validate_event_name(event_name: &str) -> CodecResult<()> {
    if event_name.is_empty() {
        return Err(CodecError::InvalidName {
            name: event_name.to_string(),
            reason: "event name is empty",
        });
    }
    if event_name.contains(SEPARATOR) {
        return Err(CodecError::InvalidName {
            name: event_name.to_string(),
            reason: "event name contains the scope separator",
        });
    }
    Ok(())
}

/// Append the process id to an event name.
pub fn scope(event_name: &str, process_id: impl Into<i64>) -> CodecResult<String> {
    let process_id = process_id.into();
    validate_event_name(event_name)?;
    if process_id < 0 {
        return Err(CodecError::InvalidName {
            name: event_name.to_string(),
            reason: "process id is negative",
        });
    }
    Ok(format!("{event_name}{SEPARATOR}{process_id}"))
}

/// Split a scoped name back into `(event name, process id)`.
///
/// Exact inverse of [`scope`]: the name must hold exactly one separator and
/// the suffix must be a plain decimal, non-negative integer.
pub fn unscope(scoped: &str) -> CodecResult<(String, i64)> {
    let malformed = || CodecError::MalformedName(scoped.to_string());

    let (event_name, suffix) = scoped.split_once(SEPARATOR).ok_or_else(malformed)?;
    if event_name.is_empty() || suffix.is_empty() {
        return Err(malformed());
    }
    // Rejects signs, whitespace and a second separator
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let process_id = suffix.parse::<i64>().map_err(|_| malformed())?;

    Ok((event_name.to_string(), process_id))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_appends_process_id() {
        assert_eq!(scope("ping", 7).unwrap(), "ping@7");
        assert_eq!(scope("chat/message", 0).unwrap(), "chat/message@0");
    }

    #[test]
    fn test_unscope_inverts_scope() {
        for (name, pid) in [("ping", 7i64), ("a", 0), ("long.event-name_x", 4_194_304)] {
            let scoped = scope(name, pid).unwrap();
            assert_eq!(unscope(&scoped).unwrap(), (name.to_string(), pid));
        }
    }

    #[test]
    fn test_scope_rejects_separator_in_name() {
        let err = scope("ping@pong", 3).unwrap_err();
        assert!(matches!(err, CodecError::InvalidName { .. }));
    }

    #[test]
    fn test_scope_rejects_negative_process_id() {
        let err = scope("ping", -1).unwrap_err();
        assert!(matches!(err, CodecError::InvalidName { .. }));
    }

    #[test]
    fn test_scope_rejects_empty_name() {
        assert!(scope("", 1).is_err());
    }

    #[test]
    fn test_unscope_rejects_missing_separator() {
        assert_eq!(
            unscope("badname"),
            Err(CodecError::MalformedName("badname".into()))
        );
    }

    #[test]
    fn test_unscope_rejects_non_numeric_suffix() {
        assert!(matches!(unscope("ping@x"), Err(CodecError::MalformedName(_))));
        assert!(matches!(unscope("ping@-3"), Err(CodecError::MalformedName(_))));
        assert!(matches!(unscope("ping@+3"), Err(CodecError::MalformedName(_))));
        assert!(matches!(unscope("ping@"), Err(CodecError::MalformedName(_))));
        assert!(matches!(unscope("@4"), Err(CodecError::MalformedName(_))));
        assert!(matches!(unscope("a@b@4"), Err(CodecError::MalformedName(_))));
    }
}
