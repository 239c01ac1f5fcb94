//! Status-marker detection for builder output.
//!
//! The last non-empty line of the output (after trimming) must be one of the
//! markers below. A marker anywhere else is reported as malformed.

/// Builder finished the phase.
pub const COMPLETE_MARKER: &str = "<status>COMPLETE</status>";

/// Builder ran out of output budget and asks for a larger one.
pub const TOKEN_ESCALATION_MARKER: &str = "<status>TOKEN_ESCALATION</status>";

/// Signal extracted from builder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderSignal {
    Complete,
    TokenEscalation,
    /// No trailing marker.
    None,
}

/// Result of marker detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerResult {
    pub signal: BuilderSignal,
    /// A marker appeared in the output but not as the trailing line.
    pub is_malformed: bool,
}

/// Detect the trailing status marker in builder output.
///
/// ```
/// use phase_core::completion::{detect_marker, BuilderSignal};
///
/// let result = detect_marker("Done.\n<status>COMPLETE</status>\n");
/// assert_eq!(result.signal, BuilderSignal::Complete);
///
/// let result = detect_marker("<status>COMPLETE</status> but more to do");
/// assert_eq!(result.signal, BuilderSignal::None);
/// assert!(result.is_malformed);
/// ```
pub fn detect_marker(output: &str) -> MarkerResult {
    let last_line = output
        .lines()
        .rfind(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim();

    let signal = match last_line {
        COMPLETE_MARKER => BuilderSignal::Complete,
        TOKEN_ESCALATION_MARKER => BuilderSignal::TokenEscalation,
        _ => BuilderSignal::None,
    };

    let marker_found =
        output.contains(COMPLETE_MARKER) || output.contains(TOKEN_ESCALATION_MARKER);

    MarkerResult {
        signal,
        is_malformed: marker_found && signal == BuilderSignal::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_complete_marker() {
        let result = detect_marker("Implemented the handler.\n  <status>COMPLETE</status>  \n\n");
        assert_eq!(result.signal, BuilderSignal::Complete);
        assert!(!result.is_malformed);
    }

    #[test]
    fn trailing_token_escalation_marker() {
        let result = detect_marker("partial diff...\n<status>TOKEN_ESCALATION</status>");
        assert_eq!(result.signal, BuilderSignal::TokenEscalation);
    }

    #[test]
    fn marker_not_last_is_malformed() {
        let result = detect_marker("<status>COMPLETE</status>\nactually, one more thing");
        assert_eq!(result.signal, BuilderSignal::None);
        assert!(result.is_malformed);
    }

    #[test]
    fn no_marker() {
        for output in ["", "   \n\n ", "finished work"] {
            let result = detect_marker(output);
            assert_eq!(result.signal, BuilderSignal::None);
            assert!(!result.is_malformed);
        }
    }
}
