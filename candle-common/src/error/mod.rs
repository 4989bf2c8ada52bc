//! Error classification for the feed reconnect loops.
//!
//! Every exchange feed runs a dial-read-redial loop, and the loop needs one
//! answer from each failure: dial again now, hold off because the venue is
//! throttling, or stop and surface the problem. [`ErrorClassification`]
//! puts that answer on the error type itself, so the loops stay generic
//! over which venue produced the failure.

use std::time::Duration;

/// What a failure means for the caller's next move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The connection will likely come back: dropped sockets, failed
    /// dials, request timeouts
    Transient,
    /// The venue is throttling us; another attempt is fine, but only after
    /// sitting out well past an ordinary reconnect delay
    RateLimited,
    /// Another attempt changes nothing: malformed frames, rejected
    /// requests
    Permanent,
    /// The problem is on our side of the wire (unknown symbol, unsupported
    /// interval); wants an operator, not a retry loop
    Configuration,
}

/// Trait for errors that can steer a retry decision.
pub trait ErrorClassification {
    /// What this failure means for the caller's next move.
    fn category(&self) -> ErrorCategory;

    /// Whether another attempt may succeed without anyone intervening.
    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::RateLimited
        )
    }

    /// Whether further attempts are pointless.
    fn is_permanent(&self) -> bool {
        matches!(self.category(), ErrorCategory::Permanent)
    }

    /// How long to sit out before the next attempt. Defaults follow the
    /// feed reconnect schedule: a transient failure re-dials after the
    /// first backoff step (1s), throttling waits out a rate-limit window
    /// (10s) before touching the venue again.
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_secs(1)),
            ErrorCategory::RateLimited => Some(Duration::from_secs(10)),
            ErrorCategory::Permanent | ErrorCategory::Configuration => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(ErrorCategory);

    impl ErrorClassification for Probe {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    #[test]
    fn test_transient_redials_after_first_backoff_step() {
        let err = Probe(ErrorCategory::Transient);
        assert!(err.is_transient());
        assert!(!err.is_permanent());
        assert_eq!(err.suggested_retry_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_rate_limited_sits_out_longer_than_a_reconnect() {
        let throttled = Probe(ErrorCategory::RateLimited);
        let dropped = Probe(ErrorCategory::Transient);
        assert!(throttled.is_transient());
        assert!(
            throttled.suggested_retry_delay().unwrap() > dropped.suggested_retry_delay().unwrap()
        );
    }

    #[test]
    fn test_permanent_and_configuration_never_retry() {
        let bad_frame = Probe(ErrorCategory::Permanent);
        assert!(!bad_frame.is_transient());
        assert!(bad_frame.is_permanent());
        assert!(bad_frame.suggested_retry_delay().is_none());

        let bad_symbol = Probe(ErrorCategory::Configuration);
        assert!(!bad_symbol.is_transient());
        assert!(!bad_symbol.is_permanent());
        assert!(bad_symbol.suggested_retry_delay().is_none());
    }
}
