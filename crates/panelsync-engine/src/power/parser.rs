/*!
 * Line parsers for the power signal streams.
 */
use super::PowerEvent;

/// Turns one line of subprocess output into at most one event
pub trait LineParser: Send {
    /// Feed the next line
    fn feed(&mut self, line: &str) -> Option<PowerEvent>;
}

/// State of [`SleepSignalParser`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalState {
    /// Waiting for a `PrepareForSleep` signal header
    #[default]
    Idle,
    /// Header seen, waiting for its boolean argument
    Armed,
}

/// Parser for `dbus-monitor` output of the login manager's `PrepareForSleep`
///
/// The signal arrives as a header line followed by the argument on its own
/// line, e.g.
///
/// ```text
/// signal time=1700000000.1 sender=:1.3 -> destination=(null destination) serial=812 path=/org/freedesktop/login1; interface=org.freedesktop.login1.Manager; member=PrepareForSleep
///    boolean true
/// ```
///
/// `true` means the system is about to sleep, `false` that it woke up.
#[derive(Debug, Default)]
pub struct SleepSignalParser {
    state: SignalState,
}

impl SleepSignalParser {
    /// A parser waiting for its first signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> SignalState {
        self.state
    }
}

impl LineParser for SleepSignalParser {
    fn feed(&mut self, line: &str) -> Option<PowerEvent> {
        if line.contains("signal") && line.contains("member=PrepareForSleep") {
            self.state = SignalState::Armed;
            return None;
        }

        if self.state != SignalState::Armed {
            return None;
        }

        let line = line.trim();
        if !line.starts_with("boolean") {
            return None;
        }

        self.state = SignalState::Idle;
        if line.contains("true") {
            Some(PowerEvent::GoingToSuspend)
        } else {
            Some(PowerEvent::ResumedFromSuspend)
        }
    }
}

const SLEEP_STARTED: [&str; 4] = [
    "Starting Suspend...",
    "Starting Hibernate...",
    "Starting Hybrid Suspend...",
    "Starting System Suspend...",
];

const SLEEP_FINISHED: [&str; 4] = [
    "Finished Suspend.",
    "Finished Hibernate.",
    "Finished Hybrid Suspend.",
    "Finished System Suspend.",
];

/// Parser for `journalctl -f` output of the systemd sleep units
#[derive(Debug, Default)]
pub struct JournalLineParser;

impl JournalLineParser {
    /// A new parser
    pub fn new() -> Self {
        Self
    }
}

impl LineParser for JournalLineParser {
    fn feed(&mut self, line: &str) -> Option<PowerEvent> {
        if SLEEP_STARTED.iter().any(|marker| line.contains(marker)) {
            Some(PowerEvent::GoingToSuspend)
        } else if SLEEP_FINISHED.iter().any(|marker| line.contains(marker)) {
            Some(PowerEvent::ResumedFromSuspend)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "signal time=1700000000.123 sender=:1.3 -> destination=(null destination) serial=812 path=/org/freedesktop/login1; interface=org.freedesktop.login1.Manager; member=PrepareForSleep";

    fn feed_all(parser: &mut dyn LineParser, lines: &[&str]) -> Vec<PowerEvent> {
        lines.iter().filter_map(|l| parser.feed(l)).collect()
    }

    #[test]
    fn test_suspend_then_resume() {
        let mut parser = SleepSignalParser::new();
        let events = feed_all(
            &mut parser,
            &[HEADER, "   boolean true", HEADER, "   boolean false"],
        );
        assert_eq!(
            events,
            vec![PowerEvent::GoingToSuspend, PowerEvent::ResumedFromSuspend]
        );
        assert_eq!(parser.state(), SignalState::Idle);
    }

    #[test]
    fn test_boolean_without_header_is_ignored() {
        let mut parser = SleepSignalParser::new();
        assert!(feed_all(&mut parser, &["   boolean true", "boolean false"]).is_empty());
    }

    #[test]
    fn test_unrelated_lines_between_header_and_argument() {
        let mut parser = SleepSignalParser::new();
        let events = feed_all(
            &mut parser,
            &[
                HEADER,
                "   string \"org.freedesktop.login1\"",
                "",
                "   boolean true",
                "   boolean true",
            ],
        );
        assert_eq!(events, vec![PowerEvent::GoingToSuspend]);
    }

    #[test]
    fn test_other_signals_do_not_arm() {
        let mut parser = SleepSignalParser::new();
        let events = feed_all(
            &mut parser,
            &[
                "signal time=1.0 sender=org.freedesktop.DBus -> destination=:1.9 serial=2 path=/org/freedesktop/DBus; interface=org.freedesktop.DBus; member=NameAcquired",
                "   boolean true",
                "method call time=1.0 sender=:1.9 -> destination=org.freedesktop.DBus serial=1 path=/org/freedesktop/DBus; interface=org.freedesktop.DBus; member=AddMatch",
                "   string \"interface='org.freedesktop.login1.Manager',member='PrepareForSleep'\"",
            ],
        );
        assert!(events.is_empty());
        assert_eq!(parser.state(), SignalState::Idle);
    }

    #[test]
    fn test_journal_lines() {
        let mut parser = JournalLineParser::new();
        let events = feed_all(
            &mut parser,
            &[
                "Nov 14 22:13:20 host systemd[1]: Starting Suspend...",
                "Nov 14 22:13:20 host systemd-sleep[4242]: Entering sleep state 'suspend'...",
                "Nov 15 07:01:02 host systemd[1]: Finished Suspend.",
                "Nov 15 08:00:00 host systemd[1]: Starting Hibernate...",
                "Nov 15 09:00:00 host systemd[1]: Finished Hybrid Suspend.",
                "Nov 15 10:00:00 host systemd[1]: Starting System Suspend...",
            ],
        );
        assert_eq!(
            events,
            vec![
                PowerEvent::GoingToSuspend,
                PowerEvent::ResumedFromSuspend,
                PowerEvent::GoingToSuspend,
                PowerEvent::ResumedFromSuspend,
                PowerEvent::GoingToSuspend,
            ]
        );
    }
}
