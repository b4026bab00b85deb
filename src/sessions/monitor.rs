//! Turns watched host variables into [`HostSignal`]s.

use crate::{HostAdapter, HostFlag, HostSignal};

/// Last seen values of the variables that drive phase transitions.
///
/// The monitor is primed with the host's values when the session starts, so only changes
/// after that produce signals.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ChangeMonitor {
    game_mode: u32,
    round_start: u32,
    skippable: u32,
}

impl ChangeMonitor {
    /// Creates a monitor primed with the host's current values.
    pub fn new<S>(host: &dyn HostAdapter<S>) -> Self {
        Self {
            game_mode: host.phase_signal(),
            round_start: host.flag(HostFlag::RoundStart),
            skippable: host.flag(HostFlag::SkippableFlag),
        }
    }

    /// Last seen game mode.
    #[must_use]
    pub fn game_mode(&self) -> u32 {
        self.game_mode
    }

    /// Samples the host and returns the changes, game mode first.
    pub fn check<S>(&mut self, host: &dyn HostAdapter<S>) -> Vec<HostSignal> {
        let mut signals = Vec::new();

        let game_mode = host.phase_signal();
        if game_mode != self.game_mode {
            signals.push(HostSignal::GameModeChanged {
                previous: self.game_mode,
                current: game_mode,
            });
            self.game_mode = game_mode;
        }

        let round_start = host.flag(HostFlag::RoundStart);
        if round_start != self.round_start {
            signals.push(HostSignal::RoundStarted);
            self.round_start = round_start;
        }

        let skippable = host.flag(HostFlag::SkippableFlag);
        if skippable != self.skippable {
            signals.push(HostSignal::SkippableChanged {
                previous: self.skippable,
                current: skippable,
            });
            self.skippable = skippable;
        }

        signals
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::{InputBits, PlayerNumber};

    #[derive(Default)]
    struct Flags {
        mode: u32,
        round_start: u32,
        skippable: u32,
    }

    impl HostAdapter<()> for Flags {
        fn phase_signal(&self) -> u32 {
            self.mode
        }

        fn flag(&self, flag: HostFlag) -> u32 {
            match flag {
                HostFlag::RoundStart => self.round_start,
                HostFlag::SkippableFlag => self.skippable,
                _ => 0,
            }
        }

        fn write_input(&mut self, _player: PlayerNumber, _bits: InputBits) {}

        fn capture_snapshot(&mut self) {}

        fn restore_snapshot(&mut self, _snapshot: &()) {}

        fn read_rng(&self) -> Vec<u8> {
            Vec::new()
        }

        fn write_rng(&mut self, _state: &[u8]) {}
    }

    #[test]
    fn primed_monitor_is_silent() {
        let host = Flags {
            mode: 2,
            ..Flags::default()
        };
        let mut monitor = ChangeMonitor::new::<()>(&host);
        assert!(monitor.check::<()>(&host).is_empty());
        assert_eq!(monitor.game_mode(), 2);
    }

    #[test]
    fn changes_are_reported_once_in_order() {
        let mut host = Flags::default();
        let mut monitor = ChangeMonitor::new::<()>(&host);
        host.mode = 20;
        host.skippable = 1;
        host.round_start = 1;
        let signals = monitor.check::<()>(&host);
        assert_eq!(
            signals,
            vec![
                HostSignal::GameModeChanged {
                    previous: 0,
                    current: 20
                },
                HostSignal::RoundStarted,
                HostSignal::SkippableChanged {
                    previous: 0,
                    current: 1
                },
            ]
        );
        assert!(monitor.check::<()>(&host).is_empty());
    }
}
