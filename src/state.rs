use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The two phases of the server's life.
pub enum State {
    /// Serving: every loop keeps looping.
    Running,
    /// Winding down: every loop should finish its current pass and return.
    Quit,
}

/// A one-way shutdown latch shared by every thread in the server.
///
/// Threads poll it between units of work (one supervisor pass, one poll of
/// the serial line, one client request) and wind down once it reads `Quit`.
/// There is no way back; a server that has begun shutting down stays that
/// way until the process exits.
pub struct Guard {
    quitting: AtomicBool,
}

impl Guard {
    #[must_use]
    /// A latch in the `Running` phase.
    pub fn new() -> Guard {
        Guard {
            quitting: AtomicBool::new(false),
        }
    }

    #[must_use]
    /// Which phase the server is in right now.
    pub fn status(&self) -> State {
        if self.quitting.load(Ordering::Acquire) {
            State::Quit
        } else {
            State::Running
        }
    }

    /// Flip the latch to `Quit`. Returns whether this call did the flipping;
    /// asking again once shutdown is underway is a no-op.
    pub fn quit(&self) -> bool {
        !self.quitting.swap(true, Ordering::AcqRel)
    }
}

impl Default for Guard {
    fn default() -> Guard {
        Guard::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Test that the latch flips exactly once and never comes back.
    fn latch_flips_once() {
        let guard = Guard::new();
        assert_eq!(guard.status(), State::Running);

        assert!(guard.quit());
        assert_eq!(guard.status(), State::Quit);

        assert!(!guard.quit(), "second shutdown request must be a no-op");
        assert_eq!(guard.status(), State::Quit);
    }
}
