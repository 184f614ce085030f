/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// First operation ever seen for this session.
    Fresh,
    Active,
    /// Idle past the resume window; the caller must wipe session state.
    Expired { idle_ms: i64 },
}

/// Inactivity tracking for one session. Checked lazily on each operation;
/// nothing advances while a session receives no traffic.
#[derive(Debug, Clone)]
pub struct SessionLifecycle {
    last_activity: Option<i64>,
    resume_window_ms: i64,
}

impl SessionLifecycle {
    pub fn new(resume_window_ms: i64, last_activity: Option<i64>) -> Self {
        Self {
            last_activity,
            resume_window_ms: resume_window_ms.max(0),
        }
    }

    pub fn last_activity(&self) -> Option<i64> {
        self.last_activity
    }

    /// Classifies the session at `now`. `Fresh` and `Expired` both reset
    /// `last_activity` to `now`; `Active` leaves it for [`Self::touch`].
    pub fn check(&mut self, now: i64) -> Lifecycle {
        match self.last_activity {
            None => {
                self.last_activity = Some(now);
                Lifecycle::Fresh
            }
            Some(at) => {
                let idle_ms = now.saturating_sub(at);
                if idle_ms > self.resume_window_ms {
                    self.last_activity = Some(now);
                    Lifecycle::Expired { idle_ms }
                } else {
                    Lifecycle::Active
                }
            }
        }
    }

    /// Same classification as [`Self::check`] without recording anything;
    /// read-only callers use it to decide whether an expiry must be applied.
    pub fn peek(&self, now: i64) -> Lifecycle {
        match self.last_activity {
            None => Lifecycle::Fresh,
            Some(at) => {
                let idle_ms = now.saturating_sub(at);
                if idle_ms > self.resume_window_ms {
                    Lifecycle::Expired { idle_ms }
                } else {
                    Lifecycle::Active
                }
            }
        }
    }

    /// Returns whether the stored value changed.
    pub fn touch(&mut self, now: i64) -> bool {
        if self.last_activity == Some(now) {
            return false;
        }
        self.last_activity = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = 12 * 60 * 1000;

    #[test]
    fn first_touch_is_fresh() {
        let mut lc = SessionLifecycle::new(WINDOW, None);
        assert_eq!(lc.check(100), Lifecycle::Fresh);
        assert_eq!(lc.last_activity(), Some(100));
        assert_eq!(lc.check(200), Lifecycle::Active);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let mut lc = SessionLifecycle::new(WINDOW, Some(0));
        assert_eq!(lc.check(WINDOW), Lifecycle::Active);
        assert_eq!(lc.last_activity(), Some(0));
        assert_eq!(lc.check(WINDOW + 1), Lifecycle::Expired { idle_ms: WINDOW + 1 });
        assert_eq!(lc.last_activity(), Some(WINDOW + 1));
    }

    #[test]
    fn touch_extends_the_window() {
        let mut lc = SessionLifecycle::new(WINDOW, Some(0));
        assert!(lc.touch(WINDOW));
        assert!(!lc.touch(WINDOW));
        assert_eq!(lc.check(2 * WINDOW), Lifecycle::Active);
    }

    #[test]
    fn peek_does_not_record() {
        let lc = SessionLifecycle::new(WINDOW, None);
        assert_eq!(lc.peek(5), Lifecycle::Fresh);
        assert_eq!(lc.last_activity(), None);
        let lc = SessionLifecycle::new(WINDOW, Some(0));
        assert!(matches!(lc.peek(WINDOW + 10), Lifecycle::Expired { .. }));
        assert_eq!(lc.last_activity(), Some(0));
    }
}
