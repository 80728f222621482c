//! Session-based elapsed-time computation for continuous-duration quests.
//!
//! All functions are pure over (record, now) so callers fully control the
//! clock. Every credited span is capped per tick:
//! a paused job or a clock jump can cost at most one cap's worth of credit,
//! never an instant hour.

use crate::records::SessionRecord;

/// Advance an online player's session by the capped elapsed time since the
/// last tick. Returns the credited delta in milliseconds.
pub fn tick_online(session: &mut SessionRecord, now_ms: i64, cap_ms: i64) -> i64 {
    let anchor = if session.last_update > 0 {
        session.last_update
    } else {
        session.start_time.unwrap_or(now_ms)
    };
    let delta = (now_ms - anchor).clamp(0, cap_ms.max(0));
    if session.start_time.is_some() {
        session.total_time += delta;
    }
    session.last_update = now_ms;
    if session.start_time.is_some() {
        delta
    } else {
        0
    }
}

/// Player came online: anchor a fresh running span without touching the
/// accumulated total.
pub fn mark_online(session: &mut SessionRecord, now_ms: i64) {
    if session.start_time.is_none() {
        session.start_time = Some(now_ms);
        session.last_update = now_ms;
    }
}

/// Player went offline: fold the capped running span into the total and
/// clear the anchor so absent ticks credit nothing.
pub fn mark_offline(session: &mut SessionRecord, now_ms: i64, cap_ms: i64) {
    if session.start_time.is_some() {
        let delta = (now_ms - session.last_update).clamp(0, cap_ms.max(0));
        session.total_time += delta;
        session.start_time = None;
    }
    session.last_update = now_ms;
}

/// A qualifying reset event (death) zeroes the session and restarts the
/// anchor from now.
pub fn restart(session: &mut SessionRecord, now_ms: i64) {
    session.start_time = Some(now_ms);
    session.total_time = 0;
    session.last_update = now_ms;
}

/// Deathless ("survive without dying") progress in milliseconds.
///
/// The anchor is time since the last qualifying reset event, clamped so
/// nothing before the player's daily-reset stamp ever counts: an old
/// un-reset anchor must not instantly complete a freshly rotated quest.
pub fn deathless_progress(session: &SessionRecord, reset_stamp_ms: i64, now_ms: i64) -> i64 {
    let start = session.start_time.unwrap_or(0).max(0);
    let effective_start = start.max(reset_stamp_ms);
    let running = if effective_start > 0 {
        (now_ms - effective_start).max(0)
    } else {
        0
    };
    if reset_stamp_ms > 0 {
        // Post-reset: only the running span since the stamp is trustworthy;
        // the accumulated total may predate the rotation.
        running
    } else {
        session.total_time.max(0) + running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: i64 = 300_000;

    #[test]
    fn test_tick_caps_delta() {
        // Scenario C: 400s elapsed against a 300s cap credits exactly 300s.
        let mut s = SessionRecord {
            start_time: Some(1_000_000),
            total_time: 0,
            last_update: 1_000_000,
        };
        let credited = tick_online(&mut s, 1_000_000 + 400_000, CAP);
        assert_eq!(credited, 300_000);
        assert_eq!(s.total_time, 300_000);
        assert_eq!(s.last_update, 1_400_000);
    }

    #[test]
    fn test_tick_normal_delta() {
        let mut s = SessionRecord {
            start_time: Some(0),
            total_time: 60_000,
            last_update: 60_000,
        };
        tick_online(&mut s, 120_000, CAP);
        assert_eq!(s.total_time, 120_000);
    }

    #[test]
    fn test_tick_ignores_clock_regression() {
        let mut s = SessionRecord {
            start_time: Some(0),
            total_time: 50_000,
            last_update: 100_000,
        };
        tick_online(&mut s, 90_000, CAP);
        assert_eq!(s.total_time, 50_000, "negative delta credits nothing");
        assert_eq!(s.last_update, 90_000);
    }

    #[test]
    fn test_offline_session_accrues_nothing() {
        let mut s = SessionRecord {
            start_time: None,
            total_time: 70_000,
            last_update: 100_000,
        };
        let credited = tick_online(&mut s, 200_000, CAP);
        assert_eq!(credited, 0);
        assert_eq!(s.total_time, 70_000);
    }

    #[test]
    fn test_online_offline_cycle() {
        let mut s = SessionRecord::started(0);
        tick_online(&mut s, 100_000, CAP);
        mark_offline(&mut s, 150_000, CAP);
        assert_eq!(s.total_time, 150_000);
        assert!(s.start_time.is_none());

        // Time passes while offline; reconnect then tick.
        mark_online(&mut s, 500_000);
        tick_online(&mut s, 560_000, CAP);
        assert_eq!(s.total_time, 210_000);
    }

    #[test]
    fn test_mark_online_is_idempotent() {
        let mut s = SessionRecord::started(100);
        mark_online(&mut s, 900);
        assert_eq!(s.start_time, Some(100));
    }

    #[test]
    fn test_restart_zeroes_everything() {
        let mut s = SessionRecord {
            start_time: Some(0),
            total_time: 500_000,
            last_update: 500_000,
        };
        restart(&mut s, 600_000);
        assert_eq!(s.total_time, 0);
        assert_eq!(s.start_time, Some(600_000));
    }

    #[test]
    fn test_deathless_clamps_to_reset_stamp() {
        // Anchor predates the daily reset; only post-reset time counts.
        let s = SessionRecord {
            start_time: Some(1_000),
            total_time: 10_000_000,
            last_update: 1_000,
        };
        let progress = deathless_progress(&s, 5_000_000, 5_060_000);
        assert_eq!(progress, 60_000);
    }

    #[test]
    fn test_deathless_without_stamp_uses_total_plus_running() {
        let s = SessionRecord {
            start_time: Some(100_000),
            total_time: 40_000,
            last_update: 100_000,
        };
        assert_eq!(deathless_progress(&s, 0, 160_000), 100_000);
    }

    #[test]
    fn test_deathless_no_anchor_no_stamp() {
        let s = SessionRecord {
            start_time: None,
            total_time: 30_000,
            last_update: 0,
        };
        assert_eq!(deathless_progress(&s, 0, 999_999), 30_000);
    }
}
