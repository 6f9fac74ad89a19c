//! Realtime scheduling for process threads
//!
//! Threads created through the backend try to match the scheduling class
//! the server granted its own realtime threads. Failure is non-fatal; the
//! thread simply runs at normal priority.

/// Promote the calling thread to realtime scheduling at `priority`.
///
/// Returns false when the platform refuses (missing privileges) or does not
/// support realtime classes; the caller keeps running either way.
pub fn promote_current_thread(priority: i32) -> bool {
    platform_promote(priority)
}

#[cfg(target_os = "linux")]
fn platform_promote(priority: i32) -> bool {
    use libc::{sched_param, sched_setscheduler, SCHED_FIFO, SCHED_RR};

    let clamped = priority.clamp(1, 99);
    let mut param = sched_param {
        sched_priority: clamped,
    };

    // SCHED_FIFO needs CAP_SYS_NICE; fall back to SCHED_RR before giving up
    if unsafe { sched_setscheduler(0, SCHED_FIFO, &param) } == 0 {
        return true;
    }

    param.sched_priority = clamped.min(70);
    if unsafe { sched_setscheduler(0, SCHED_RR, &param) } == 0 {
        return true;
    }

    tracing::debug!(priority = clamped, "realtime scheduling unavailable for process thread");
    false
}

#[cfg(all(unix, not(target_os = "linux")))]
fn platform_promote(priority: i32) -> bool {
    use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO};

    let mut param: sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority.clamp(1, 63);

    let rc = unsafe { pthread_setschedparam(pthread_self(), SCHED_FIFO, &param) };
    if rc != 0 {
        tracing::debug!(rc, "realtime scheduling unavailable for process thread");
    }
    rc == 0
}

#[cfg(not(unix))]
fn platform_promote(_priority: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_never_panics() {
        // May or may not succeed depending on privileges; both are fine
        let _ = promote_current_thread(80);
    }
}
