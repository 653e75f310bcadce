//! Blocking signal primitives for the buffer pool and the data channels.
//!
//! Both types pair their counter with a condition variable under one lock,
//! so a notify between "check" and "sleep" cannot be lost.

use parking_lot::{Condvar, Mutex};

// ── Waiter ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct WaiterState {
    pending: usize,
    armed: bool,
    stopped: bool,
}

/// Single-slot armable countdown.
///
/// `arm(n)` expects `n` notifications; `wait()` returns once they have all
/// arrived. Notifications while unarmed are dropped, so a late or duplicate
/// notify cannot release the next wait early.
#[derive(Debug, Default)]
pub struct Waiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, n: usize) {
        let mut s = self.state.lock();
        s.pending = n;
        s.armed = n > 0;
    }

    /// Returns `false` if the notification was ignored.
    pub fn notify(&self) -> bool {
        let mut s = self.state.lock();
        if !s.armed {
            return false;
        }
        s.pending -= 1;
        if s.pending == 0 {
            s.armed = false;
            self.cond.notify_all();
        }
        true
    }

    /// Block until the armed count reaches zero. `false` means stopped.
    pub fn wait(&self) -> bool {
        let mut s = self.state.lock();
        while s.armed && !s.stopped {
            self.cond.wait(&mut s);
        }
        !s.stopped
    }

    pub fn stop(&self) {
        let mut s = self.state.lock();
        s.stopped = true;
        self.cond.notify_all();
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }
}

// ── Credit Gate ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateState {
    credits: usize,
    stopped: bool,
}

/// Counting semaphore for receive admission.
///
/// Consumers `grant()` a credit when they start waiting for a buffer; the
/// transport `acquire()`s one before materializing each inbound buffer.
#[derive(Debug, Default)]
pub struct CreditGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl CreditGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self) {
        let mut s = self.state.lock();
        s.credits += 1;
        self.cond.notify_one();
    }

    /// Block until a credit is available and take it. `false` means stopped.
    pub fn acquire(&self) -> bool {
        let mut s = self.state.lock();
        while s.credits == 0 && !s.stopped {
            self.cond.wait(&mut s);
        }
        if s.stopped {
            return false;
        }
        s.credits -= 1;
        true
    }

    pub fn credits(&self) -> usize {
        self.state.lock().credits
    }

    pub fn stop(&self) {
        let mut s = self.state.lock();
        s.stopped = true;
        self.cond.notify_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn stray_notify_is_ignored() {
        let w = Waiter::new();
        assert!(!w.notify());
        w.arm(1);
        assert!(w.is_armed());
        assert!(w.notify());
        assert!(!w.is_armed());
        assert!(!w.notify());
        assert!(w.wait());
    }

    #[test]
    fn wait_blocks_until_count_reached() {
        let w = Arc::new(Waiter::new());
        w.arm(2);
        let handle = {
            let w = w.clone();
            thread::spawn(move || w.wait())
        };
        w.notify();
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        w.notify();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn stop_releases_waiter() {
        let w = Arc::new(Waiter::new());
        w.arm(1);
        let handle = {
            let w = w.clone();
            thread::spawn(move || w.wait())
        };
        thread::sleep(Duration::from_millis(10));
        w.stop();
        w.stop();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn gate_counts_credits() {
        let gate = Arc::new(CreditGate::new());
        gate.grant();
        gate.grant();
        assert!(gate.acquire());
        assert_eq!(gate.credits(), 1);

        assert!(gate.acquire());
        let handle = {
            let gate = gate.clone();
            thread::spawn(move || gate.acquire())
        };
        thread::sleep(Duration::from_millis(10));
        gate.grant();
        assert!(handle.join().unwrap());

        gate.stop();
        assert!(!gate.acquire());
    }
}
