use std::{
    fmt::Display,
    ops::{BitAnd, BitOr, Not},
    time::Duration,
};

use log::trace;

use super::socket::Descriptor;

/// Read/write readiness bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Readiness(u8);

impl Readiness {
    pub const NONE: Readiness = Readiness(0);
    pub const READ: Readiness = Readiness(0x01);
    pub const WRITE: Readiness = Readiness(0x02);
    pub const BOTH: Readiness = Readiness(0x03);

    pub fn contains(&self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Self) -> Self::Output {
        Readiness(self.0 | rhs.0)
    }
}

impl BitAnd for Readiness {
    type Output = Readiness;

    fn bitand(self, rhs: Self) -> Self::Output {
        Readiness(self.0 & rhs.0)
    }
}

impl Not for Readiness {
    type Output = Readiness;

    fn not(self) -> Self::Output {
        Readiness(!self.0 & Readiness::BOTH.0)
    }
}

impl Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match (self.contains(Readiness::READ), self.contains(Readiness::WRITE)) {
            (true, true) => "rw",
            (true, false) => "r",
            (false, true) => "w",
            (false, false) => "-",
        };
        f.write_str(s)
    }
}

/// Receiver of notification scheduling requests.
///
/// The scheduler context implements this; tests record the calls.
pub trait NotifySink {
    /// Queues a notification event for a socket.
    ///
    /// # Arguments
    /// * `fd` - Descriptor the event fires for
    /// * `delay` - Time from now until the event fires
    fn schedule_notify(&mut self, fd: Descriptor, delay: Duration);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Active,
    Inactive,
}

const NOTIFY_SCHEDULED: u8 = 0x01;
const POLL_SCHEDULED: u8 = 0x02;
const EXECUTING: u8 = 0x04;

/// Per-socket readiness state.
///
/// At most one notification event is outstanding at any time. The
/// notifier never touches the scheduler itself beyond asking the sink to
/// schedule; executing a notification is split into
/// [`begin_notification`](Notifier::begin_notification), which yields the
/// readiness kinds to deliver in priority order, and
/// [`finish_notification`](Notifier::finish_notification), which re-arms.
pub struct Notifier {
    fd: Descriptor,
    available: Readiness,
    polling: Readiness,
    read_interest: u32,
    write_interest: u32,
    activity: Activity,
    flags: u8,
    write_first: bool,
    rearm: Duration,
}

impl Notifier {
    /// Creates a notifier with nothing available and no interest.
    ///
    /// # Arguments
    /// * `fd` - Descriptor of the owning socket
    /// * `activity` - Whether notifications may fire yet
    /// * `rearm` - Delay before a notification re-fires while interest remains
    pub fn new(fd: Descriptor, activity: Activity, rearm: Duration) -> Self {
        Self {
            fd,
            available: Readiness::NONE,
            polling: Readiness::NONE,
            read_interest: 0,
            write_interest: 0,
            activity,
            flags: 0,
            write_first: false,
            rearm,
        }
    }

    pub fn available(&self) -> Readiness {
        self.available
    }

    pub fn polling(&self) -> Readiness {
        self.polling
    }

    pub fn is_active(&self) -> bool {
        self.activity == Activity::Active
    }

    pub fn is_notify_scheduled(&self) -> bool {
        self.flags & NOTIFY_SCHEDULED != 0
    }

    pub fn is_executing(&self) -> bool {
        self.flags & EXECUTING != 0
    }

    fn interest(&self) -> Readiness {
        let mut interest = Readiness::NONE;
        if self.read_interest > 0 {
            interest = interest | Readiness::READ;
        }
        if self.write_interest > 0 {
            interest = interest | Readiness::WRITE;
        }
        interest
    }

    fn wanted(&self) -> Readiness {
        self.polling | self.interest()
    }

    fn try_schedule(&mut self, wanted: Readiness, delay: Duration, sink: &mut dyn NotifySink) {
        if !self.is_active()
            || self.flags & (NOTIFY_SCHEDULED | EXECUTING) != 0
            || (self.available & wanted).is_empty()
        {
            return;
        }
        self.flags |= NOTIFY_SCHEDULED;
        trace!("fd {}: notification scheduled ({})", self.fd, self.available);
        sink.schedule_notify(self.fd, delay);
    }

    /// Makes `kind` available and schedules a notification if anyone waits
    /// on it and none is outstanding.
    ///
    /// # Arguments
    /// * `kind` - Readiness that became available
    /// * `sink` - Receives the scheduling request
    pub fn mark_available(&mut self, kind: Readiness, sink: &mut dyn NotifySink) {
        self.available = self.available | kind;
        self.try_schedule(self.wanted(), Duration::ZERO, sink);
    }

    pub fn mark_unavailable(&mut self, kind: Readiness) {
        self.available = self.available & !kind;
    }

    /// Sets the availability of `kind` to exactly `ready`.
    pub fn set_available(&mut self, kind: Readiness, ready: bool, sink: &mut dyn NotifySink) {
        if ready {
            self.mark_available(kind, sink);
        } else {
            self.mark_unavailable(kind);
        }
    }

    pub fn mark_active(&mut self, sink: &mut dyn NotifySink) {
        self.activity = Activity::Active;
        self.try_schedule(self.wanted(), Duration::ZERO, sink);
    }

    pub fn mark_inactive(&mut self) {
        self.activity = Activity::Inactive;
    }

    /// Replaces the mask an interested party waits on.
    ///
    /// # Arguments
    /// * `mask` - Readiness kinds the poller wants
    /// * `sink` - Receives the scheduling request if `mask` is already met
    pub fn set_polling(&mut self, mask: Readiness, sink: &mut dyn NotifySink) {
        self.polling = mask;
        self.try_schedule(self.wanted(), Duration::ZERO, sink);
    }

    /// Registers one more listener for `kind`. Interest is counted, so
    /// every call needs a matching [`remove_interest`](Self::remove_interest).
    ///
    /// # Arguments
    /// * `kind` - Readiness kinds the listener waits on
    /// * `sink` - Receives the scheduling request if `kind` is available
    pub fn add_interest(&mut self, kind: Readiness, sink: &mut dyn NotifySink) {
        if kind.contains(Readiness::READ) {
            self.read_interest += 1;
        }
        if kind.contains(Readiness::WRITE) {
            self.write_interest += 1;
        }
        self.try_schedule(self.wanted(), Duration::ZERO, sink);
    }

    pub fn remove_interest(&mut self, kind: Readiness) {
        if kind.contains(Readiness::READ) {
            self.read_interest = self.read_interest.saturating_sub(1);
        }
        if kind.contains(Readiness::WRITE) {
            self.write_interest = self.write_interest.saturating_sub(1);
        }
    }

    /// Starts executing a popped notification event.
    ///
    /// Clears the scheduled flag and returns the readiness kinds to
    /// deliver, alternating which direction goes first on every firing.
    /// Inactive notifiers return nothing.
    pub fn begin_notification(&mut self) -> Vec<Readiness> {
        self.flags &= !NOTIFY_SCHEDULED;
        if !self.is_active() {
            return Vec::new();
        }
        self.flags |= EXECUTING;

        let ready = self.available & self.wanted();
        let order = if self.write_first {
            [Readiness::WRITE, Readiness::READ]
        } else {
            [Readiness::READ, Readiness::WRITE]
        };
        self.write_first = !self.write_first;

        order.into_iter().filter(|kind| ready.contains(*kind)).collect()
    }

    /// Ends a notification and re-arms while interest and availability remain.
    ///
    /// Only counted interest re-arms; a one-shot polling mask does not.
    ///
    /// # Arguments
    /// * `sink` - Receives the re-arm request, delayed by the rearm interval
    pub fn finish_notification(&mut self, sink: &mut dyn NotifySink) {
        self.flags &= !EXECUTING;
        let rearm = self.rearm;
        self.try_schedule(self.interest(), rearm, sink);
    }

    /// Claims the poll chain; false if a tick is already pending.
    pub fn try_schedule_poll(&mut self) -> bool {
        if self.flags & POLL_SCHEDULED != 0 {
            return false;
        }
        self.flags |= POLL_SCHEDULED;
        true
    }

    pub fn poll_fired(&mut self) {
        self.flags &= !POLL_SCHEDULED;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) scheduled: Vec<(Descriptor, Duration)>,
    }

    impl NotifySink for RecordingSink {
        fn schedule_notify(&mut self, fd: Descriptor, delay: Duration) {
            self.scheduled.push((fd, delay));
        }
    }

    fn notifier() -> Notifier {
        Notifier::new(5, Activity::Active, Duration::from_millis(1))
    }

    #[test]
    fn test_at_most_one_notification() {
        let mut sink = RecordingSink::default();
        let mut n = notifier();
        n.set_polling(Readiness::BOTH, &mut sink);
        assert!(sink.scheduled.is_empty());

        n.mark_available(Readiness::READ, &mut sink);
        n.mark_available(Readiness::WRITE, &mut sink);
        n.mark_available(Readiness::READ, &mut sink);
        assert_eq!(sink.scheduled, vec![(5, Duration::ZERO)]);
        assert!(n.is_notify_scheduled());

        let kinds = n.begin_notification();
        assert!(!n.is_notify_scheduled());
        assert_eq!(kinds, vec![Readiness::READ, Readiness::WRITE]);

        // scheduling is suppressed while executing
        n.mark_available(Readiness::READ, &mut sink);
        assert_eq!(sink.scheduled.len(), 1);
        n.finish_notification(&mut sink);
        // no counted interest, so no re-arm
        assert_eq!(sink.scheduled.len(), 1);
    }

    #[test]
    fn test_alternating_priority() {
        let mut sink = RecordingSink::default();
        let mut n = notifier();
        n.set_polling(Readiness::BOTH, &mut sink);
        n.mark_available(Readiness::BOTH, &mut sink);

        let first = n.begin_notification();
        n.finish_notification(&mut sink);
        let second = n.begin_notification();
        n.finish_notification(&mut sink);
        let third = n.begin_notification();

        assert_eq!(first, vec![Readiness::READ, Readiness::WRITE]);
        assert_eq!(second, vec![Readiness::WRITE, Readiness::READ]);
        assert_eq!(third, first);
    }

    #[test]
    fn test_rearm_with_interest() {
        let mut sink = RecordingSink::default();
        let mut n = notifier();
        n.add_interest(Readiness::READ, &mut sink);
        n.mark_available(Readiness::READ, &mut sink);
        assert_eq!(sink.scheduled.len(), 1);

        assert_eq!(n.begin_notification(), vec![Readiness::READ]);
        n.finish_notification(&mut sink);
        assert_eq!(sink.scheduled[1], (5, Duration::from_millis(1)));

        n.begin_notification();
        n.mark_unavailable(Readiness::READ);
        n.finish_notification(&mut sink);
        assert_eq!(sink.scheduled.len(), 2);

        n.remove_interest(Readiness::READ);
        n.mark_available(Readiness::READ, &mut sink);
        assert_eq!(sink.scheduled.len(), 2);
    }

    #[test]
    fn test_inactive_never_notifies() {
        let mut sink = RecordingSink::default();
        let mut n = Notifier::new(9, Activity::Inactive, Duration::ZERO);
        n.set_polling(Readiness::READ, &mut sink);
        n.mark_available(Readiness::READ, &mut sink);
        assert!(sink.scheduled.is_empty());
        assert!(n.begin_notification().is_empty());

        n.mark_active(&mut sink);
        assert_eq!(sink.scheduled, vec![(9, Duration::ZERO)]);
    }

    #[test]
    fn test_poll_chain() {
        let mut n = notifier();
        assert!(n.try_schedule_poll());
        assert!(!n.try_schedule_poll());
        n.poll_fired();
        assert!(n.try_schedule_poll());
    }
}
