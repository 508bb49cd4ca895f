use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU32, Ordering};

/// Bit set describing where a future is in its lifecycle.
///
/// Several flags may be set at once: a future can be `CANCELED | FINISHED`,
/// or `RUNNING | SUSPENDING`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct State(u32);

impl State {
    pub const NO_STATE: State = State(0x00);
    pub const RUNNING: State = State(0x01);
    pub const STARTED: State = State(0x02);
    pub const FINISHED: State = State(0x04);
    pub const CANCELED: State = State(0x08);
    pub const SUSPENDING: State = State(0x10);
    pub const SUSPENDED: State = State(0x20);
    pub const THROTTLED: State = State(0x40);
    /// Waiting on an upstream future (continuations before their parent resolves).
    pub const PENDING: State = State(0x80);

    const NAMES: [(State, &'static str); 8] = [
        (State::RUNNING, "Running"),
        (State::STARTED, "Started"),
        (State::FINISHED, "Finished"),
        (State::CANCELED, "Canceled"),
        (State::SUSPENDING, "Suspending"),
        (State::SUSPENDED, "Suspended"),
        (State::THROTTLED, "Throttled"),
        (State::PENDING, "Pending"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        State(bits)
    }

    /// True if any flag of `other` is set.
    pub const fn intersects(self, other: State) -> bool {
        self.0 & other.0 != 0
    }

    /// True if every flag of `other` is set.
    pub const fn contains(self, other: State) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for State {
    type Output = State;
    fn bitor(self, rhs: State) -> State {
        State(self.0 | rhs.0)
    }
}

impl BitOrAssign for State {
    fn bitor_assign(&mut self, rhs: State) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for State {
    type Output = State;
    fn bitand(self, rhs: State) -> State {
        State(self.0 & rhs.0)
    }
}

impl Not for State {
    type Output = State;
    fn not(self) -> State {
        State(!self.0)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NoState");
        }
        let mut first = true;
        for (flag, name) in State::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// How far `cancel` goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Set `Canceled` only; the producer still winds down and finishes.
    #[default]
    CancelOnly,
    /// Set `Canceled` and force `Finished` right away.
    CancelAndFinish,
}

/// The flag word shared by all handles.
///
/// Every write is a single full-word atomic operation, so lock-free readers
/// may see a value that is one transition stale but never a torn one.
#[derive(Default)]
pub(crate) struct AtomicState(AtomicU32);

impl AtomicState {
    pub(crate) fn new(state: State) -> Self {
        Self(AtomicU32::new(state.bits()))
    }

    pub(crate) fn load(&self) -> State {
        State(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn switch_on(&self, flags: State) -> State {
        State(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    pub(crate) fn switch_off(&self, flags: State) -> State {
        State(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Clears `from` and sets `to` in one store.
    pub(crate) fn switch_from_to(&self, from: State, to: State) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (current & !from.bits()) | to.bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}
