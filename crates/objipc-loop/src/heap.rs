//! The clock heap: an array-backed binary min-heap of armed timer sources
//! ordered by absolute deadline. Each armed source caches its own index, so
//! disarming or rescheduling any element costs O(log n).

use std::rc::Rc;

use nix::sys::time::TimeSpec;

use crate::source::SourceState;

const SHRINK_FLOOR: usize = 16;

pub(crate) struct ClockHeap {
    data: Vec<Rc<SourceState>>,
    /// Number of existing timer sources, armed or not; drives shrinking.
    reserved: usize,
}

impl ClockHeap {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            reserved: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The armed source with the earliest deadline.
    pub(crate) fn peek(&self) -> Option<&Rc<SourceState>> {
        self.data.first()
    }

    /// Track a new timer source (armed later via [`arm`](Self::arm)).
    pub(crate) fn reserve(&mut self) {
        self.reserved += 1;
    }

    /// A timer source went away. Shrink the backing array when utilization
    /// drops below a quarter of capacity, so long-lived loops with bursty
    /// timer counts do not hold peak memory forever.
    pub(crate) fn unreserve(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
        let capacity = self.data.capacity();
        if capacity >= SHRINK_FLOOR && capacity >= 4 * self.reserved {
            self.data.shrink_to(capacity / 2);
        }
    }

    /// Requires the source be disarmed.
    pub(crate) fn arm(&mut self, source: &Rc<SourceState>, deadline: TimeSpec) {
        debug_assert!(!source.timer.is_armed());
        source.timer.deadline.set(deadline);
        source.timer.heap_index.set(self.data.len() as i32);
        self.data.push(source.clone());
        self.sift_up(source);
    }

    /// Requires the source be armed.
    pub(crate) fn disarm(&mut self, source: &Rc<SourceState>) {
        let index = source.timer.heap_index.get();
        debug_assert!(index >= 0);
        source.timer.heap_index.set(-1);
        source.timer.deadline.set(TimeSpec::new(0, 0));

        let Some(last) = self.data.pop() else { return };
        if index as usize == self.data.len() {
            return;
        }

        // Swap the last active element into the vacated slot, then restore
        // heap order; only one of the two sifts moves it.
        last.timer.heap_index.set(index);
        self.data[index as usize] = last.clone();
        self.sift_down(&last);
        self.sift_up(&last);
    }

    /// Reschedule an armed source in place.
    pub(crate) fn reschedule(&mut self, source: &Rc<SourceState>, deadline: TimeSpec) {
        debug_assert!(source.timer.is_armed());
        let earlier = deadline < source.timer.deadline.get();
        source.timer.deadline.set(deadline);
        if earlier {
            self.sift_up(source);
        } else {
            self.sift_down(source);
        }
    }

    /// Pop every source whose deadline is at or before `now`, in deadline
    /// order.
    pub(crate) fn pop_expired(&mut self, now: TimeSpec) -> Vec<Rc<SourceState>> {
        let mut expired = Vec::new();
        while let Some(root) = self.data.first() {
            if now < root.timer.deadline.get() {
                break;
            }
            let root = root.clone();
            self.disarm(&root);
            expired.push(root);
        }
        expired
    }

    fn place(&mut self, source: &Rc<SourceState>, index: usize) {
        source.timer.heap_index.set(index as i32);
        self.data[index] = source.clone();
    }

    fn sift_up(&mut self, source: &Rc<SourceState>) {
        let mut index = source.timer.heap_index.get() as usize;
        let key = source.timer.deadline.get();
        while index > 0 {
            let parent_index = (index - 1) / 2;
            let parent = self.data[parent_index].clone();
            if key < parent.timer.deadline.get() {
                self.place(&parent, index);
                index = parent_index;
            } else {
                break;
            }
        }
        self.place(source, index);
    }

    fn sift_down(&mut self, source: &Rc<SourceState>) {
        let len = self.data.len();
        let mut index = source.timer.heap_index.get() as usize;
        let key = source.timer.deadline.get();
        loop {
            let mut child_index = index * 2 + 1;
            if child_index >= len {
                break;
            }
            if child_index + 1 < len
                && self.data[child_index + 1].timer.deadline.get()
                    < self.data[child_index].timer.deadline.get()
            {
                child_index += 1;
            }
            let child = self.data[child_index].clone();
            if child.timer.deadline.get() < key {
                self.place(&child, index);
                index = child_index;
            } else {
                break;
            }
        }
        self.place(source, index);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::source::{CallbackKind, Kind, Registered, SourceState, TimerSlot};

    fn timer_state(token: u64) -> Rc<SourceState> {
        Rc::new(SourceState {
            token,
            kind: Kind::Timer,
            removed: Cell::new(false),
            raw: -1,
            registered: Registered::None,
            callback: RefCell::new(CallbackKind::Timer(Box::new(|_| 0))),
            timer: TimerSlot::new(),
        })
    }

    fn ts(ms: i64) -> TimeSpec {
        TimeSpec::new(ms / 1000, (ms % 1000) * 1_000_000)
    }

    #[test]
    fn peek_returns_earliest() {
        let mut heap = ClockHeap::new();
        let sources: Vec<_> = (0..8).map(timer_state).collect();
        let deadlines = [50i64, 10, 90, 30, 70, 20, 80, 40];

        for (s, &d) in sources.iter().zip(&deadlines) {
            heap.reserve();
            heap.arm(s, ts(d));
        }
        assert_eq!(heap.peek().unwrap().token, 1); // deadline 10
    }

    #[test]
    fn disarming_minimum_promotes_next() {
        let mut heap = ClockHeap::new();
        let sources: Vec<_> = (0..5).map(timer_state).collect();
        let deadlines = [5i64, 1, 4, 2, 3];
        for (s, &d) in sources.iter().zip(&deadlines) {
            heap.reserve();
            heap.arm(s, ts(d));
        }

        // Pop the minimum repeatedly; deadlines must come out sorted.
        let mut order = Vec::new();
        while let Some(min) = heap.peek().cloned() {
            order.push(min.timer.deadline.get());
            heap.disarm(&min);
        }
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn random_interleaving_keeps_min_invariant() {
        let mut heap = ClockHeap::new();
        let sources: Vec<_> = (0..32).map(timer_state).collect();
        for _ in &sources {
            heap.reserve();
        }

        let mut seed = 12345u64;
        let mut rand = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as i64
        };

        for _ in 0..4000 {
            let i = (rand() as usize) % sources.len();
            let s = &sources[i];
            let action = rand() % 3;
            if s.timer.is_armed() {
                match action {
                    0 => heap.disarm(s),
                    _ => heap.reschedule(s, ts(rand() % 10_000)),
                }
            } else if action != 0 {
                heap.arm(s, ts(rand() % 10_000));
            }

            // The root must carry the globally earliest armed deadline.
            if let Some(min) = heap.peek() {
                let earliest = sources
                    .iter()
                    .filter(|s| s.timer.is_armed())
                    .map(|s| s.timer.deadline.get())
                    .min()
                    .unwrap();
                assert_eq!(min.timer.deadline.get(), earliest);
            } else {
                assert!(sources.iter().all(|s| !s.timer.is_armed()));
            }
        }
    }

    #[test]
    fn pop_expired_in_deadline_order() {
        let mut heap = ClockHeap::new();
        let sources: Vec<_> = (0..6).map(timer_state).collect();
        let deadlines = [30i64, 10, 50, 20, 60, 40];
        for (s, &d) in sources.iter().zip(&deadlines) {
            heap.reserve();
            heap.arm(s, ts(d));
        }

        let expired = heap.pop_expired(ts(40));
        let got: Vec<i64> = expired
            .iter()
            .map(|s| s.timer.deadline.get().tv_nsec() / 1_000_000)
            .collect();
        // Disarm clears the deadline, so collect tokens instead.
        let tokens: Vec<u64> = expired.iter().map(|s| s.token).collect();
        assert_eq!(tokens, vec![1, 3, 0, 5]); // 10, 20, 30, 40
        assert_eq!(got, vec![0, 0, 0, 0]); // deadlines cleared by disarm
        assert_eq!(heap.peek().unwrap().token, 2); // 50 remains earliest
    }
}
