//! Per-core alarm queue.
//!
//! An insertion-ordered object pool. Each occupied slot is a member of a
//! circular doubly-linked list threaded through the backing storage, so a
//! member can be removed in O(1) given the [`QueueSlot`] returned by
//! [`AlarmQueue::push`]. Free slots form a singly-linked list and are
//! reused by later pushes.
//!
//! ```rust,ignore
//! let mut queue = AlarmQueue::new();
//! let a = queue.push('a');
//! queue.push('b');
//! queue.remove(a);
//! queue.push('c');
//! assert_eq!(queue.iter().copied().collect::<Vec<_>>(), ['b', 'c']);
//! ```
use alloc::vec::Vec;
use core::{fmt, mem, num::NonZeroUsize};

/// A handle to a member of an [`AlarmQueue`], without information about
/// which queue it belongs to.
///
/// Slot indices are zero-based, but stored one-based to meet the requirement
/// of `NonZeroUsize`.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub(super) struct QueueSlot(NonZeroUsize);

impl QueueSlot {
    fn new(i: usize) -> Self {
        Self(NonZeroUsize::new(i.wrapping_add(1)).expect("slot count overflow"))
    }

    fn get(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Debug for QueueSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "QueueSlot({})", self.get())
    }
}

#[derive(Debug, Clone)]
enum Entry<T> {
    /// Occupied. Points the next and previous members in insertion order.
    Used(T, Links),

    /// Free. Points the next free entry.
    Free(Option<QueueSlot>),
}

#[derive(Debug, Clone, Copy)]
struct Links {
    next: QueueSlot,
    prev: QueueSlot,
}

impl<T> Entry<T> {
    fn links_mut(&mut self) -> &mut Links {
        match self {
            Entry::Used(_, links) => links,
            Entry::Free(_) => unreachable!("free entry in the member list"),
        }
    }
}

/// The set of alarms armed on one core, in the order they were armed.
///
/// Membership is what matters to the trigger engine; the order only decides
/// which due alarm fires first within a single check.
#[derive(Clone)]
pub(super) struct AlarmQueue<T> {
    storage: Vec<Entry<T>>,
    first_free: Option<QueueSlot>,
    /// The most recently pushed member. Its successor is the oldest member.
    last_used: Option<QueueSlot>,
    len: usize,
}

impl<T> AlarmQueue<T> {
    pub(super) const fn new() -> Self {
        Self {
            storage: Vec::new(),
            first_free: None,
            last_used: None,
            len: 0,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    pub(super) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `x` to the end of the queue.
    pub(super) fn push(&mut self, x: T) -> QueueSlot {
        let i = match self.first_free {
            Some(i) => {
                self.first_free = match self.storage[i.get()] {
                    Entry::Free(next_free) => next_free,
                    Entry::Used(..) => unreachable!("used entry in the free list"),
                };
                i
            }
            None => {
                self.storage.push(Entry::Free(None));
                QueueSlot::new(self.storage.len() - 1)
            }
        };

        let links = if let Some(last) = self.last_used {
            // Insert between `last` (the newest) and `last.next` (the oldest)
            let first = mem::replace(&mut self.storage[last.get()].links_mut().next, i);
            self.storage[first.get()].links_mut().prev = i;
            Links {
                next: first,
                prev: last,
            }
        } else {
            Links { next: i, prev: i }
        };

        self.storage[i.get()] = Entry::Used(x, links);
        self.last_used = Some(i);
        self.len += 1;
        i
    }

    /// Remove the member at `slot`. Returns `None` if `slot` is vacant.
    pub(super) fn remove(&mut self, slot: QueueSlot) -> Option<T> {
        let entry = self.storage.get_mut(slot.get())?;
        if let Entry::Free(_) = entry {
            return None;
        }

        let (x, Links { next, prev }) =
            match mem::replace(entry, Entry::Free(self.first_free)) {
                Entry::Used(x, links) => (x, links),
                Entry::Free(_) => unreachable!(),
            };

        if next == slot {
            // `slot` was the only member
            debug_assert_eq!(self.last_used, Some(slot));
            self.last_used = None;
        } else {
            if self.last_used == Some(slot) {
                self.last_used = Some(prev);
            }
            self.storage[next.get()].links_mut().prev = prev;
            self.storage[prev.get()].links_mut().next = next;
        }

        self.first_free = Some(slot);
        self.len -= 1;
        Some(x)
    }

    pub(super) fn get(&self, slot: QueueSlot) -> Option<&T> {
        match self.storage.get(slot.get())? {
            Entry::Used(x, _) => Some(x),
            Entry::Free(_) => None,
        }
    }

    /// Iterate over the members from the oldest to the newest.
    pub(super) fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cur: self
                .last_used
                .map(|last| match &self.storage[last.get()] {
                    Entry::Used(_, links) => links.next,
                    Entry::Free(_) => unreachable!(),
                }),
            remaining: self.len,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AlarmQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// An iterator over the members of an [`AlarmQueue`], in insertion order.
#[derive(Debug, Clone)]
pub(super) struct Iter<'a, T> {
    queue: &'a AlarmQueue<T>,
    cur: Option<QueueSlot>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur?;
        match &self.queue.storage[cur.get()] {
            Entry::Used(x, links) => {
                self.cur = if Some(cur) == self.queue.last_used {
                    // Reached the newest member
                    None
                } else {
                    Some(links.next)
                };
                self.remaining -= 1;
                Some(x)
            }
            Entry::Free(_) => unreachable!(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
