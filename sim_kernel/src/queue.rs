//! Array-backed intrusive queues
//!
//! A [`Links`] plane stores one prev/next pair per slot index. Any number of
//! [`Queue`] heads can thread through the same plane as long as each slot is
//! on at most one of them at a time. All operations are O(1) except
//! iteration.

/// Head and tail of one queue threaded through a [`Links`] plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Queue {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl Queue {
    pub(crate) fn front(&self) -> Option<u32> {
        self.head
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<u32>,
    next: Option<u32>,
    linked: bool,
}

/// Link storage shared by a family of queues
#[derive(Debug, Default)]
pub(crate) struct Links {
    links: Vec<Link>,
}

impl Links {
    fn link_mut(&mut self, index: u32) -> &mut Link {
        let slot = index as usize;
        if slot >= self.links.len() {
            self.links.resize(slot + 1, Link::default());
        }
        &mut self.links[slot]
    }

    pub(crate) fn is_linked(&self, index: u32) -> bool {
        self.links
            .get(index as usize)
            .map(|link| link.linked)
            .unwrap_or(false)
    }

    pub(crate) fn next(&self, index: u32) -> Option<u32> {
        self.links.get(index as usize).and_then(|link| link.next)
    }

    pub(crate) fn push_back(&mut self, queue: &mut Queue, index: u32) {
        let tail = queue.tail;
        {
            let link = self.link_mut(index);
            assert!(!link.linked, "slot {index} already queued");
            *link = Link {
                prev: tail,
                next: None,
                linked: true,
            };
        }
        match tail {
            Some(tail) => self.link_mut(tail).next = Some(index),
            None => queue.head = Some(index),
        }
        queue.tail = Some(index);
        queue.len += 1;
    }

    pub(crate) fn push_front(&mut self, queue: &mut Queue, index: u32) {
        let head = queue.head;
        {
            let link = self.link_mut(index);
            assert!(!link.linked, "slot {index} already queued");
            *link = Link {
                prev: None,
                next: head,
                linked: true,
            };
        }
        match head {
            Some(head) => self.link_mut(head).prev = Some(index),
            None => queue.tail = Some(index),
        }
        queue.head = Some(index);
        queue.len += 1;
    }

    /// Unlinks `index` from `queue`; a slot that is not linked is ignored
    pub(crate) fn remove(&mut self, queue: &mut Queue, index: u32) {
        if !self.is_linked(index) {
            return;
        }
        let Link { prev, next, .. } = *self.link_mut(index);
        match prev {
            Some(prev) => self.link_mut(prev).next = next,
            None => queue.head = next,
        }
        match next {
            Some(next) => self.link_mut(next).prev = prev,
            None => queue.tail = prev,
        }
        *self.link_mut(index) = Link::default();
        queue.len -= 1;
    }

    /// Moves the head of `queue` to its tail
    pub(crate) fn rotate(&mut self, queue: &mut Queue) {
        if let Some(head) = queue.head {
            if queue.len > 1 {
                self.remove(queue, head);
                self.push_back(queue, head);
            }
        }
    }

    pub(crate) fn iter<'a>(&'a self, queue: &Queue) -> impl Iterator<Item = u32> + 'a {
        std::iter::successors(queue.head, move |&index| self.next(index))
    }
}
