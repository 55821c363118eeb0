//! # Index-Linked Lists
//!
//! Doubly-linked lists over an arena. Nodes are plain indices into a
//! slice of [`Link`]s owned by whoever owns the arena (the task table,
//! the timer pool), so an element can be unlinked in O(1) from the
//! middle of any list without holding a pointer into another struct.
//!
//! A node can be on at most one list per link array. Every mutation
//! asserts that.

/// Per-node link fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

impl Link {
    pub const UNLINKED: Self = Self {
        prev: None,
        next: None,
        linked: false,
    };

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// List head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    #[inline]
    pub fn back(&self) -> Option<usize> {
        self.tail
    }

    /// Successor of `node`, which must be on this list.
    #[inline]
    pub fn next(&self, links: &[Link], node: usize) -> Option<usize> {
        links[node].next
    }

    pub fn push_back(&mut self, links: &mut [Link], node: usize) {
        assert!(!links[node].linked, "node {} is already on a list", node);
        links[node] = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => links[tail].next = Some(node),
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    /// Insert `node` in front of the first element for which `goes_before`
    /// returns `true`, or at the back if there is none. Elements the
    /// predicate rejects keep their place ahead of `node`, so inserting
    /// with a strict comparison keeps equal keys in arrival order.
    pub fn insert_by(
        &mut self,
        links: &mut [Link],
        node: usize,
        mut goes_before: impl FnMut(usize) -> bool,
    ) {
        assert!(!links[node].linked, "node {} is already on a list", node);
        let mut cursor = self.head;
        while let Some(at) = cursor {
            if goes_before(at) {
                let prev = links[at].prev;
                links[node] = Link {
                    prev,
                    next: Some(at),
                    linked: true,
                };
                links[at].prev = Some(node);
                match prev {
                    Some(prev) => links[prev].next = Some(node),
                    None => self.head = Some(node),
                }
                self.len += 1;
                return;
            }
            cursor = links[at].next;
        }
        self.push_back(links, node);
    }

    pub fn remove(&mut self, links: &mut [Link], node: usize) {
        let Link { prev, next, linked } = links[node];
        assert!(linked, "node {} is not on a list", node);
        debug_assert!(self.contains(links, node), "node {} is on another list", node);
        match prev {
            Some(prev) => links[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => links[next].prev = prev,
            None => self.tail = prev,
        }
        links[node] = Link::UNLINKED;
        self.len -= 1;
    }

    pub fn pop_front(&mut self, links: &mut [Link]) -> Option<usize> {
        let head = self.head?;
        self.remove(links, head);
        Some(head)
    }

    /// Move `node` to the back of this list.
    pub fn rotate_to_back(&mut self, links: &mut [Link], node: usize) {
        if self.tail != Some(node) {
            self.remove(links, node);
            self.push_back(links, node);
        }
    }

    pub fn contains(&self, links: &[Link], node: usize) -> bool {
        self.iter(links).any(|n| n == node)
    }

    pub fn iter<'a>(&self, links: &'a [Link]) -> Iter<'a> {
        Iter {
            links,
            cursor: self.head,
        }
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a> {
    links: &'a [Link],
    cursor: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let node = self.cursor?;
        self.cursor = self.links[node].next;
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &List, links: &[Link]) -> Vec<usize> {
        list.iter(links).collect()
    }

    #[test]
    fn test_push_and_remove() {
        let mut links = [Link::UNLINKED; 4];
        let mut list = List::new();
        for i in 0..4 {
            list.push_back(&mut links, i);
        }
        assert_eq!(collect(&list, &links), [0, 1, 2, 3]);

        list.remove(&mut links, 2);
        list.remove(&mut links, 0);
        assert_eq!(collect(&list, &links), [1, 3]);
        assert_eq!(list.front(), Some(1));
        assert_eq!(list.back(), Some(3));
        assert!(!links[2].is_linked());

        assert_eq!(list.pop_front(&mut links), Some(1));
        assert_eq!(list.pop_front(&mut links), Some(3));
        assert_eq!(list.pop_front(&mut links), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_insert_by_is_stable() {
        let keys = [5u32, 3, 5, 1, 3];
        let mut links = [Link::UNLINKED; 5];
        let mut list = List::new();
        for node in 0..keys.len() {
            list.insert_by(&mut links, node, |at| keys[node] < keys[at]);
        }
        assert_eq!(collect(&list, &links), [3, 1, 4, 0, 2]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_rotate_to_back() {
        let mut links = [Link::UNLINKED; 3];
        let mut list = List::new();
        for i in 0..3 {
            list.push_back(&mut links, i);
        }
        list.rotate_to_back(&mut links, 0);
        assert_eq!(collect(&list, &links), [1, 2, 0]);
        list.rotate_to_back(&mut links, 0);
        assert_eq!(collect(&list, &links), [1, 2, 0]);
        assert_eq!(list.next(&links, 1), Some(2));
    }

    #[test]
    #[should_panic]
    fn test_double_insert_panics() {
        let mut links = [Link::UNLINKED; 1];
        let mut a = List::new();
        let mut b = List::new();
        a.push_back(&mut links, 0);
        b.push_back(&mut links, 0);
    }
}
