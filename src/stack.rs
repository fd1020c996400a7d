//! Multi-producer stack drained in bulk by a single consumer.
//!
//! Producers prepend with a CAS loop on the head pointer. The consumer swaps
//! the whole list out at once and reverses it, so items come back in the
//! order they were pushed. A stack can also be sealed: sealing drains it for
//! the last time and makes every later push fail, handing the item back to
//! the caller.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

// Tag stored in the head once the stack is sealed. Nodes are at least
// pointer-aligned so a real node can never live at this address.
const SEALED: usize = 1;

struct Node<T> {
    item: T,
    next: *mut Node<T>,
}

pub struct Stack<T> {
    head: AtomicPtr<Node<T>>,
    _marker: PhantomData<Box<Node<T>>>,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Push an item, or give it back if the stack has been sealed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let node = Box::into_raw(Box::new(Node {
            item,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Acquire);

        loop {
            if head as usize == SEALED {
                let node = unsafe { Box::from_raw(node) };
                return Err(node.item);
            }

            unsafe { (*node).next = head };

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(current) => head = current,
            }
        }
    }

    /// Take everything pushed so far, oldest first.
    pub fn drain(&self) -> Drain<T> {
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            if head.is_null() || head as usize == SEALED {
                return Drain::empty();
            }

            match self.head.compare_exchange_weak(
                head,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Drain::reversed(head),
                Err(current) => head = current,
            }
        }
    }

    /// Seal the stack and take whatever was pushed before sealing, oldest first.
    pub fn seal(&self) -> Drain<T> {
        let head = self.head.swap(SEALED as *mut Node<T>, Ordering::AcqRel);

        if head.is_null() || head as usize == SEALED {
            Drain::empty()
        } else {
            Drain::reversed(head)
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.head.load(Ordering::Acquire) as usize == SEALED
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        head.is_null() || head as usize == SEALED
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // Drop runs the remaining nodes' destructors.
        drop(self.seal());
    }
}

/// Items taken out of a [`Stack`], in push order.
pub struct Drain<T> {
    head: *mut Node<T>,
}

impl<T> Drain<T> {
    fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    fn reversed(mut current: *mut Node<T>) -> Self {
        let mut prev = ptr::null_mut();

        while !current.is_null() {
            unsafe {
                let next = (*current).next;
                (*current).next = prev;
                prev = current;
                current = next;
            }
        }

        Self { head: prev }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl<T> Iterator for Drain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }

        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;

        Some(node.item)
    }
}

impl<T> Drop for Drain<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

unsafe impl<T: Send> Send for Drain<T> {}
