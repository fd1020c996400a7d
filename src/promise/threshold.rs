use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Counts down independent events and runs an action exactly once, when the
/// last expected event is registered. Events past the threshold are ignored.
pub struct ActionableThreshold {
    remaining: AtomicUsize,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ActionableThreshold {
    pub fn new<F>(count: usize, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            remaining: AtomicUsize::new(count),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn register_event(&self) {
        if countdown(&self.remaining) {
            // Only the thread that took the counter from 1 to 0 gets here.
            let action = self.action.lock().take();

            if let Some(action) = action {
                action();
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Collects one value per index and hands all of them, in index order, to
/// the action once every slot has been filled.
///
/// Registering the same index twice keeps the first value and does not count
/// as a new event.
pub struct ResultCollector<T> {
    slots: Mutex<Vec<Option<T>>>,
    remaining: AtomicUsize,
    action: Mutex<Option<Box<dyn FnOnce(Vec<T>) + Send>>>,
}

impl<T> ResultCollector<T> {
    pub fn new<F>(count: usize, action: F) -> Self
    where
        F: FnOnce(Vec<T>) + Send + 'static,
    {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || None);

        Self {
            slots: Mutex::new(slots),
            remaining: AtomicUsize::new(count),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn register(&self, index: usize, value: T) {
        {
            let mut slots = self.slots.lock();

            match slots.get_mut(index) {
                Some(slot) if slot.is_none() => *slot = Some(value),
                _ => return,
            }
        }

        if !countdown(&self.remaining) {
            return;
        }

        let values: Vec<T> = self.slots.lock().drain(..).flatten().collect();
        let action = self.action.lock().take();

        if let Some(action) = action {
            action(values);
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

// Decrement without going below zero; true for the decrement that hit zero.
fn countdown(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        == Ok(1)
}
