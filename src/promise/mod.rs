//! Single-assignment result cell with continuation chaining.
//!
//! A [`Promise`] starts empty and is resolved at most once. Continuations
//! registered before resolution are queued on a lock-free stack and run, in
//! registration order, on the thread that resolves the promise. Continuations
//! registered afterwards run immediately on the registering thread.

mod combinators;
mod threshold;

pub use combinators::{all2, all3};
pub use threshold::{ActionableThreshold, ResultCollector};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, ptr, thread};

use crate::cause::{Cause, Result};
use crate::stack::Stack;

type Continuation<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Inner<T> {
    value: AtomicPtr<Result<T>>,
    continuations: Stack<Continuation<T>>,
    _marker: PhantomData<T>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let value = *self.value.get_mut();

        if !value.is_null() {
            drop(unsafe { Box::from_raw(value) });
        }
    }
}

pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: AtomicPtr::new(ptr::null_mut()),
                continuations: Stack::new(),
                _marker: PhantomData,
            }),
        }
    }

    pub fn resolved(result: Result<T>) -> Self {
        let promise = Self::new();
        promise.resolve(result);
        promise
    }

    pub fn successful(value: T) -> Self {
        Self::resolved(Ok(value))
    }

    pub fn failed(cause: Cause) -> Self {
        Self::resolved(Err(cause))
    }

    /// Create a promise and hand it to `setup`, typically to kick off the
    /// operation that will resolve it.
    pub fn with<F>(setup: F) -> Self
    where
        F: FnOnce(&Promise<T>),
    {
        let promise = Self::new();
        setup(&promise);
        promise
    }

    /// Resolve the promise. Returns false, and drops `result`, if the promise
    /// was already resolved.
    pub fn resolve(&self, result: Result<T>) -> bool {
        let value = Box::into_raw(Box::new(result));

        if self
            .inner
            .value
            .compare_exchange(ptr::null_mut(), value, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            drop(unsafe { Box::from_raw(value) });
            return false;
        }

        // The value stays put until the last handle drops.
        let value = unsafe { &*value };

        for continuation in self.inner.continuations.seal() {
            continuation(value);
        }

        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, cause: Cause) -> bool {
        self.resolve(Err(cause))
    }

    pub fn is_resolved(&self) -> bool {
        !self.inner.value.load(Ordering::Acquire).is_null()
    }

    pub fn value(&self) -> Option<&Result<T>> {
        let value = self.inner.value.load(Ordering::Acquire);

        if value.is_null() {
            None
        } else {
            Some(unsafe { &*value })
        }
    }

    pub fn on_result<F>(&self, action: F) -> &Self
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        if let Some(value) = self.value() {
            action(value);
            return self;
        }

        // Losing the race against resolve() means the stack is sealed and the
        // value is already visible.
        if let Err(action) = self.inner.continuations.push(Box::new(action)) {
            if let Some(value) = self.value() {
                action(value);
            }
        }

        self
    }

    pub fn on_success<F>(&self, action: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_result(move |result| {
            if let Ok(value) = result {
                action(value);
            }
        })
    }

    pub fn on_failure<F>(&self, action: F) -> &Self
    where
        F: FnOnce(&Cause) + Send + 'static,
    {
        self.on_result(move |result| {
            if let Err(cause) = result {
                action(cause);
            }
        })
    }

    pub fn map<U, F>(&self, mapper: F) -> Promise<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let derived = Promise::new();
        let target = derived.clone();

        self.on_result(move |result| {
            target.resolve(result.as_ref().map(mapper).map_err(Cause::clone));
        });

        derived
    }

    pub fn flat_map<U, F>(&self, mapper: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> Promise<U> + Send + 'static,
    {
        let derived = Promise::new();
        let target = derived.clone();

        self.on_result(move |result| match result {
            Ok(value) => {
                mapper(value).on_result(move |inner| {
                    target.resolve(inner.clone());
                });
            }
            Err(cause) => {
                target.fail(cause.clone());
            }
        });

        derived
    }

    pub fn map_err<F>(&self, mapper: F) -> Promise<T>
    where
        T: Clone,
        F: FnOnce(&Cause) -> Cause + Send + 'static,
    {
        let derived = Promise::new();
        let target = derived.clone();

        self.on_result(move |result| {
            target.resolve(result.clone().map_err(|cause| mapper(&cause)));
        });

        derived
    }

    /// Block the calling thread until the promise is resolved.
    ///
    /// Never call this from a worker thread: the worker would stop driving the
    /// very I/O that is supposed to resolve the promise.
    pub fn join(&self) -> Result<T>
    where
        T: Clone,
    {
        self.wait_until(None)
    }

    /// Like [`Promise::join`], but gives up with a `TimedOut` failure once
    /// `timeout` has elapsed. The promise itself is left untouched.
    pub fn join_timeout(&self, timeout: Duration) -> Result<T>
    where
        T: Clone,
    {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<T>
    where
        T: Clone,
    {
        if let Some(value) = self.value() {
            return value.clone();
        }

        let waiter = thread::current();
        self.on_result(move |_| waiter.unpark());

        loop {
            if let Some(value) = self.value() {
                return value.clone();
            }

            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return Err(Cause::timed_out("promise was not resolved in time"));
                    }

                    thread::park_timeout(deadline - now);
                }
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.inner.value.load(Ordering::Acquire);

        if value.is_null() {
            f.write_str("Promise(<>)")
        } else {
            write!(f, "Promise({:?})", unsafe { &*value })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::ErrorKind;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn continuations_run_in_registration_order() {
        let promise = Promise::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 1..=3 {
            let order = order.clone();
            promise.on_result(move |result| {
                order.lock().push((id, *result.as_ref().unwrap()));
            });
        }

        assert!(order.lock().is_empty());
        assert!(promise.succeed(7));
        assert_eq!(*order.lock(), vec![(1, 7), (2, 7), (3, 7)]);
    }

    #[test]
    fn late_registration_runs_inline() {
        let promise = Promise::successful("done");
        let seen = Arc::new(Mutex::new(None));
        let output = seen.clone();

        promise.on_success(move |value| {
            *output.lock() = Some(*value);
        });

        assert_eq!(*seen.lock(), Some("done"));
    }

    #[test]
    fn second_resolution_is_ignored() {
        let promise = Promise::new();

        assert!(promise.succeed(1));
        assert!(!promise.succeed(2));
        assert!(!promise.fail(Cause::fault("late")));
        assert_eq!(promise.value().unwrap().as_ref().unwrap(), &1);
    }

    #[test]
    fn racing_resolvers_agree_on_one_value() {
        for _ in 0..50 {
            let promise = Promise::<usize>::new();
            let observed = Arc::new(Mutex::new(Vec::new()));

            for _ in 0..4 {
                let observed = observed.clone();
                promise.on_success(move |v| observed.lock().push(*v));
            }

            let resolvers: Vec<_> = (0..4)
                .map(|n| {
                    let promise = promise.clone();
                    let observed = observed.clone();
                    thread::spawn(move || {
                        promise.on_success(move |v| observed.lock().push(*v));
                        promise.succeed(n)
                    })
                })
                .collect();

            let winners = resolvers
                .into_iter()
                .map(|r| r.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(winners, 1);

            let observed = observed.lock();
            assert_eq!(observed.len(), 8);
            assert!(observed.iter().all(|v| *v == observed[0]));
        }
    }

    #[test]
    fn concurrent_registration_runs_every_continuation_once() {
        let promise = Promise::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let registrars: Vec<_> = (0..4)
            .map(|_| {
                let promise = promise.clone();
                let calls = calls.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let calls = calls.clone();
                        promise.on_result(move |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        promise.succeed(());

        for r in registrars {
            r.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2000);
    }

    #[test]
    fn map_and_flat_map_chain() {
        let source = Promise::<u32>::new();
        let doubled = source.map(|v| v * 2);
        let described = doubled.flat_map(|v| Promise::successful(format!("value {}", v)));

        assert!(!described.is_resolved());
        source.succeed(21);

        assert_eq!(described.join().unwrap(), "value 42");
    }

    #[test]
    fn failure_skips_mappers() {
        let source = Promise::<u32>::new();
        let mapped = source
            .map(|_| -> u32 { panic!("mapper must not run") })
            .flat_map(|_| -> Promise<u32> { panic!("mapper must not run") });

        source.fail(Cause::fault("broken"));

        let cause = mapped.join().unwrap_err();
        assert_eq!(cause.kind(), ErrorKind::Fault);
        assert_eq!(cause.message(), "broken");
    }

    #[test]
    fn map_err_wraps_cause() {
        let promise = Promise::<u32>::failed(Cause::fault("inner"))
            .map_err(|cause| Cause::cancelled("outer").with_source(cause.clone()));

        let cause = promise.join().unwrap_err();
        assert_eq!(cause.kind(), ErrorKind::Cancelled);
        assert_eq!(cause.source_cause().unwrap().message(), "inner");
    }

    #[test]
    fn join_waits_for_another_thread() {
        let promise = Promise::new();
        let resolver = promise.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.succeed(5u8);
        });

        assert_eq!(promise.join().unwrap(), 5);
        handle.join().unwrap();
    }

    #[test]
    fn join_timeout_expires() {
        let promise = Promise::<u8>::new();
        let cause = promise.join_timeout(Duration::from_millis(10)).unwrap_err();

        assert_eq!(cause.kind(), ErrorKind::TimedOut);
        assert!(!promise.is_resolved());
    }

    #[test]
    fn debug_shows_state() {
        let promise = Promise::<u8>::new();
        assert_eq!(format!("{:?}", promise), "Promise(<>)");

        promise.succeed(3);
        assert_eq!(format!("{:?}", promise), "Promise(Ok(3))");
    }
}
