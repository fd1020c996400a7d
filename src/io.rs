//! Promise-returning wrappers over reactor operations.

use std::time::Duration;

use crate::cause::Cause;
use crate::promise::Promise;
use crate::reactor::Reactor;

pub fn nop<R: Reactor>(reactor: &mut R) -> Promise<()> {
    let promise = Promise::new();
    let target = promise.clone();

    reactor.nop(move |result, _| {
        target.resolve(result);
    });

    promise
}

/// Succeeds with the time actually spent waiting.
pub fn delay<R: Reactor>(reactor: &mut R, duration: Duration) -> Promise<Duration> {
    let promise = Promise::new();
    let target = promise.clone();

    reactor.delay(duration, move |result, _| {
        target.resolve(result);
    });

    promise
}

/// Race `promise` against a timer. Fails with `TimedOut` if the timer wins.
///
/// The losing side is not cancelled. If `promise` stands for an operation
/// holding resources, the caller still has to release them.
pub fn with_timeout<R, T>(reactor: &mut R, promise: &Promise<T>, timeout: Duration) -> Promise<T>
where
    R: Reactor,
    T: Clone + Send + Sync + 'static,
{
    let timer = Promise::new();
    let expired = timer.clone();

    reactor.delay(timeout, move |result, _| {
        let cause = match result {
            Ok(_) => Cause::timed_out(format!("no result within {:?}", timeout)),
            Err(cause) => cause,
        };

        expired.fail(cause);
    });

    Promise::any(vec![promise.clone(), timer])
}
