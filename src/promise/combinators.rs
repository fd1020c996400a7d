use std::sync::Arc;

use parking_lot::Mutex;

use super::{ActionableThreshold, Promise, ResultCollector};
use crate::cause::Cause;

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Succeeds with every value, in input order, once all inputs succeed.
    /// Fails with the first failure as soon as any input fails.
    pub fn all(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        let all = Promise::new();

        if promises.is_empty() {
            all.succeed(Vec::new());
            return all;
        }

        let target = all.clone();
        let collector = Arc::new(ResultCollector::new(promises.len(), move |values| {
            target.succeed(values);
        }));

        for (index, promise) in promises.iter().enumerate() {
            let collector = collector.clone();
            let all = all.clone();

            promise.on_result(move |result| match result {
                Ok(value) => collector.register(index, value.clone()),
                Err(cause) => {
                    all.fail(cause.clone());
                }
            });
        }

        all
    }

    /// Resolves with whichever input resolves first, success or failure.
    /// The remaining inputs are left to finish on their own.
    pub fn any(promises: Vec<Promise<T>>) -> Promise<T> {
        let any = Promise::new();

        if promises.is_empty() {
            any.fail(Cause::fault("no promises to wait for"));
            return any;
        }

        for promise in &promises {
            let any = any.clone();

            promise.on_result(move |result| {
                any.resolve(result.clone());
            });
        }

        any
    }

    /// Resolves with the first success. Fails only once every input has
    /// failed, chaining the last failure as the source.
    pub fn any_success(promises: Vec<Promise<T>>) -> Promise<T> {
        let any = Promise::new();

        if promises.is_empty() {
            any.fail(Cause::fault("no promises to wait for"));
            return any;
        }

        let last_failure = Arc::new(Mutex::new(None::<Cause>));
        let threshold = {
            let any = any.clone();
            let last_failure = last_failure.clone();

            Arc::new(ActionableThreshold::new(promises.len(), move || {
                let mut cause = Cause::fault("all promises failed");

                if let Some(last) = last_failure.lock().take() {
                    cause = cause.with_source(last);
                }

                any.fail(cause);
            }))
        };

        for promise in &promises {
            let any = any.clone();
            let threshold = threshold.clone();
            let last_failure = last_failure.clone();

            promise.on_result(move |result| match result {
                Ok(value) => {
                    any.succeed(value.clone());
                }
                Err(cause) => {
                    *last_failure.lock() = Some(cause.clone());
                    threshold.register_event();
                }
            });
        }

        any
    }
}

/// Succeeds with both values once both inputs succeed; fails fast otherwise.
pub fn all2<A, B>(a: &Promise<A>, b: &Promise<B>) -> Promise<(A, B)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    let all = Promise::<(A, B)>::new();
    let slots = Arc::new(Mutex::new((None::<A>, None::<B>)));
    let threshold = Arc::new(ActionableThreshold::new(2, {
        let all = all.clone();
        let slots = slots.clone();

        move || {
            if let (Some(a), Some(b)) = slots.lock().clone() {
                all.succeed((a, b));
            }
        }
    }));

    register(a, &all, &threshold, {
        let slots = slots.clone();
        move |value| slots.lock().0 = Some(value)
    });
    register(b, &all, &threshold, move |value| slots.lock().1 = Some(value));

    all
}

/// Three-input variant of [`all2`].
pub fn all3<A, B, C>(a: &Promise<A>, b: &Promise<B>, c: &Promise<C>) -> Promise<(A, B, C)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    let all = Promise::<(A, B, C)>::new();
    let slots = Arc::new(Mutex::new((None::<A>, None::<B>, None::<C>)));
    let threshold = Arc::new(ActionableThreshold::new(3, {
        let all = all.clone();
        let slots = slots.clone();

        move || {
            if let (Some(a), Some(b), Some(c)) = slots.lock().clone() {
                all.succeed((a, b, c));
            }
        }
    }));

    register(a, &all, &threshold, {
        let slots = slots.clone();
        move |value| slots.lock().0 = Some(value)
    });
    register(b, &all, &threshold, {
        let slots = slots.clone();
        move |value| slots.lock().1 = Some(value)
    });
    register(c, &all, &threshold, move |value| slots.lock().2 = Some(value));

    all
}

// Store a success through `store` and count it; forward a failure to `all`.
fn register<T, R, S>(promise: &Promise<T>, all: &Promise<R>, threshold: &Arc<ActionableThreshold>, store: S)
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: FnOnce(T) + Send + 'static,
{
    let all = all.clone();
    let threshold = threshold.clone();

    promise.on_result(move |result| match result {
        Ok(value) => {
            store(value.clone());
            threshold.register_event();
        }
        Err(cause) => {
            all.fail(cause.clone());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::ErrorKind;

    #[test]
    fn all_collects_in_input_order() {
        let inputs: Vec<Promise<u32>> = (0..3).map(|_| Promise::new()).collect();
        let all = Promise::all(inputs.clone());

        inputs[2].succeed(30);
        inputs[0].succeed(10);
        assert!(!all.is_resolved());

        inputs[1].succeed(20);
        assert_eq!(all.join().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn all_fails_fast() {
        let inputs: Vec<Promise<u32>> = (0..3).map(|_| Promise::new()).collect();
        let all = Promise::all(inputs.clone());

        inputs[1].fail(Cause::fault("second failed"));
        assert_eq!(all.value().unwrap().as_ref().unwrap_err().message(), "second failed");

        inputs[0].succeed(1);
        inputs[2].fail(Cause::fault("third failed"));
        assert_eq!(all.join().unwrap_err().message(), "second failed");
    }

    #[test]
    fn all_of_nothing_succeeds() {
        let all = Promise::<u8>::all(Vec::new());
        assert_eq!(all.join().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn any_takes_the_first_outcome() {
        let slow = Promise::<u8>::new();
        let fast = Promise::<u8>::new();
        let any = Promise::any(vec![slow.clone(), fast.clone()]);

        fast.fail(Cause::timed_out("timer fired"));
        slow.succeed(1);

        assert_eq!(any.join().unwrap_err().kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn any_success_skips_failures() {
        let inputs: Vec<Promise<&str>> = (0..3).map(|_| Promise::new()).collect();
        let any = Promise::any_success(inputs.clone());

        inputs[0].fail(Cause::fault("first"));
        inputs[1].fail(Cause::fault("second"));
        assert!(!any.is_resolved());

        inputs[2].succeed("third");
        assert_eq!(any.join().unwrap(), "third");
    }

    #[test]
    fn any_success_fails_when_everything_fails() {
        let inputs: Vec<Promise<u8>> = (0..2).map(|_| Promise::new()).collect();
        let any = Promise::any_success(inputs.clone());

        inputs[0].fail(Cause::fault("first"));
        inputs[1].fail(Cause::cancelled("second"));

        let cause = any.join().unwrap_err();
        assert_eq!(cause.kind(), ErrorKind::Fault);
        assert_eq!(cause.source_cause().unwrap().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn tuples_of_mixed_types() {
        let number = Promise::<u32>::new();
        let text = Promise::<String>::new();
        let flag = Promise::successful(true);

        let pair = all2(&number, &text);
        let triple = all3(&number, &text, &flag);

        text.succeed("x".to_string());
        number.succeed(9);

        assert_eq!(pair.join().unwrap(), (9, "x".to_string()));
        assert_eq!(triple.join().unwrap(), (9, "x".to_string(), true));
    }

    #[test]
    fn tuple_fails_fast() {
        let number = Promise::<u32>::new();
        let text = Promise::<String>::new();
        let pair = all2(&number, &text);

        text.fail(Cause::fault("no text"));

        assert_eq!(pair.join().unwrap_err().message(), "no text");
    }
}
