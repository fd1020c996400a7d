use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use proactor::buffer::KIB;
use proactor::{io, Config, Promise, Reactor, Scheduler};

const WAIT: Duration = Duration::from_secs(5);

// Ring setup can be refused (old kernel, seccomp); those runs skip.
fn scheduler() -> Option<Scheduler> {
    let config = Config::default().threads(2).arena_size(256 * KIB).ring_entries(32);

    match Scheduler::new(config) {
        Ok(scheduler) => Some(scheduler),
        Err(cause) => {
            eprintln!("io_uring unavailable, skipping: {}", cause);
            None
        }
    }
}

#[test]
fn delay_on_a_worker() -> anyhow::Result<()> {
    let scheduler = match scheduler() {
        Some(scheduler) => scheduler,
        None => return Ok(()),
    };

    let done = Promise::new();
    let result = done.clone();

    scheduler.submit(move |reactor| {
        let result = result.clone();
        io::delay(reactor, Duration::from_millis(10)).on_result(move |elapsed| {
            result.resolve(elapsed.clone());
        });
    });

    assert!(done.join_timeout(WAIT)? >= Duration::from_millis(10));
    scheduler.shutdown().join_timeout(WAIT)?;

    Ok(())
}

#[test]
fn echo_one_message() -> anyhow::Result<()> {
    let scheduler = match scheduler() {
        Some(scheduler) => scheduler,
        None => return Ok(()),
    };

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let fd = listener.as_raw_fd();
    let echoed = Promise::new();
    let result = echoed.clone();

    scheduler.submit(move |reactor| {
        reactor.accept(fd, Some(WAIT), move |stream, reactor| {
            let stream = match stream {
                Ok(stream) => stream,
                Err(cause) => {
                    result.fail(cause);
                    return;
                }
            };

            let buffer = match reactor.allocate_fixed_buffer(KIB) {
                Ok(buffer) => buffer,
                Err(cause) => {
                    result.fail(cause);
                    return;
                }
            };

            reactor.read_fixed(stream.as_raw_fd(), buffer, 0, Some(WAIT), move |read, buffer, reactor| {
                if let Err(cause) = read {
                    result.fail(cause);
                    return;
                }

                reactor.write_fixed(stream.as_raw_fd(), buffer, 0, Some(WAIT), move |written, _, _| {
                    drop(stream);
                    result.resolve(written);
                });
            });
        });
    });

    let mut client = std::net::TcpStream::connect(addr)?;
    std::io::Write::write_all(&mut client, b"marco")?;

    let mut reply = [0u8; 5];
    std::io::Read::read_exact(&mut client, &mut reply)?;

    assert_eq!(echoed.join_timeout(WAIT)?, 5);
    assert_eq!(&reply, b"marco");

    scheduler.shutdown().join_timeout(WAIT)?;
    drop(listener);

    Ok(())
}

#[test]
fn replicate_and_shutdown() -> anyhow::Result<()> {
    let scheduler = match scheduler() {
        Some(scheduler) => scheduler,
        None => return Ok(()),
    };

    let pings: Vec<Promise<()>> = (0..scheduler.parallelism()).map(|_| Promise::new()).collect();
    let slots = std::sync::Arc::new(parking_lot::Mutex::new(pings.clone()));

    scheduler.replicate(move |reactor| {
        if let Some(ping) = slots.lock().pop() {
            io::nop(reactor).on_result(move |result| {
                ping.resolve(result.clone());
            });
        }
    });

    Promise::all(pings).join_timeout(WAIT)?;
    scheduler.shutdown().join_timeout(WAIT)?;

    Ok(())
}
