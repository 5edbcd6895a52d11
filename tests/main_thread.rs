//! Behavior that needs the real main thread or must not overlap with other
//! tests: the default loop, SIGINT, descriptors closed under the loop.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use rust_mainloop::{get_event_loop, policy, Error, EventLoop};

fn default_loop_is_created_lazily() {
    let event_loop = get_event_loop().unwrap();
    assert!(event_loop.context().is_default());
    assert!(get_event_loop().unwrap().ptr_eq(&event_loop));
    assert!(policy().get_default_loop().unwrap().ptr_eq(&event_loop));

    // Later loops get their own context.
    let second = policy().new_event_loop().unwrap();
    assert!(!second.context().is_default());
}

fn sigint_interrupts_default_loop() {
    let event_loop = get_event_loop().unwrap();
    event_loop.call_later(Duration::from_millis(20), || {
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
    });
    let result = event_loop.run_forever();
    assert!(matches!(result, Err(Error::Interrupted)), "{result:?}");
    assert!(!event_loop.is_running());
}

fn user_sigint_handler_supersedes_default() {
    let event_loop = get_event_loop().unwrap();
    let caught = Rc::new(Cell::new(false));
    let flag = caught.clone();
    let stopper = event_loop.clone();
    event_loop
        .add_signal_handler(libc::SIGINT, move || {
            flag.set(true);
            stopper.stop();
        })
        .unwrap();
    event_loop.call_later(Duration::from_millis(20), || {
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
    });
    event_loop.run_forever().unwrap();
    assert!(caught.get());
    assert!(event_loop.remove_signal_handler(libc::SIGINT).unwrap());
}

fn writer_on_closed_pipe_fires_once() {
    let event_loop = EventLoop::new().unwrap();
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);
    unsafe {
        libc::close(write_fd);
    }

    let count = Rc::new(Cell::new(0));
    let counter = count.clone();
    event_loop
        .add_writer(write_fd, move || counter.set(counter.get() + 1))
        .unwrap();
    let stopper = event_loop.clone();
    event_loop.call_later(Duration::from_millis(50), move || stopper.stop());
    event_loop.run_forever().unwrap();

    assert_eq!(count.get(), 1);
    assert!(!event_loop.remove_writer(write_fd));
    unsafe {
        libc::close(read_fd);
    }
}

fn main() {
    common::setup_tracing();
    assert_eq!(std::thread::current().name(), Some("main"));

    let tests: &[(&str, fn())] = &[
        ("default_loop_is_created_lazily", default_loop_is_created_lazily),
        ("sigint_interrupts_default_loop", sigint_interrupts_default_loop),
        (
            "user_sigint_handler_supersedes_default",
            user_sigint_handler_supersedes_default,
        ),
        ("writer_on_closed_pipe_fires_once", writer_on_closed_pipe_fires_once),
    ];
    for (name, test) in tests {
        test();
        println!("test {name} ... ok");
    }
}
