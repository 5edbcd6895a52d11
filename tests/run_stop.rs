mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_mainloop::native::{MainContext, MainLoop};
use rust_mainloop::{Application, Error, EventLoop, LoopOptions};

fn recursive_loop() -> EventLoop {
    let context = MainContext::new().unwrap();
    EventLoop::with_context(&context, LoopOptions::new().recursive(true))
}

#[test]
fn stop_in_nested_run_only_halts_nested() {
    common::setup_tracing();
    let event_loop = recursive_loop();
    let (log, record) = common::recorder();

    let outer = event_loop.clone();
    let inner_started = record("inner started");
    let inner_returned = record("inner returned");
    let outer_tick = record("outer still dispatching");
    event_loop.call_soon(move || {
        inner_started();
        let stopper = outer.clone();
        outer.call_later(Duration::from_millis(5), move || {
            assert_eq!(stopper.recursion_depth(), 1);
            stopper.stop();
        });
        outer.run().unwrap();
        inner_returned();

        let again = outer.clone();
        outer.call_later(Duration::from_millis(5), move || {
            outer_tick();
            assert_eq!(again.recursion_depth(), 0);
            again.stop();
        });
    });
    event_loop.run_forever().unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["inner started", "inner returned", "outer still dispatching"]
    );
}

#[test]
fn third_party_nested_main_loop_keeps_dispatching_handles() {
    // Another library spins the same context from inside a callback.
    let event_loop = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(false));

    let outer = event_loop.clone();
    let flag = fired.clone();
    event_loop.call_soon(move || {
        let modal = MainLoop::new(outer.context());
        let quit = modal.clone();
        let flag = flag.clone();
        outer.call_later(Duration::from_millis(5), move || {
            flag.set(true);
            quit.quit();
        });
        modal.run();
        outer.stop();
    });
    event_loop.run_forever().unwrap();
    assert!(fired.get());
}

#[test]
fn run_until_complete_drives_tasks() {
    let event_loop = EventLoop::new().unwrap();
    let worker = event_loop.clone();
    let total = event_loop
        .run_until_complete(async move {
            let mut handles = Vec::new();
            for i in 0..5u64 {
                let sleeper = worker.clone();
                handles.push(worker.spawn(async move {
                    sleeper.sleep(Duration::from_millis(5 * (5 - i))).await;
                    i
                }));
            }
            let mut total = 0;
            for handle in handles {
                total += handle.await.unwrap();
            }
            total
        })
        .unwrap();
    assert_eq!(total, 10);
    assert!(!event_loop.is_running());
}

#[test]
fn run_until_complete_reports_early_stop() {
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.clone();
    event_loop.call_later(Duration::from_millis(5), move || stopper.stop());
    let sleeper = event_loop.clone();
    let result = event_loop.run_until_complete(async move {
        sleeper.sleep(Duration::from_secs(30)).await;
    });
    assert!(matches!(result, Err(Error::StoppedBeforeCompletion)));
}

#[test]
fn stop_from_another_thread() {
    let event_loop = EventLoop::new().unwrap();
    let stop = event_loop.stop_handle();
    let worker = std::thread::spawn(move || {
        while !stop.is_running() {
            std::thread::sleep(Duration::from_millis(1));
        }
        stop.stop();
    });
    event_loop.run_forever().unwrap();
    worker.join().unwrap();
}

#[test]
fn stop_while_context_owned_elsewhere() {
    let context = MainContext::new().unwrap();
    let event_loop = EventLoop::with_context(&context, LoopOptions::new());
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let holder_context = context.clone();
    let holder = std::thread::spawn(move || {
        assert!(holder_context.acquire());
        held_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        holder_context.release();
    });
    held_rx.recv().unwrap();

    let stop = event_loop.stop_handle();
    let stopper = std::thread::spawn(move || {
        while !stop.is_running() {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        stop.stop();
        // Handing the context back must not resurrect the stopped run.
        release_tx.send(()).unwrap();
    });
    event_loop.run_forever().unwrap();
    assert!(!event_loop.is_running());
    stopper.join().unwrap();
    holder.join().unwrap();

    // The loop is usable once the context is free again.
    let stopper = event_loop.clone();
    event_loop.call_soon(move || stopper.stop());
    event_loop.run_forever().unwrap();
}

struct RecordingApp {
    main_loop: MainLoop,
    events: Mutex<Vec<&'static str>>,
}

impl Application for RecordingApp {
    fn run(&self) {
        self.events.lock().unwrap().push("run");
        self.main_loop.run();
    }

    fn quit(&self) {
        self.events.lock().unwrap().push("quit");
        self.main_loop.quit();
    }
}

#[test]
fn application_drives_top_level() {
    let context = MainContext::new().unwrap();
    let app = Arc::new(RecordingApp {
        main_loop: MainLoop::new(&context),
        events: Mutex::new(Vec::new()),
    });
    let event_loop = EventLoop::with_context(&context, LoopOptions::new().recursive(true));
    event_loop.set_application(app.clone()).unwrap();
    assert!(event_loop.has_application());
    assert!(matches!(
        event_loop.set_application(app.clone()),
        Err(Error::ApplicationAlreadySet)
    ));

    let stopper = event_loop.clone();
    event_loop.call_soon(move || stopper.stop());
    event_loop.run_forever().unwrap();
    let events = app.events.lock().unwrap().clone();
    assert_eq!(events.first(), Some(&"run"));
    assert!(events.contains(&"quit"));
}

#[test]
fn application_cannot_change_while_running() {
    let context = MainContext::new().unwrap();
    let event_loop = EventLoop::with_context(&context, LoopOptions::new());
    let app = Arc::new(RecordingApp {
        main_loop: MainLoop::new(&context),
        events: Mutex::new(Vec::new()),
    });
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    let inner = event_loop.clone();
    event_loop.call_soon(move || {
        *slot.borrow_mut() = Some(inner.set_application(app));
        inner.stop();
    });
    event_loop.run_forever().unwrap();
    let outcome = result.borrow_mut().take().unwrap();
    assert!(matches!(outcome, Err(Error::ApplicationWhileRunning)));
}

#[test]
fn exception_in_one_callback_spares_siblings() {
    let event_loop = EventLoop::new().unwrap();
    let (log, record) = common::recorder();
    let errors = Rc::new(Cell::new(0));
    let counter = errors.clone();
    event_loop.set_exception_handler(move |_, _| counter.set(counter.get() + 1));

    event_loop.call_soon(record(1));
    event_loop.call_soon(|| panic!("sibling failure"));
    event_loop.call_soon(record(2));
    let stopper = event_loop.clone();
    event_loop.call_soon(move || stopper.stop());
    event_loop.run_forever().unwrap();

    assert_eq!(*log.borrow(), vec![1, 2]);
    assert_eq!(errors.get(), 1);
}
