//! A callback that spins the loop again, the way a modal dialog would.

use std::time::Duration;

use rust_mainloop::native::MainContext;
use rust_mainloop::{EventLoop, LoopOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let context = MainContext::new()?;
    let event_loop = EventLoop::with_context(&context, LoopOptions::new().recursive(true));

    let outer = event_loop.clone();
    event_loop.call_soon(move || {
        println!("opening modal, depth {}", outer.recursion_depth());
        let modal = outer.clone();
        outer.call_later(Duration::from_millis(200), move || {
            println!("closing modal, depth {}", modal.recursion_depth());
            modal.stop();
        });
        if let Err(err) = outer.run() {
            eprintln!("nested run failed: {err}");
        }
        println!("modal closed, outer loop still running: {}", outer.is_running());

        let stopper = outer.clone();
        outer.call_later(Duration::from_millis(100), move || stopper.stop());
    });

    event_loop.run_forever()?;
    println!("done");
    Ok(())
}
