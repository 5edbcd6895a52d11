//! TCP echo server on the event loop.
//!
//! Run with `cargo run --example echo_server -- 127.0.0.1:7000`, stop with
//! Ctrl-C.

use std::net::TcpListener;

use rust_mainloop::{get_event_loop, Error, EventLoop};

async fn serve_client(event_loop: EventLoop, stream: std::net::TcpStream) {
    loop {
        let chunk = match event_loop.sock_recv(&stream, 4096).await {
            Ok(chunk) if chunk.is_empty() => return,
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, "recv failed");
                return;
            }
        };
        if let Err(err) = event_loop.sock_sendall(&stream, &chunk).await {
            tracing::warn!(error = %err, "send failed");
            return;
        }
    }
}

async fn accept_loop(event_loop: EventLoop, listener: TcpListener) {
    loop {
        match event_loop.sock_accept(&listener).await {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "client connected");
                event_loop.spawn(serve_client(event_loop.clone(), stream));
            }
            Err(err) => tracing::warn!(error = %err, "accept failed"),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string());
    let listener = TcpListener::bind(&addr)?;
    tracing::info!(%addr, "echo server listening");

    let event_loop = get_event_loop()?;
    event_loop.spawn(accept_loop(event_loop.clone(), listener));
    match event_loop.run_forever() {
        Err(Error::Interrupted) => tracing::info!("interrupted, shutting down"),
        other => other?,
    }
    event_loop.close()?;
    Ok(())
}
