//! Length-prefixed echo client with reconnect.
//!
//! Sends "hello" once a second and prints the replies. If the server goes
//! away the connection retries every 500ms.
//!
//! Usage: echo-client [port]

use std::sync::atomic::Ordering;
use std::time::Duration;

use kiln::config::LoggingConfig;
use kiln::{logging, signal, ConnState, EventLoop, LengthCodec, TcpConn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&LoggingConfig::default());
    let shutdown = signal::install_shutdown_handler();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(2099);

    let event_loop = EventLoop::new()?;
    let conn = TcpConn::connect_with(&event_loop, "127.0.0.1", port, 3000, "");
    conn.set_reconnect_interval(500);
    conn.set_message_callback(Box::new(LengthCodec::default()), |_c, payload| {
        tracing::info!(reply = %String::from_utf8_lossy(payload), "received");
    });
    conn.set_state_callback(|c| match c.state() {
        ConnState::Connected => c.send_msg(b"hello"),
        state => tracing::info!(?state, "state changed"),
    });

    {
        let conn = conn.clone();
        event_loop.schedule_every(1000, 1000, move |_| {
            if conn.state() == ConnState::Connected {
                conn.send_msg(b"hello");
            }
        });
    }

    let handle = event_loop.handle();
    std::thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
        handle.exit();
    });
    event_loop.run();
    Ok(())
}
