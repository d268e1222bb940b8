//! Length-prefixed echo server.
//!
//! Usage: echo-server [config.toml]

use std::sync::atomic::Ordering;
use std::time::Duration;

use kiln::config::Config;
use kiln::{logging, signal, LengthCodec, LoopGroup, ServerBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(std::path::Path::new(&path))?,
        None => Config::default(),
    };
    logging::init(&config.logging);
    let shutdown = signal::install_shutdown_handler();

    let group =
        LoopGroup::with_task_capacity(config.runtime.loops, config.runtime.task_queue_capacity)?;
    let alloc = group.allocator();
    let handles: Vec<_> = group.handles().to_vec();

    let port = if config.server.port == 0 {
        2099
    } else {
        config.server.port
    };
    let idle = config.connection.idle_seconds;
    let server = ServerBuilder::new(&config.server.host, port)
        .backlog(config.server.backlog)
        .reuse_port(config.server.reuse_port)
        .conn_msg(Box::new(LengthCodec::default()), |conn, payload| {
            tracing::info!(len = payload.len(), peer = %conn.peer_addr(), "echo");
            conn.send_msg(payload);
        })
        .conn_init(move |conn| {
            if idle > 0 {
                conn.add_idle_watch(idle, |c| {
                    tracing::info!(peer = %c.peer_addr(), "idle, closing");
                    c.close();
                });
            }
        })
        .start(&alloc)?;
    tracing::info!(addr = %server.local_addr(), "echo server up");

    std::thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
        for h in &handles {
            h.exit();
        }
    });
    group.run();
    tracing::info!("server exited");
    Ok(())
}
