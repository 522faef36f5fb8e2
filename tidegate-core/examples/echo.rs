//! Echo server and client example for Tidegate.
//!
//! This example starts the engine, binds an echo listener on a loopback
//! port, connects a client through the same engine and round-trips a few
//! framed messages with compression enabled.

use anyhow::Result;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tidegate_core::{Engine, EngineConfig, EngineHandle, EventHandler, Socket};

/// Server side: frames that arrive are sent straight back.
struct EchoServer {
    handle: EngineHandle,
}

impl EventHandler for EchoServer {
    fn on_connected(&self, socket: &Arc<Socket>) {
        println!("server: connection from {:?}", socket.peer_addr());
    }

    fn on_message(&self, socket: &Arc<Socket>, payload: Vec<u8>) {
        println!("server: echoing {} bytes", payload.len());
        if let Err(e) = self.handle.send(socket, &payload) {
            eprintln!("server: echo failed: {}", e);
        }
    }

    fn on_closed(&self, socket: &Arc<Socket>) {
        println!("server: {:?} disconnected", socket.peer_addr());
    }
}

/// Client side: sends a greeting on connect and reports each echo.
struct EchoClient {
    handle: EngineHandle,
    done: Sender<Vec<u8>>,
}

impl EventHandler for EchoClient {
    fn on_connected(&self, socket: &Arc<Socket>) {
        println!("client: connected, sending greeting");
        if let Err(e) = self.handle.send(socket, b"hello from the tidegate client") {
            eprintln!("client: send failed: {}", e);
        }
    }

    fn on_message(&self, _socket: &Arc<Socket>, payload: Vec<u8>) {
        let _ = self.done.send(payload);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = EngineConfig {
        enable_compression: true,
        ..Default::default()
    };

    println!("Starting engine...");
    let engine = Engine::start(config)?;
    let handle = engine.handle();

    let listener = engine.listen(
        "127.0.0.1:0".parse()?,
        Arc::new(EchoServer {
            handle: handle.clone(),
        }),
    )?;
    println!("Echo server listening on {}", listener.local_addr());

    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let client = engine.connect(
        listener.local_addr(),
        Arc::new(EchoClient {
            handle: handle.clone(),
            done: done_tx,
        }),
    )?;

    let echoed = done_rx.recv_timeout(Duration::from_secs(5))?;
    println!("client: received echo: {:?}", String::from_utf8_lossy(&echoed));

    // A bigger, compressible payload.
    let bulk: Vec<u8> = (0..100_000u32).map(|i| (i % 31) as u8).collect();
    handle.send(&client, &bulk)?;
    let echoed = done_rx.recv_timeout(Duration::from_secs(5))?;
    println!("client: bulk echo of {} bytes verified: {}", echoed.len(), echoed == bulk);

    let stats = engine.stats();
    println!(
        "stats: {} accepted, {} messages in, {} messages out, {} bytes on the wire",
        stats.connections_accepted, stats.messages_received, stats.messages_sent, stats.bytes_sent
    );

    Ok(())
}
