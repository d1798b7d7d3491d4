//! A line echo server, the same demonstration program as the original
//! source's `main.cpp` (`start`/`echo`/`server`/`main`), rebuilt on this
//! crate's public API.

use std::io::{Read, Write};

use clap::Parser;
use log::info;

use coroutine::net::{TcpListener, TcpStream};

/// Run the coroutine echo server demo.
#[derive(Parser, Debug)]
struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Log level passed to `env_logger` (overridden by `RUST_LOG`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn echo(mut stream: TcpStream) {
    let _ = stream.write_all(b"Hello from server\n");
    let mut buf = [0u8; 1024];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if &buf[..n] == b"quit\n" {
            let _ = stream.write_all(b"GoodBye from server\n");
            break;
        }
        info!("received: {}", String::from_utf8_lossy(&buf[..n]));
        let _ = stream.write_all(&buf[..n]);
    }
}

fn server(port: u16) {
    let listener = TcpListener::bind(("0.0.0.0", port)).expect("failed to bind listener");
    info!("listening on 0.0.0.0:{port}");
    loop {
        match listener.accept() {
            Ok(stream) => {
                coroutine::spawn(move || echo(stream));
            }
            Err(err) => {
                log::warn!("accept failed: {err}");
            }
        }
    }
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()))
        .init();

    coroutine::spawn(move || server(args.port));
    coroutine::run();
}
