//! Scenario 5 from the spec: a listener coroutine accepts one
//! connection and echoes back whatever it receives, except for a
//! "quit\n" sentinel, which gets a goodbye reply followed by a close.
//!
//! The client side runs on a real OS thread using blocking `std::net`,
//! not a second coroutine: this runtime is single-threaded and
//! cooperative, so a coroutine that did a blocking connect/read would
//! starve the one thread the server coroutine needs to run on.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::rc::Rc;
use std::thread;

use coroutine::net::TcpListener;

#[test]
fn accept_then_echo_round_trip() {
    // `TcpListener` doesn't expose `local_addr`, so this test binds a
    // fixed loopback port rather than an ephemeral one.
    let listener = TcpListener::bind("127.0.0.1:18901").expect("bind");

    let received = Rc::new(RefCell::new(Vec::new()));
    let received2 = received.clone();

    coroutine::spawn(move || {
        let mut stream = listener.accept().expect("accept");
        let mut buf = [0u8; 64];
        loop {
            let n = stream.read(&mut buf).expect("read");
            if n == 0 {
                break;
            }
            received2.borrow_mut().extend_from_slice(&buf[..n]);
            if &buf[..n] == b"quit\n" {
                stream.write_all(b"GoodBye from server\n").expect("goodbye write");
                break;
            }
            stream.write_all(&buf[..n]).expect("echo write");
        }
    });

    let client = thread::spawn(|| {
        let mut stream = StdTcpStream::connect("127.0.0.1:18901").expect("client connect");
        let mut buf = [0u8; 64];

        stream.write_all(b"ping\n").expect("client write ping");
        let n = stream.read(&mut buf).expect("client read echo");
        assert_eq!(&buf[..n], b"ping\n");

        stream.write_all(b"quit\n").expect("client write quit");
        let n = stream.read(&mut buf).expect("client read goodbye");
        assert_eq!(&buf[..n], b"GoodBye from server\n");

        let n = stream.read(&mut buf).expect("client read after close");
        assert_eq!(n, 0, "server must close the connection after the goodbye");
    });

    coroutine::run();
    client.join().expect("client thread panicked");

    assert_eq!(&received.borrow()[..], b"ping\nquit\n");
}
