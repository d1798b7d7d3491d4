//! Scenario 4 from the spec: a reader coroutine suspended on a socket
//! that isn't ready yet, woken by the reactor once a peer writes.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use coroutine::net::raw;

#[test]
fn reader_wakes_on_write_then_sees_close() {
    let (a, b) = UnixStream::pair().expect("socket pair");
    a.set_nonblocking(true).expect("nonblocking");
    let a_fd = a.as_raw_fd();

    let results = Rc::new(RefCell::new(Vec::new()));
    let results2 = results.clone();

    coroutine::spawn(move || {
        let mut buf = [0u8; 64];
        let n = raw::recv(a_fd, &mut buf, 0);
        results2.borrow_mut().push(n);
        if n > 0 {
            let n2 = raw::recv(a_fd, &mut buf, 0);
            results2.borrow_mut().push(n2);
        }
    });

    coroutine::spawn(move || {
        coroutine::sleep_ms(5);
        let mut b = b;
        use std::io::Write;
        b.write_all(b"hi").expect("write");
        drop(b);
    });

    coroutine::run();

    let got = results.borrow();
    assert_eq!(got[0], 2, "reader must see the 2 bytes written after waking");
    assert_eq!(got[1], 0, "reader must see EOF once the writer closes");
}
