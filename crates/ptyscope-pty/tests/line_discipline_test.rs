//! Line discipline behaviour observed directly on a bare PTY pair

#[cfg(unix)]
mod unix_tests {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use ptyscope_pty::PtyPair;
    use std::fs::File;
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    fn open_pair() -> (File, File) {
        let (master, slave, _) = PtyPair::allocate().expect("allocate pty").into_parts();
        let master = File::from(master);
        let slave = File::from(slave);
        for file in [&master, &slave] {
            let flags =
                OFlag::from_bits_truncate(fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
            fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).unwrap();
        }
        (master, slave)
    }

    /// Read until `want` bytes arrived or the timeout passed
    fn read_at_least(file: &mut File, want: usize, timeout: Duration) -> Vec<u8> {
        let start = Instant::now();
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while out.len() < want && start.elapsed() < timeout {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => sleep(Duration::from_millis(10)),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    }

    fn type_bytes(master: &mut File, bytes: &[u8]) {
        for byte in bytes {
            master.write_all(std::slice::from_ref(byte)).unwrap();
        }
    }

    #[test]
    fn partial_line_is_held_until_terminator() {
        let (mut master, mut slave) = open_pair();

        type_bytes(&mut master, b"abc");
        sleep(Duration::from_millis(100));

        let mut buf = [0u8; 16];
        let err = slave.read(&mut buf).expect_err("no complete line yet");
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        type_bytes(&mut master, b"\r");
        let line = read_at_least(&mut slave, 4, Duration::from_secs(2));
        assert_eq!(line, b"abc\n");
    }

    #[test]
    fn carriage_return_is_echoed_as_typed_but_delivered_as_newline() {
        let (mut master, mut slave) = open_pair();

        type_bytes(&mut master, b"hi\r");

        let delivered = read_at_least(&mut slave, 3, Duration::from_secs(2));
        assert_eq!(delivered, b"hi\n");

        let echoed = read_at_least(&mut master, 4, Duration::from_secs(2));
        assert_eq!(echoed, b"hi\r\n");
    }

    #[test]
    fn erase_removes_one_pending_character() {
        let (mut master, mut slave) = open_pair();

        type_bytes(&mut master, b"ab\x7fc\r");

        let delivered = read_at_least(&mut slave, 3, Duration::from_secs(2));
        assert_eq!(delivered, b"ac\n");
    }

    #[test]
    fn cursor_keys_do_not_move_the_edit_point() {
        let (mut master, mut slave) = open_pair();
        let typed = b"world\x1b[D\x1b[Dhello \r";

        type_bytes(&mut master, typed);

        let delivered = read_at_least(&mut slave, typed.len(), Duration::from_secs(2));
        assert_eq!(delivered, b"world\x1b[D\x1b[Dhello \n");
    }
}
