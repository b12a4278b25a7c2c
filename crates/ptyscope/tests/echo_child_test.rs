//! Line discipline effects as reported by the bundled echo-stdin-json child

#[cfg(unix)]
mod unix_tests {
    use ptyscope_pty::{
        AsyncPtyMaster, ChildCommand, ChildExit, MasterReader, PtyPair, Script, SessionBuilder,
        SessionReport,
    };
    use ptyscope_test_utils::{init_test_logging, CaptureSink, OUTPUT_TIMEOUT};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const ECHO_CHILD: &str = env!("CARGO_BIN_EXE_echo-stdin-json");

    fn echo_child() -> ChildCommand {
        ChildCommand::new(ECHO_CHILD).expect("valid command")
    }

    /// Run `script` against the echo child; the script must end the child itself.
    async fn run_script(script: &[u8]) -> (SessionReport, String) {
        init_test_logging();
        let sink = CaptureSink::new();
        let mut supervisor = SessionBuilder::new()
            .command(echo_child())
            .script(Script::from_bytes(script))
            .keystroke_delay(Duration::from_millis(2))
            .build();

        let report = timeout(OUTPUT_TIMEOUT, supervisor.run(sink.clone()))
            .await
            .expect("session finished")
            .expect("session ran");
        (report, sink.text())
    }

    #[tokio::test]
    async fn test_carriage_return_delivered_as_newline() {
        // ctrl+d on an empty line is end-of-file for the child.
        let (report, output) = run_script(b"hi\r\x04").await;

        assert_eq!(report.exit, ChildExit::Exited(0));
        let echo = output.find("hi\r\n").expect("echo keeps the typed return");
        let delivered = output
            .find(r#"[echo-stdin-json][stdin]: "hi\n""#)
            .expect("child reads a newline");
        assert!(echo < delivered, "output: {output:?}");
    }

    #[tokio::test]
    async fn test_erase_never_reaches_child() {
        let (report, output) = run_script(b"ab\x7fc\r\x04").await;

        assert!(report.exit.success());
        assert!(
            output.contains(r#"[echo-stdin-json][stdin]: "ac\n""#),
            "output: {output:?}"
        );
    }

    #[tokio::test]
    async fn test_cursor_keys_delivered_literally() {
        let (report, output) = run_script(b"world\x1b[D\x1b[Dhello \r\x04").await;

        assert!(report.exit.success());
        assert!(
            output.contains(r#"[echo-stdin-json][stdin]: "world\u001b[D\u001b[Dhello \n""#),
            "output: {output:?}"
        );
    }

    #[tokio::test]
    async fn test_partial_line_not_delivered() {
        init_test_logging();
        let pty = PtyPair::allocate().unwrap();
        let (child, master) = echo_child().spawn(pty).unwrap();
        let master = Arc::new(AsyncPtyMaster::new(master).unwrap());
        let sink = CaptureSink::new();
        let reader = MasterReader::spawn(master.clone(), sink.clone(), Duration::from_millis(20));

        master.write_all(b"abc").await.unwrap();
        sink.wait_for("abc", OUTPUT_TIMEOUT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sink.contains("[stdin]"), "output: {:?}", sink.text());

        master.write_all(b"\r").await.unwrap();
        sink.wait_for(r#"[stdin]: "abc\n""#, OUTPUT_TIMEOUT)
            .await
            .unwrap();

        master.write_all(b"\x04").await.unwrap();
        let exit = timeout(OUTPUT_TIMEOUT, child.wait()).await.unwrap().unwrap();
        assert_eq!(exit, ChildExit::Exited(0));
        reader.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_interrupt_is_a_signal_not_input() {
        init_test_logging();
        let pty = PtyPair::allocate().unwrap();
        let (child, master) = echo_child().spawn(pty).unwrap();
        let master = Arc::new(AsyncPtyMaster::new(master).unwrap());
        let sink = CaptureSink::new();
        let reader = MasterReader::spawn(master.clone(), sink.clone(), Duration::from_millis(20));

        // Wait for the first report so the child's handler is known to be installed.
        master.write_all(b"ready\r").await.unwrap();
        sink.wait_for(r#"[stdin]: "ready\n""#, OUTPUT_TIMEOUT)
            .await
            .unwrap();

        master.write_all(b"\x03").await.unwrap();
        let exit = timeout(OUTPUT_TIMEOUT, child.wait()).await.unwrap().unwrap();
        assert_eq!(exit, ChildExit::Exited(0));

        let report = reader.stop(Duration::from_secs(1)).await;
        let output = sink.text();
        assert!(output.contains("[echo-stdin-json][signal]: SIGINT (2)"));
        assert!(!output.contains(r#"\u0003"#), "interrupt leaked as input");
        assert_eq!(report.bytes_forwarded as usize, output.len());
    }

    #[tokio::test]
    async fn test_demo_script_end_to_end() {
        let (report, output) = run_script(Script::demo().as_bytes()).await;

        assert!(report.injected.completed());
        assert_eq!(report.exit, ChildExit::Exited(0));
        assert!(output.contains(r#"[echo-stdin-json][stdin]: "hello world\n""#));
        assert!(output.contains(r#"[echo-stdin-json][stdin]: "中文\n""#));
        assert!(output.contains(r#"hello world!\n""#), "erase applied");
        assert!(output.contains("[echo-stdin-json][signal]: SIGINT (2)"));
    }
}
