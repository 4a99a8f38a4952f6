//! End-to-end smoke test: spawn a kestreld instance, register a client
//! over TCP, and exercise the basic command surface.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

struct TestServer {
    child: Child,
    port: u16,
    _dir: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    listener.local_addr().expect("probe addr").port()
}

fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = free_port();
    let config = format!(
        r#"
        [server]
        name = "smoke.test"
        numeric = "AB"
        network = "SmokeNet"

        [listen]
        client = ["127.0.0.1:{port}"]

        [history]
        store = "memory"
        federation = false
        "#
    );
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, config).expect("write config");

    let child = Command::new(env!("CARGO_BIN_EXE_kestreld"))
        .arg("-c")
        .arg(&config_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn kestreld");
    TestServer {
        child,
        port,
        _dir: dir,
    }
}

struct TestClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TestClient {
    fn connect(port: u16) -> TestClient {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .expect("read timeout");
                    let reader = BufReader::new(stream.try_clone().expect("clone stream"));
                    return TestClient {
                        reader,
                        writer: stream,
                    };
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => panic!("server never came up: {e}"),
            }
        }
    }

    fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .expect("write");
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read");
        line.trim_end().to_owned()
    }

    /// Read until a line contains `needle`, panicking after `max` lines.
    fn expect(&mut self, needle: &str, max: usize) -> String {
        for _ in 0..max {
            let line = self.read_line();
            if line.contains(needle) {
                return line;
            }
        }
        panic!("never saw {needle:?}");
    }
}

#[test]
fn register_join_and_message() {
    let server = spawn_server();
    let mut alice = TestClient::connect(server.port);

    alice.send("CAP LS 302");
    alice.send("NICK alice");
    alice.send("USER alice 0 * :Alice Smoke");
    alice.expect("CAP * LS", 10);
    alice.send("CAP REQ :server-time message-tags echo-message");
    alice.expect("ACK", 10);
    alice.send("CAP END");
    alice.expect(" 001 alice ", 10);
    alice.expect("MSGREFTYPES", 20);

    alice.send("JOIN #smoke");
    alice.expect("JOIN #smoke", 10);
    alice.expect("End of /NAMES list", 10);

    // echo-message returns our own PRIVMSG, tagged.
    alice.send("PRIVMSG #smoke :hello there");
    let echo = alice.expect("PRIVMSG #smoke :hello there", 10);
    assert!(echo.contains("msgid="), "echo carries a msgid: {echo}");

    alice.send("TOPIC #smoke :the smoke topic");
    alice.expect("TOPIC #smoke :the smoke topic", 10);
    alice.send("TOPIC #smoke");
    alice.expect("the smoke topic", 10);

    alice.send("PING :liveness");
    alice.expect("PONG", 10);

    alice.send("QUIT :done");
    alice.expect("ERROR", 10);
}

#[test]
fn two_clients_share_a_channel() {
    let server = spawn_server();
    let mut alice = TestClient::connect(server.port);
    alice.send("NICK alice");
    alice.send("USER alice 0 * :Alice");
    alice.expect(" 001 ", 20);
    alice.send("JOIN #shared");
    alice.expect("End of /NAMES list", 10);

    let mut bob = TestClient::connect(server.port);
    bob.send("NICK bob");
    bob.send("USER bob 0 * :Bob");
    bob.expect(" 001 ", 20);
    bob.send("JOIN #shared");
    bob.expect("End of /NAMES list", 10);

    // Alice sees bob arrive, then his message.
    alice.expect(":bob!bob@", 10);
    bob.send("PRIVMSG #shared :hi alice");
    let msg = alice.expect("PRIVMSG #shared :hi alice", 10);
    assert!(msg.starts_with(":bob!bob@"), "{msg}");

    // Nick change is visible across the channel.
    bob.send("NICK robert");
    alice.expect("NICK :robert", 10);

    // A duplicate nick is refused.
    bob.send("NICK alice");
    bob.expect(" 433 ", 10);
}
