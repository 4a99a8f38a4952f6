//! Engine-level scenario tests: scripted frames in, observable lines
//! out, no sockets involved.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::handlers;
use crate::state::{ConnId, LinkId};
use crate::store::MemoryStore;

use super::{Engine, Event};

fn test_config() -> Config {
    toml::from_str(
        r#"
        [server]
        name = "hub1.test"
        numeric = "AB"
        network = "Kestrel"

        [history]
        store = "memory"
        federation = true
        timeout_secs = 5

        [[links]]
        name = "hub2.test"
        address = "127.0.0.1:1"
        password = "pw"

        [[links]]
        name = "hub3.test"
        address = "127.0.0.1:2"
        password = "pw"

        [[links]]
        name = "services.test"
        address = "127.0.0.1:3"
        password = "pw"
        "#,
    )
    .unwrap()
}

struct Harness {
    engine: Engine,
    next_conn: ConnId,
    next_link: LinkId,
    _events_rx: mpsc::Receiver<Event>,
}

impl Harness {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(512);
        let engine = Engine::new(test_config(), Arc::new(MemoryStore::new()), events_tx).unwrap();
        Self {
            engine,
            next_conn: 1,
            next_link: 1,
            _events_rx: events_rx,
        }
    }

    fn connect_client(&mut self) -> (ConnId, mpsc::Receiver<String>) {
        let conn = self.next_conn;
        self.next_conn += 1;
        let (tx, rx) = mpsc::channel(256);
        self.engine.handle_event(Event::ClientConnected {
            conn,
            tx,
            host: "client.test".to_owned(),
            ip: "B]AAAB".to_owned(),
            secure: false,
        });
        (conn, rx)
    }

    fn client_line(&mut self, conn: ConnId, line: &str) {
        self.engine.handle_event(Event::ClientLine {
            conn,
            line: line.to_owned(),
        });
    }

    fn register_client(&mut self, nick: &str, caps: &str) -> (ConnId, mpsc::Receiver<String>) {
        let (conn, rx) = self.connect_client();
        if !caps.is_empty() {
            self.client_line(conn, &format!("CAP REQ :{caps}"));
        }
        self.client_line(conn, &format!("NICK {nick}"));
        self.client_line(conn, &format!("USER {nick} 0 * :{nick}"));
        if !caps.is_empty() {
            self.client_line(conn, "CAP END");
        }
        (conn, rx)
    }

    fn open_link(&mut self, server_line: &str) -> (LinkId, mpsc::Receiver<String>) {
        let link = self.next_link;
        self.next_link += 1;
        let (tx, rx) = mpsc::channel(256);
        self.engine.handle_event(Event::LinkOpened {
            link,
            tx,
            outbound: None,
        });
        self.engine.handle_event(Event::LinkLine {
            link,
            line: "PASS :pw".to_owned(),
        });
        self.engine.handle_event(Event::LinkLine {
            link,
            line: server_line.to_owned(),
        });
        (link, rx)
    }

    fn link_line(&mut self, link: LinkId, line: &str) {
        self.engine.handle_event(Event::LinkLine {
            link,
            line: line.to_owned(),
        });
    }
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(line);
    }
    out
}

fn assert_contains(lines: &[String], needle: &str) {
    assert!(
        lines.iter().any(|l| l.contains(needle)),
        "expected a line containing {needle:?} in {lines:#?}"
    );
}

#[test]
fn batch_ids_are_base36() {
    assert_eq!(super::base36(0), "0");
    assert_eq!(super::base36(35), "z");
    assert_eq!(super::base36(36), "10");
}

#[test]
fn registration_produces_welcome() {
    let mut h = Harness::new();
    let (_, mut rx) = h.register_client("alice", "");
    let lines = drain(&mut rx);
    assert_contains(&lines, " 001 alice :Welcome to the Kestrel IRC Network alice");
    assert_contains(&lines, "MSGREFTYPES=timestamp,msgid");
    assert!(h.engine.net.user_by_nick("alice").is_some());
}

#[test]
fn cap_negotiation_defers_registration() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect_client();
    h.client_line(conn, "CAP LS 302");
    h.client_line(conn, "NICK alice");
    h.client_line(conn, "USER alice 0 * :Alice");
    let lines = drain(&mut rx);
    assert_contains(&lines, "CAP * LS");
    assert_contains(&lines, "draft/multiline=max-bytes=4096,max-lines=24");
    assert!(
        !lines.iter().any(|l| l.contains(" 001 ")),
        "registration must wait for CAP END"
    );
    h.client_line(conn, "CAP REQ :batch server-time");
    h.client_line(conn, "CAP END");
    let lines = drain(&mut rx);
    assert_contains(&lines, "CAP alice ACK :batch server-time");
    assert_contains(&lines, " 001 ");
}

#[test]
fn cap_req_is_atomic() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect_client();
    h.client_line(conn, "CAP REQ :batch no-such-capability");
    let lines = drain(&mut rx);
    assert_contains(&lines, "NAK :batch no-such-capability");
    assert!(h.engine.caps_of(conn).is_empty());
}

#[test]
fn link_handshake_and_burst() {
    let mut h = Harness::new();
    let (_, mut arx) = h.register_client("alice", "");
    h.client_line(1, "JOIN #room");
    drain(&mut arx);

    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    let lines = drain(&mut lrx);
    // We answer with our credentials, burst our user and channel, then EB.
    assert_contains(&lines, "PASS :pw");
    assert_contains(&lines, "SERVER hub1.test 1 ");
    assert_contains(&lines, "N alice 1 ");
    assert_contains(&lines, "B #room ");
    assert_contains(&lines, "EB");

    let cd: kestrel_p10::ServerNumeric = "CD".parse().unwrap();
    assert!(h.engine.net.servers.contains_key(&cd));

    h.link_line(link, "CD EB");
    let lines = drain(&mut lrx);
    assert_contains(&lines, "AB EA");
}

#[test]
fn server_numeric_collision_closes_link() {
    let mut h = Harness::new();
    let (_link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut lrx);
    // A second link claiming the same numeric is refused.
    let (_link2, mut lrx2) = h.open_link("SERVER hub3.test 1 100 200 J10 CD]]] :Imposter");
    let lines = drain(&mut lrx2);
    assert_contains(&lines, "ERROR :Server numeric collision: CD");
}

#[test]
fn channel_ts_merge_older_wins() {
    let mut h = Harness::new();
    let (_, mut arx) = h.register_client("alice", "");
    h.client_line(1, "JOIN #c");
    drain(&mut arx);

    let alice = h.engine.net.numeric_by_nick("alice").unwrap();
    {
        let channel = h.engine.net.channels.get_mut("#c").unwrap();
        channel.ts = 1000;
        channel.modes.no_external = true;
        channel.modes.topic_lock = true;
        channel.bans.push("*!*@old.example".to_owned());
    }

    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut lrx);
    h.link_line(link, "CD N bob 1 150 u h2 +i B]AAAB CDAAA :Bob");
    h.link_line(link, "CD B #c 900 +mk key CDAAA:o");

    let channel = h.engine.net.channels.get("#c").unwrap();
    assert_eq!(channel.ts, 900);
    assert!(channel.modes.moderated);
    assert_eq!(channel.modes.key.as_deref(), Some("key"));
    assert!(!channel.modes.no_external, "older TS clears local modes");
    assert!(channel.bans.is_empty(), "older TS clears local bans");

    let bob: kestrel_p10::UserNumeric = "CDAAA".parse().unwrap();
    assert!(channel.member(bob).unwrap().op);
    assert!(
        channel.member(alice).unwrap().is_empty(),
        "local prefixes are stripped by the older TS"
    );
}

#[test]
fn channel_ts_merge_newer_is_ignored() {
    let mut h = Harness::new();
    let (_, mut arx) = h.register_client("alice", "");
    h.client_line(1, "JOIN #c");
    drain(&mut arx);
    let alice = h.engine.net.numeric_by_nick("alice").unwrap();
    {
        let channel = h.engine.net.channels.get_mut("#c").unwrap();
        channel.ts = 1000;
        channel.modes.no_external = true;
    }

    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut lrx);
    h.link_line(link, "CD N bob 1 150 u h2 +i B]AAAB CDAAA :Bob");
    h.link_line(link, "CD B #c 2000 +mk key CDAAA:o");

    let channel = h.engine.net.channels.get("#c").unwrap();
    assert_eq!(channel.ts, 1000);
    assert!(channel.modes.no_external);
    assert!(!channel.modes.moderated);
    let bob: kestrel_p10::UserNumeric = "CDAAA".parse().unwrap();
    assert!(
        channel.member(bob).unwrap().is_empty(),
        "newer TS members arrive without prefixes"
    );
    assert!(channel.member(alice).unwrap().op, "local state kept");
}

#[test]
fn nick_collision_triple_rule() {
    // Different user@host: the later timestamp loses.
    let mut h = Harness::new();
    let (_, mut arx) = h.register_client("alice", "");
    let alice = h.engine.net.numeric_by_nick("alice").unwrap();
    h.engine.net.users.get_mut(&alice).unwrap().nick_ts = 100;
    drain(&mut arx);

    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut lrx);
    h.link_line(link, "CD N alice 1 200 u h2 +i B]AAAB CDAAA :Alice");
    let lines = drain(&mut lrx);
    assert!(h.engine.net.user_by_nick("alice").is_some(), "existing survives");
    assert_contains(&lines, "AB K CDAAA :Nick collision");

    // Different user@host, incoming is older: the existing user dies.
    let mut h = Harness::new();
    let (_, _arx) = h.register_client("alice", "");
    let alice = h.engine.net.numeric_by_nick("alice").unwrap();
    h.engine.net.users.get_mut(&alice).unwrap().nick_ts = 100;
    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut lrx);
    h.link_line(link, "CD N alice 1 50 u h2 +i B]AAAB CDAAA :Alice");
    let lines = drain(&mut lrx);
    assert_contains(&lines, &format!("AB K {alice} :Nick collision"));
    let survivor = h.engine.net.user_by_nick("alice").unwrap();
    assert_eq!(survivor.numeric.to_string(), "CDAAA");

    // Equal timestamps: both die.
    let mut h = Harness::new();
    let (_, _arx) = h.register_client("alice", "");
    let alice = h.engine.net.numeric_by_nick("alice").unwrap();
    h.engine.net.users.get_mut(&alice).unwrap().nick_ts = 100;
    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut lrx);
    h.link_line(link, "CD N alice 1 100 u h2 +i B]AAAB CDAAA :Alice");
    let lines = drain(&mut lrx);
    assert!(h.engine.net.user_by_nick("alice").is_none(), "both are gone");
    assert_contains(&lines, &format!("AB K {alice} :Nick collision"));
    assert_contains(&lines, "AB K CDAAA :Nick collision");
}

#[test]
fn multiline_batch_fans_out_and_hits_the_wire() {
    let mut h = Harness::new();
    let (alice, mut arx) =
        h.register_client("alice", "draft/multiline batch message-tags");
    let (_bob, mut brx) = h.register_client("bob", "draft/multiline batch message-tags");
    h.client_line(alice, "JOIN #room");
    h.client_line(2, "JOIN #room");
    let (_link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut arx);
    drain(&mut brx);
    drain(&mut lrx);

    h.client_line(alice, "BATCH +x draft/multiline #room");
    h.client_line(alice, "@batch=x PRIVMSG #room :first");
    h.client_line(alice, "@batch=x PRIVMSG #room :second");
    h.client_line(alice, "@batch=x;draft/multiline-concat PRIVMSG #room : continued");
    h.client_line(alice, "BATCH -x");

    // The peer sees the four ML frames with open/continue/concat/close
    // markers on a sender-numeric-prefixed id.
    let wire = drain(&mut lrx);
    let ml: Vec<&String> = wire.iter().filter(|l| l.contains(" ML ")).collect();
    assert_eq!(ml.len(), 4, "{wire:#?}");
    assert!(ml[0].contains(" ML +ABAAA") && ml[0].ends_with(":first"));
    assert!(ml[1].contains(" ML ABAAA") && ml[1].ends_with(":second"));
    assert!(ml[2].contains(" ML cABAAA") && ml[2].ends_with(": continued"));
    assert!(ml[3].contains(" ML -ABAAA") && ml[3].ends_with(" :"));

    // A multiline-capable recipient gets a draft/multiline batch whose
    // reassembly is "first\nsecond continued".
    let bob_lines = drain(&mut brx);
    assert_contains(&bob_lines, "BATCH +");
    assert_contains(&bob_lines, "draft/multiline #room");
    assert_contains(&bob_lines, ":first");
    assert_contains(&bob_lines, "draft/multiline-concat");
    assert_contains(&bob_lines, ": continued");
    assert_contains(&bob_lines, "BATCH -");
}

#[test]
fn multiline_batch_enforces_limits() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "batch");
    h.client_line(alice, "JOIN #room");
    drain(&mut arx);

    h.client_line(alice, "BATCH +x draft/multiline #room");
    h.client_line(alice, "BATCH +x draft/multiline #room");
    let lines = drain(&mut arx);
    assert_contains(&lines, "FAIL BATCH BATCH_ALREADY_OPEN");

    h.client_line(alice, "@batch=y PRIVMSG #room :stray");
    let lines = drain(&mut arx);
    assert_contains(&lines, "FAIL BATCH INVALID_BATCH_ID");

    h.client_line(alice, "@batch=x PRIVMSG #other :wrong target");
    let lines = drain(&mut arx);
    assert_contains(&lines, "FAIL BATCH MULTILINE_INVALID_TARGET");

    h.client_line(alice, "BATCH -z");
    let lines = drain(&mut arx);
    assert_contains(&lines, "FAIL BATCH BATCH_ID_MISMATCH");
}

#[test]
fn metadata_query_flows_through_services() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "");
    drain(&mut arx);
    let (link, mut lrx) =
        h.open_link("SERVER services.test 1 100 200 J10 Az]]] +s :Services");
    drain(&mut lrx);
    assert!(h.engine.services.available());

    h.client_line(alice, "METADATA bob GET avatar");
    let wire = drain(&mut lrx);
    assert_contains(&wire, "AB MDQ bob avatar");

    // Services answer with a compressed pass-through value.
    let plain = "HELLO AVATAR VALUE";
    let compressed = zstd::stream::encode_all(plain.as_bytes(), 3).unwrap();
    let b64 = B64.encode(&compressed);
    h.link_line(link, &format!("Az MD bob avatar * Z :{b64}"));

    let lines = drain(&mut arx);
    assert_contains(&lines, &format!("METADATA bob KEY avatar * :{plain}"));

    // Stored as-is, compression flag intact.
    let entry = h
        .engine
        .metadata
        .get("bob", "avatar", h.engine.now())
        .unwrap();
    assert!(entry.compressed);
    assert_eq!(entry.value, b64);
}

#[test]
fn metadata_timeout_reports_unavailable() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "");
    let (_link, mut lrx) =
        h.open_link("SERVER services.test 1 100 200 J10 Az]]] +s :Services");
    drain(&mut arx);
    drain(&mut lrx);

    h.client_line(alice, "METADATA bob GET avatar");
    let expire_at = h.engine.now() + 60;
    handlers::expire_pending(&mut h.engine, expire_at);
    let lines = drain(&mut arx);
    assert_contains(&lines, "FAIL METADATA TEMPORARILY_UNAVAILABLE bob avatar");
    assert!(h.engine.pending.is_empty());
}

#[test]
fn chathistory_federation_merges_and_dedups() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "batch server-time message-tags");
    h.client_line(alice, "JOIN #room");
    h.client_line(alice, "PRIVMSG #room :local message");
    drain(&mut arx);

    let (cd, mut cdrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    let (ef, mut efrx) = h.open_link("SERVER hub3.test 1 100 200 J10 EF]]] :Hub three");
    drain(&mut cdrx);
    drain(&mut efrx);

    h.client_line(alice, "CHATHISTORY LATEST #room * 50");
    let q_cd = drain(&mut cdrx);
    let q_ef = drain(&mut efrx);
    assert_contains(&q_cd, "AB CH Q #room L * 50 AB1");
    assert_contains(&q_ef, "AB CH Q #room L * 50 AB1");

    h.link_line(cd, "CD CH R AB1 CD-1-1 1500 0 bob!u@h2 * :from peer");
    h.link_line(cd, "CD CH E AB1 1");
    assert!(!h.engine.pending.is_empty(), "one peer still outstanding");
    h.link_line(ef, "EF CH E AB1 0");

    let lines = drain(&mut arx);
    assert_contains(&lines, "chathistory #room");
    assert_contains(&lines, ":from peer");
    assert_contains(&lines, ":local message");
    let peer_pos = lines.iter().position(|l| l.contains(":from peer")).unwrap();
    let local_pos = lines.iter().position(|l| l.contains(":local message")).unwrap();
    assert!(peer_pos < local_pos, "rows stream in timestamp order");

    // Late rows find no pending entry and vanish.
    h.link_line(cd, "CD CH R AB1 CD-1-9 1600 0 bob!u@h2 * :late");
    assert!(drain(&mut arx).is_empty());
}

#[test]
fn markread_is_monotonic() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "draft/read-marker");
    let numeric = h.engine.net.numeric_by_nick("alice").unwrap();
    handlers::user::apply_account(&mut h.engine, numeric, Some("alice"));
    drain(&mut arx);

    h.client_line(alice, "MARKREAD #room timestamp=2026-01-01T00:00:10.000Z");
    let lines = drain(&mut arx);
    assert_contains(&lines, "MARKREAD #room timestamp=2026-01-01T00:00:10.000Z");

    // A strictly older set is a no-op answered with the stored value.
    h.client_line(alice, "MARKREAD #room timestamp=2026-01-01T00:00:05.000Z");
    let lines = drain(&mut arx);
    assert_contains(&lines, "MARKREAD #room timestamp=2026-01-01T00:00:10.000Z");
}

#[test]
fn authenticate_star_aborts() {
    let mut h = Harness::new();
    let (conn, mut rx) = h.connect_client();
    h.client_line(conn, "CAP REQ :sasl");
    h.client_line(conn, "AUTHENTICATE *");
    let lines = drain(&mut rx);
    assert_contains(&lines, " 906 ");
}

#[test]
fn sasl_mechanism_broadcast_updates_advertisement() {
    let mut h = Harness::new();
    let (link, mut lrx) =
        h.open_link("SERVER services.test 1 100 200 J10 Az]]] +s :Services");
    drain(&mut lrx);
    h.link_line(link, "Az SA * M :PLAIN,EXTERNAL");
    assert_eq!(h.engine.services.mechs, "PLAIN,EXTERNAL");

    let (conn, mut rx) = h.connect_client();
    h.client_line(conn, "CAP LS 302");
    let lines = drain(&mut rx);
    assert_contains(&lines, "sasl=PLAIN,EXTERNAL");
}

#[test]
fn netsplit_brackets_quits_in_a_batch() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "batch");
    h.client_line(alice, "JOIN #room");
    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    h.link_line(link, "CD N bob 1 150 u h2 +i B]AAAB CDAAA :Bob");
    h.link_line(link, "CDAAA J #room 150");
    drain(&mut arx);
    drain(&mut lrx);

    h.engine.handle_event(Event::LinkClosed {
        link,
        reason: "Read error".to_owned(),
    });

    let lines = drain(&mut arx);
    assert_contains(&lines, "BATCH +");
    assert_contains(&lines, "netsplit hub1.test hub2.test");
    assert_contains(&lines, "QUIT :hub1.test hub2.test");
    assert_contains(&lines, "BATCH -");
    let quit = lines.iter().find(|l| l.contains("QUIT")).unwrap();
    assert!(quit.contains("@"), "quit carries the batch tag: {quit}");

    let cd: kestrel_p10::ServerNumeric = "CD".parse().unwrap();
    assert!(!h.engine.net.servers.contains_key(&cd));
    assert!(h.engine.net.user_by_nick("bob").is_none());
}

#[test]
fn setname_updates_and_notifies() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "setname");
    let (_bob, mut brx) = h.register_client("bob", "setname");
    h.client_line(alice, "JOIN #room");
    h.client_line(2, "JOIN #room");
    drain(&mut arx);
    drain(&mut brx);

    h.client_line(alice, "SETNAME :Alice the Brave");
    let bob_lines = drain(&mut brx);
    assert_contains(&bob_lines, "SETNAME :Alice the Brave");
    let user = h.engine.net.user_by_nick("alice").unwrap();
    assert_eq!(user.realname, "Alice the Brave");
}

#[test]
fn redact_window_applies_to_authors() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "");
    let (_bob, mut brx) = h.register_client("bob", "draft/message-redaction");
    h.client_line(alice, "JOIN #room");
    h.client_line(2, "JOIN #room");
    h.client_line(alice, "PRIVMSG #room :oops wrong channel");
    drain(&mut brx);
    let rows = crate::history::load(h.engine.kv.as_ref(), "#room");
    assert_eq!(rows.len(), 1);
    let msgid = rows[0].msgid.clone();
    drain(&mut arx);

    // Alice is a channel op here, so the redact is allowed regardless
    // of the window; drop her ops to test the author window.
    let alice_numeric = h.engine.net.numeric_by_nick("alice").unwrap();
    if let Some(channel) = h.engine.net.channels.get_mut("#room") {
        channel.members.insert(alice_numeric, Default::default());
    }

    h.client_line(alice, &format!("REDACT #room {msgid} :typo"));
    drain(&mut arx);
    let bob_lines = drain(&mut brx);
    assert_contains(&bob_lines, &format!("REDACT #room {msgid} :typo"));
    assert!(crate::history::load(h.engine.kv.as_ref(), "#room").is_empty());

    // Unknown ids answer UNKNOWN_MSGID.
    h.client_line(alice, "REDACT #room AB-0-999 :nope");
    let lines = drain(&mut arx);
    assert_contains(&lines, "FAIL REDACT UNKNOWN_MSGID");
}

#[test]
fn rename_migrates_channel_state() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "draft/channel-rename");
    let (_bob, mut brx) = h.register_client("bob", "");
    h.client_line(alice, "JOIN #old");
    h.client_line(2, "JOIN #old");
    h.client_line(alice, "TOPIC #old :the topic");
    drain(&mut arx);
    drain(&mut brx);

    h.client_line(alice, "RENAME #old #new :fresh start");
    let alice_lines = drain(&mut arx);
    assert_contains(&alice_lines, "RENAME #old #new :fresh start");
    // Emulation for the cap-less member: PART + JOIN + state resend.
    let bob_lines = drain(&mut brx);
    assert_contains(&bob_lines, "PART #old");
    assert_contains(&bob_lines, "JOIN #new");
    assert_contains(&bob_lines, ":the topic");

    assert!(h.engine.net.channels.get("#old").is_none());
    let renamed = h.engine.net.channels.get("#new").unwrap();
    assert_eq!(renamed.members.len(), 2);
    assert_eq!(renamed.topic.as_ref().unwrap().text, "the topic");

    // Renaming onto an existing name is refused.
    h.client_line(alice, "JOIN #third");
    h.client_line(alice, "RENAME #new #third :collide");
    let lines = drain(&mut arx);
    assert_contains(&lines, "FAIL RENAME CHANNEL_NAME_IN_USE");
}

#[test]
fn away_star_and_presence_forms() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "");
    let (_bob, mut brx) = h.register_client("bob", "away-notify");
    h.client_line(alice, "JOIN #room");
    h.client_line(2, "JOIN #room");
    drain(&mut arx);
    drain(&mut brx);

    h.client_line(alice, "AWAY :gone fishing");
    let lines = drain(&mut arx);
    assert_contains(&lines, " 306 ");
    let bob_lines = drain(&mut brx);
    assert_contains(&bob_lines, "AWAY :gone fishing");

    h.client_line(alice, "AWAY");
    let lines = drain(&mut arx);
    assert_contains(&lines, " 305 ");

    let user = h.engine.net.user_by_nick("alice").unwrap();
    assert_eq!(user.away, crate::state::AwayState::Present);
}

#[test]
fn labeled_command_with_no_output_gets_ack() {
    let mut h = Harness::new();
    let (alice, mut arx) = h.register_client("alice", "labeled-response batch");
    drain(&mut arx);
    // PONG produces no reply; the label comes back on a bare ACK.
    h.client_line(alice, "@label=xyz PONG :ignored");
    let lines = drain(&mut arx);
    assert_eq!(lines.len(), 1, "{lines:#?}");
    assert!(lines[0].contains("label=xyz"));
    assert!(lines[0].contains("ACK"));
}

#[test]
fn unknown_s2s_tokens_are_dropped() {
    let mut h = Harness::new();
    let (link, mut lrx) = h.open_link("SERVER hub2.test 1 100 200 J10 CD]]] :Hub two");
    drain(&mut lrx);
    h.link_line(link, "CD XY some params :here");
    // The link survives and keeps working.
    h.link_line(link, "CD G ping");
    let lines = drain(&mut lrx);
    assert_contains(&lines, "AB Z AB ping");
}
