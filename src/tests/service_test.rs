use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use test_env_log::test;

use crate::riffle::common::{ERR_CONNECTION_CLOSED, ERR_UNKNOWN_CMD};
use crate::riffle::config::Settings;
use crate::riffle::proto::{cram_client, Connection};
use crate::riffle::server::{Service, Transport};
use crate::tests::common::listen_port;

fn connect(address: &str) -> TcpStream {
    for _ in 0..100 {
        if let Ok(sock) = TcpStream::connect(address) {
            return sock;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("couldn't connect to {}", address);
}

fn start_service(users: &[(&str, &str)]) -> &'static Settings {
    let mut settings = Settings::default();
    settings.host = "127.0.0.1".to_string();
    settings.port = listen_port();
    for (user, password) in users {
        settings
            .users
            .insert(user.to_string(), password.to_string());
    }
    let settings: &'static Settings = Box::leak(Box::new(settings));

    let service = Service::new(settings.listen_address());
    thread::spawn(move || {
        let _ = service.run(settings);
    });
    settings
}

#[test]
#[serial_test::serial]
fn test_service_end_to_end() {
    let settings = start_service(&[("foo", "secret")]);
    let sock = connect(&settings.listen_address());
    let mut conn = Connection::new(Transport::from_tcp(sock), settings.conn_options());

    // Capability exchange, both ways.
    conn.recv_capabilities().unwrap();
    assert!(conn.has_capability("pipelining"));
    conn.send_capabilities(&["edit-pipeline"]).unwrap();

    // The capability list is still buffered; the auth read flushes it.
    assert_eq!(cram_client(&mut conn, "foo", "secret").unwrap(), None);

    conn.write_cmd("ping", "", &[]).unwrap();
    assert_eq!(conn.read_cmd_response("").unwrap(), vec![]);

    conn.write_cmd("wat", "", &[]).unwrap();
    let err = conn.read_cmd_response("").unwrap_err();
    assert_eq!(err.code(), ERR_UNKNOWN_CMD);

    conn.write_cmd("bye", "", &[]).unwrap();
    assert_eq!(conn.read_cmd_response("").unwrap(), vec![]);

    // The server hangs up after the terminating command.
    assert_eq!(
        conn.read_cmd_response("").unwrap_err().code(),
        ERR_CONNECTION_CLOSED
    );
}

#[test]
#[serial_test::serial]
fn test_service_rejects_bad_credentials() {
    let settings = start_service(&[("foo", "secret")]);
    let sock = connect(&settings.listen_address());
    let mut conn = Connection::new(Transport::from_tcp(sock), settings.conn_options());

    conn.recv_capabilities().unwrap();
    conn.send_capabilities(&[]).unwrap();

    let message = cram_client(&mut conn, "foo", "hunter2").unwrap();
    assert_eq!(message.as_deref(), Some("Password incorrect"));
}

#[test]
#[serial_test::serial]
fn test_service_without_user_db_skips_auth() {
    let settings = start_service(&[]);
    let sock = connect(&settings.listen_address());
    let mut conn = Connection::new(Transport::from_tcp(sock), settings.conn_options());

    conn.recv_capabilities().unwrap();
    conn.send_capabilities(&[]).unwrap();

    conn.write_cmd("ping", "", &[]).unwrap();
    assert_eq!(conn.read_cmd_response("").unwrap(), vec![]);

    conn.write_cmd("bye", "", &[]).unwrap();
    assert_eq!(conn.read_cmd_response("").unwrap(), vec![]);
}
