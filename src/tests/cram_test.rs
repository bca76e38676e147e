use std::thread;

use fnv::FnvHashMap;
use test_env_log::test;

use crate::riffle::common::ERR_CONNECTION_CLOSED;
use crate::riffle::proto::{cram_client, cram_server, Arg, Field};
use crate::tests::common::{connection_pair, encode_with};

fn pwdb() -> FnvHashMap<String, String> {
    let mut db = FnvHashMap::default();
    db.insert("foo".to_string(), "secret".to_string());
    db.insert(
        "longfellow".to_string(),
        "a password stretched well past the sixty-four byte secret block size".to_string(),
    );
    db
}

#[test]
fn test_auth_happy_path() {
    let (mut client, mut server) = connection_pair();
    let handle = thread::spawn(move || {
        let db = pwdb();
        cram_server(&mut server, &db)
    });

    let message = cram_client(&mut client, "foo", "secret").unwrap();
    assert_eq!(message, None);

    let user = handle.join().unwrap().unwrap();
    assert_eq!(user.as_deref(), Some("foo"));
}

#[test]
fn test_auth_with_long_password() {
    let (mut client, mut server) = connection_pair();
    let handle = thread::spawn(move || {
        let db = pwdb();
        cram_server(&mut server, &db)
    });

    let message = cram_client(
        &mut client,
        "longfellow",
        "a password stretched well past the sixty-four byte secret block size",
    )
    .unwrap();
    assert_eq!(message, None);
    assert_eq!(handle.join().unwrap().unwrap().as_deref(), Some("longfellow"));
}

#[test]
fn test_auth_wrong_password() {
    let (mut client, mut server) = connection_pair();
    let handle = thread::spawn(move || {
        let db = pwdb();
        cram_server(&mut server, &db)
    });

    let message = cram_client(&mut client, "foo", "wrong").unwrap();
    assert_eq!(message.as_deref(), Some("Password incorrect"));
    assert_eq!(handle.join().unwrap().unwrap(), None);
}

#[test]
fn test_auth_unknown_user() {
    let (mut client, mut server) = connection_pair();
    let handle = thread::spawn(move || {
        let db = pwdb();
        cram_server(&mut server, &db)
    });

    let message = cram_client(&mut client, "nobody", "secret").unwrap();
    assert_eq!(message.as_deref(), Some("Username not found"));
    assert_eq!(handle.join().unwrap().unwrap(), None);
}

#[test]
fn test_auth_failure_encoding() {
    // The failure tuple a rejected client sees, byte for byte.
    assert_eq!(
        encode_with(|c| c.write_tuple(
            "w(c)",
            &[
                Arg::Word(Some("failure")),
                Arg::Cstring(Some("Password incorrect")),
            ],
        )),
        b"( failure ( 18:Password incorrect ) ) "
    );
}

#[test]
fn test_auth_malformed_client_response() {
    let (mut client, mut server) = connection_pair();
    let handle = thread::spawn(move || {
        let db = pwdb();
        cram_server(&mut server, &db)
    });

    // Drive the client side by hand: read the challenge, then reply with a
    // string that has no user/digest separator.
    let fields = client.read_tuple("w(?c)").unwrap();
    let challenge = match fields.as_slice() {
        [Field::Word(Some(step)), Field::Cstring(Some(challenge))] => {
            assert_eq!(step, "step");
            challenge.clone()
        }
        other => panic!("unexpected challenge tuple {:?}", other),
    };
    assert!(challenge.starts_with('<') && challenge.ends_with('>'));
    assert!(challenge.contains('.') && challenge.contains('@'));

    client.write_cstring("nospacedigest").unwrap();
    client.flush().unwrap();

    let fields = client.read_tuple("w(?c)").unwrap();
    assert_eq!(
        fields,
        vec![
            Field::Word(Some("failure".to_string())),
            Field::Cstring(Some(
                "Malformed client response in authentication".to_string()
            )),
        ]
    );
    assert_eq!(handle.join().unwrap().unwrap(), None);
}

#[test]
fn test_auth_non_string_response_aborts_silently() {
    let (mut client, mut server) = connection_pair();
    let handle = thread::spawn(move || {
        let db = pwdb();
        cram_server(&mut server, &db)
    });

    let _challenge = client.read_tuple("w(?c)").unwrap();
    client.start_list().unwrap();
    client.end_list().unwrap();
    client.flush().unwrap();

    // The server walks away without reporting a failure.
    assert_eq!(handle.join().unwrap().unwrap(), None);

    // Its side of the pipe is gone, so the next read fails cleanly.
    let err = client.read_tuple("w(?c)").unwrap_err();
    assert_eq!(err.code(), ERR_CONNECTION_CLOSED);
}
