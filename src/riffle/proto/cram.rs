use chrono::Utc;
use crypto::digest::Digest;
use crypto::md5::Md5;
use crypto::util::fixed_time_eq;
use fnv::FnvHashMap;
use tracing::debug;

use crate::riffle::common::{hostname, Error, Result};
use crate::riffle::proto::connection::Connection;
use crate::riffle::proto::item::Item;
use crate::riffle::proto::tuple::{Arg, Field};

const MD5_DIGEST_SIZE: usize = 16;

const USER_NOT_FOUND: &str = "Username not found";
const PASSWORD_INCORRECT: &str = "Password incorrect";
const MALFORMED_CLIENT_RESPONSE: &str = "Malformed client response in authentication";
const INTERNAL_SERVER_ERROR: &str = "Internal server error in authentication";

/// Keyed digest over the challenge: MD5(secret ^ opad, MD5(secret ^ ipad,
/// challenge)), the secret being the password zero-padded to 64 bytes, or
/// its MD5 when longer.
fn compute_digest(challenge: &[u8], password: &str) -> [u8; MD5_DIGEST_SIZE] {
    let mut secret = [0u8; 64];
    let password = password.as_bytes();
    if password.len() <= secret.len() {
        secret[..password.len()].copy_from_slice(password);
    } else {
        let mut md5 = Md5::new();
        md5.input(password);
        md5.result(&mut secret[..MD5_DIGEST_SIZE]);
    }

    let mut digest = [0u8; MD5_DIGEST_SIZE];
    for b in secret.iter_mut() {
        *b ^= 0x36;
    }
    let mut md5 = Md5::new();
    md5.input(&secret);
    md5.input(challenge);
    md5.result(&mut digest);

    for b in secret.iter_mut() {
        *b ^= 0x36 ^ 0x5c;
    }
    let mut md5 = Md5::new();
    md5.input(&secret);
    md5.input(&digest);
    md5.result(&mut digest);
    digest
}

// Strict lowercase hex, matching what compute_digest emits on the wire.
fn hex_decode(hex: &[u8]) -> Option<[u8; MD5_DIGEST_SIZE]> {
    if hex.len() != 2 * MD5_DIGEST_SIZE {
        return None;
    }
    let nibble = |c: u8| match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    };
    let mut digest = [0u8; MD5_DIGEST_SIZE];
    for (i, out) in digest.iter_mut().enumerate() {
        let hi = nibble(hex[2 * i])?;
        let lo = nibble(hex[2 * i + 1])?;
        *out = (hi << 4) | lo;
    }
    Some(digest)
}

fn epoch_micros() -> u64 {
    let now = Utc::now();
    now.timestamp() as u64 * 1_000_000 + now.timestamp_subsec_micros() as u64
}

/// Fail the exchange from the server's perspective.
fn fail(conn: &mut Connection, msg: &str) -> Result<Option<String>> {
    conn.write_tuple("w(c)", &[Arg::Word(Some("failure")), Arg::Cstring(Some(msg))])?;
    conn.flush()?;
    Ok(None)
}

/// Run the server side of the exchange against a user/password database.
/// Returns the authenticated user name, or None when the client was turned
/// away (the failure reason has already been written to the peer).
pub fn cram_server(
    conn: &mut Connection,
    passwords: &FnvHashMap<String, String>,
) -> Result<Option<String>> {
    let host = match hostname() {
        Ok(host) => host,
        Err(_) => return fail(conn, INTERNAL_SERVER_ERROR),
    };
    let nonce: u64 = rand::random();
    let challenge = format!("<{}.{}@{}>", nonce, epoch_micros(), host);
    conn.write_tuple(
        "w(c)",
        &[Arg::Word(Some("step")), Arg::Cstring(Some(challenge.as_str()))],
    )?;

    // The client answers with a single string "<user> <hexdigest>".
    let response = match conn.read_item()? {
        Item::String(s) => s,
        // Not even the right shape; no failure report for this one.
        _ => return Ok(None),
    };
    let sep = match memchr::memrchr(b' ', &response) {
        Some(sep) => sep,
        None => return fail(conn, MALFORMED_CLIENT_RESPONSE),
    };
    let client_digest = match hex_decode(&response[sep + 1..]) {
        Some(digest) => digest,
        None => return fail(conn, MALFORMED_CLIENT_RESPONSE),
    };
    let user = match std::str::from_utf8(&response[..sep]) {
        Ok(user) => user.to_string(),
        Err(_) => return fail(conn, MALFORMED_CLIENT_RESPONSE),
    };

    let password = match passwords.get(&user) {
        Some(password) => password,
        None => return fail(conn, USER_NOT_FOUND),
    };
    let expected = compute_digest(challenge.as_bytes(), password);
    if !fixed_time_eq(&client_digest, &expected) {
        return fail(conn, PASSWORD_INCORRECT);
    }

    debug!(%user, "authentication succeeded");
    conn.write_tuple("w()", &[Arg::Word(Some("success"))])?;
    conn.flush()?;
    Ok(Some(user))
}

/// Run the client side of the exchange. Ok(None) means the server accepted
/// us; Ok(Some(reason)) carries the server's opaque failure reason.
pub fn cram_client(
    conn: &mut Connection,
    user: &str,
    password: &str,
) -> Result<Option<String>> {
    let (status, payload) = read_step(conn)?;
    if status == "failure" {
        if let Some(reason) = payload {
            return Ok(Some(reason));
        }
        return Err(Error::not_authorized(
            "Unexpected server response to authentication",
        ));
    }
    let challenge = match payload {
        Some(challenge) if status == "step" => challenge,
        _ => {
            return Err(Error::not_authorized(
                "Unexpected server response to authentication",
            ))
        }
    };

    let digest = compute_digest(challenge.as_bytes(), password);
    let reply = format!("{} {}", user, hex::encode(digest));
    conn.write_cstring(&reply)?;

    let (status, payload) = read_step(conn)?;
    match (status.as_str(), payload) {
        ("failure", Some(reason)) => Ok(Some(reason)),
        ("success", None) => Ok(None),
        _ => Err(Error::not_authorized(
            "Unexpected server response to authentication",
        )),
    }
}

fn read_step(conn: &mut Connection) -> Result<(String, Option<String>)> {
    let fields = conn.read_tuple("w(?c)")?;
    match fields.as_slice() {
        [Field::Word(Some(status)), Field::Cstring(payload)] => {
            Ok((status.clone(), payload.clone()))
        }
        _ => Err(Error::malformed("Malformed network data")),
    }
}
