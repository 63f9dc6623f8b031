// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt::Write,
    net::Ipv4Addr,
    sync::atomic::{AtomicU32, Ordering},
};

use md5::{Digest, Md5};
use once_cell::sync::Lazy;

/// Process-wide token source, seeded at a random point so tokens from
/// consecutive runs do not collide on the wire.
static NEXT_TOKEN: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(rand::random()));

/// Yields a client-unique 32-bit token used to correlate responses,
/// transfers and firewall-pierce dial-backs.
pub fn next_token() -> u32 {
    NEXT_TOKEN.fetch_add(1, Ordering::SeqCst)
}

/// Lowercase hex MD5 of `username + password`, sent alongside the plaintext
/// credentials during login.
pub fn credential_hash(username: &str, password: &str) -> String {
    let mut h = Md5::new();
    h.update(username.as_bytes());
    h.update(password.as_bytes());
    let d = h.finalize();

    let mut hex = String::with_capacity(d.len() * 2);
    for byte in d {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }
    hex
}

/// The server serializes IPv4 addresses with the octets reversed relative to
/// their textual order.
pub fn ipv4_from_wire(raw: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(raw[3], raw[2], raw[1], raw[0])
}

pub fn ipv4_to_wire(addr: Ipv4Addr) -> [u8; 4] {
    let o = addr.octets();
    [o[3], o[2], o[1], o[0]]
}
