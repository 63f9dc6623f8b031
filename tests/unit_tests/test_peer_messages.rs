// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex_literal::hex;
use soulseek_client_rs::messages::{
    ConnectionType, ToMessage,
    framing::{Message, MessageReader},
    peer::{
        init::{InboundInit, PeerInit, PierceFirewall},
        responses::{
            BrowseResponse, Directory, FileAttribute, FileEntry, SearchResponse,
        },
        transfers::{TransferRequest, TransferResponse},
    },
};

fn raw_reader_for(msg: &Message) -> MessageReader {
    MessageReader::from_raw_frame(msg.to_frame().slice(4..)).expect("raw frame")
}

fn reader_for(msg: &Message) -> MessageReader {
    MessageReader::from_frame(msg.to_frame().slice(4..)).expect("frame")
}

#[test]
fn test_peer_init_wire_bytes() {
    let init = PeerInit {
        username: "me".into(),
        kind: ConnectionType::Peer,
        token: 0x0a0b0c0d,
    };
    // len 16 | code 0x01 | "me" | "P" | token
    assert_eq!(
        init.to_message().to_frame().as_ref(),
        hex!("10000000 01 02000000 6d65 01000000 50 0d0c0b0a")
    );
}

#[test]
fn test_pierce_firewall_wire_bytes() {
    let pf = PierceFirewall { token: 5 };
    assert_eq!(
        pf.to_message().to_frame().as_ref(),
        hex!("05000000 00 05000000")
    );
}

#[test]
fn test_inbound_init_parses_both_kinds() -> Result<()> {
    let init = PeerInit {
        username: "bob".into(),
        kind: ConnectionType::Transfer,
        token: 42,
    };
    match InboundInit::parse(&mut raw_reader_for(&init.to_message()))? {
        InboundInit::PeerInit(pi) => {
            assert_eq!(pi.username, "bob");
            assert_eq!(pi.kind, ConnectionType::Transfer);
            assert_eq!(pi.token, 42);
        },
        other => panic!("wrong parse: {other:?}"),
    }

    let pf = PierceFirewall { token: 99 };
    match InboundInit::parse(&mut raw_reader_for(&pf.to_message()))? {
        InboundInit::PierceFirewall(p) => assert_eq!(p.token, 99),
        other => panic!("wrong parse: {other:?}"),
    }
    Ok(())
}

#[test]
fn test_transfer_request_download_has_no_size() -> Result<()> {
    let req = TransferRequest::new_download(31, "@@music\\song.mp3");
    let parsed = TransferRequest::parse(&mut reader_for(&req.to_message()))?;
    assert_eq!(parsed, req);
    assert_eq!(parsed.size, None);
    Ok(())
}

#[test]
fn test_transfer_request_with_size_round_trip() -> Result<()> {
    let req = TransferRequest {
        direction: soulseek_client_rs::messages::TransferDirection::Upload,
        token: 5,
        filename: "file".into(),
        size: Some(1024),
    };
    let parsed = TransferRequest::parse(&mut reader_for(&req.to_message()))?;
    assert_eq!(parsed.size, Some(1024));
    assert_eq!(parsed.token, 5);
    Ok(())
}

#[test]
fn test_transfer_response_allowed_and_rejected() -> Result<()> {
    let allowed = TransferResponse::Allowed { token: 7, size: 4 };
    let parsed = TransferResponse::parse(&mut reader_for(&allowed.to_message()))?;
    assert_eq!(parsed, allowed);

    let rejected = TransferResponse::Rejected { token: 7, message: "Queued".into() };
    let parsed = TransferResponse::parse(&mut reader_for(&rejected.to_message()))?;
    assert_eq!(parsed, rejected);
    assert_eq!(parsed.token(), 7);
    Ok(())
}

fn sample_files() -> Vec<FileEntry> {
    vec![
        FileEntry {
            code: 1,
            filename: "@@shared\\artist - track.flac".into(),
            size: 31_337_420,
            extension: "flac".into(),
            attributes: vec![
                FileAttribute { kind: 0, value: 1411 },
                FileAttribute { kind: 1, value: 213 },
            ],
        },
        FileEntry {
            code: 1,
            filename: "@@shared\\notes.txt".into(),
            size: 12,
            extension: "txt".into(),
            attributes: vec![],
        },
    ]
}

#[test]
fn test_browse_response_compressed_round_trip() -> Result<()> {
    let listing = BrowseResponse {
        directories: vec![
            Directory { name: "@@shared".into(), files: sample_files() },
            Directory { name: "@@empty".into(), files: vec![] },
        ],
    };
    let msg = listing.encode()?;
    // The wire payload is deflated; it must not contain the plain name.
    assert!(!msg.payload.windows(8).any(|w| w == b"@@shared"));

    let parsed = BrowseResponse::parse(&mut reader_for(&msg))?;
    assert_eq!(parsed, listing);
    Ok(())
}

#[test]
fn test_search_response_compressed_round_trip() -> Result<()> {
    let response = SearchResponse {
        username: "eve".into(),
        token: 3141,
        files: sample_files(),
        has_free_slot: true,
        upload_speed: 125_000,
        queue_length: 7,
    };
    let parsed = SearchResponse::parse(&mut reader_for(&response.encode()?))?;
    assert_eq!(parsed, response);
    Ok(())
}
