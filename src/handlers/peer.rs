// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatch for messages arriving on a peer message connection.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    client::{client::SoulseekClient, connection::Connection},
    error::{Result, SlskError},
    messages::{
        ToMessage, TransferDirection,
        codes::PeerCode,
        framing::MessageReader,
        peer::{
            requests::QueueDownloadRequest,
            responses::{
                BrowseResponse, InfoResponse, PlaceInQueueResponse,
                QueueFailedResponse, SearchResponse, UploadFailedResponse,
            },
            transfers::{REJECTION_FILE_NOT_SHARED, TransferRequest, TransferResponse},
        },
    },
    waiter::WaitKey,
};

pub async fn handle(
    client: &Arc<SoulseekClient>,
    username: &str,
    conn: &Arc<Connection>,
    body: Bytes,
) -> Result<()> {
    let mut r = MessageReader::from_frame(body)?;
    let raw_code = r.code();
    let Some(code) = PeerCode::from_u32(raw_code) else {
        trace!(username, code = raw_code, "unhandled peer message");
        return Ok(());
    };

    match code {
        PeerCode::BrowseResponse => {
            let response = BrowseResponse::parse(&mut r)?;
            let key = WaitKey::new(PeerCode::BrowseResponse as u32).with(username);
            client.waiter().complete(&key, response);
        },
        PeerCode::InfoResponse => {
            let response = InfoResponse::parse(&mut r)?;
            let key = WaitKey::new(PeerCode::InfoResponse as u32).with(username);
            client.waiter().complete(&key, response);
        },
        PeerCode::SearchResponse => {
            let response = SearchResponse::parse(&mut r)?;
            client.deliver_search_response(response);
        },
        PeerCode::TransferResponse => {
            let response = TransferResponse::parse(&mut r)?;
            let key = WaitKey::new(PeerCode::TransferResponse as u32)
                .with(username)
                .with(response.token());
            client.waiter().complete(&key, response);
        },
        PeerCode::TransferRequest => {
            let request = TransferRequest::parse(&mut r)?;
            handle_transfer_request(client, username, conn, request).await?;
        },
        PeerCode::QueueFailed => {
            let failed = QueueFailedResponse::parse(&mut r)?;
            let key = WaitKey::new(PeerCode::TransferRequest as u32)
                .with(username)
                .with(&failed.filename);
            client
                .waiter()
                .throw(&key, SlskError::TransferRejected(failed.message));
        },
        PeerCode::UploadFailed => {
            let failed = UploadFailedResponse::parse(&mut r)?;
            let key = WaitKey::new(PeerCode::TransferRequest as u32)
                .with(username)
                .with(&failed.filename);
            client.waiter().throw(
                &key,
                SlskError::connection(format!(
                    "peer reported the upload of {} failed",
                    failed.filename
                )),
            );
        },
        PeerCode::PlaceInQueueResponse => {
            let response = PlaceInQueueResponse::parse(&mut r)?;
            let key = WaitKey::new(PeerCode::PlaceInQueueResponse as u32)
                .with(username)
                .with(&response.filename);
            client.waiter().complete(&key, response);
        },
        PeerCode::BrowseRequest => {
            // We do not share files; answer with an empty listing.
            let empty = BrowseResponse::default().encode()?;
            conn.write_message(&empty).await?;
        },
        PeerCode::InfoRequest => {
            let info = InfoResponse {
                description: String::new(),
                picture: None,
                upload_slots: 0,
                queue_length: 0,
                has_free_slot: false,
            };
            conn.write_message(&info.to_message()).await?;
        },
        PeerCode::QueueDownload => {
            let req = QueueDownloadRequest::parse(&mut r)?;
            debug!(username, filename = %req.filename, "peer tried to queue a download");
            let reject = QueueFailedResponse {
                filename: req.filename,
                message: REJECTION_FILE_NOT_SHARED.to_string(),
            };
            conn.write_message(&reject.to_message()).await?;
        },
        PeerCode::PlaceInQueueRequest => {
            trace!(username, "place-in-queue request ignored; we run no upload queue");
        },
    }
    Ok(())
}

/// Unsolicited `TransferRequest`s are how queued downloads come alive; the
/// matching download waits on `(code, username, filename)`. Anything we are
/// not waiting for is declined.
async fn handle_transfer_request(
    client: &Arc<SoulseekClient>,
    username: &str,
    conn: &Arc<Connection>,
    request: TransferRequest,
) -> Result<()> {
    if request.direction == TransferDirection::Download {
        // The peer wants a file from us.
        let reject = TransferResponse::Rejected {
            token: request.token,
            message: REJECTION_FILE_NOT_SHARED.to_string(),
        };
        return conn.write_message(&reject.to_message()).await;
    }

    let key = WaitKey::new(PeerCode::TransferRequest as u32)
        .with(username)
        .with(&request.filename);
    let token = request.token;
    if !client.waiter().complete(&key, request) {
        debug!(username, "transfer offer for a download we are not waiting on");
        let reject = TransferResponse::Rejected {
            token,
            message: "Cancelled".to_string(),
        };
        conn.write_message(&reject.to_message()).await?;
    }
    Ok(())
}
