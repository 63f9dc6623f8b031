// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer message payloads received in reply to our requests, plus the
//! unsolicited failure notifications.

use bytes::Bytes;

use crate::{
    error::Result,
    messages::{
        ToMessage,
        codes::PeerCode,
        framing::{Message, MessageBuilder, MessageReader},
    },
};

/// One attribute of a shared file (bitrate, duration, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttribute {
    pub kind: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub code: u8,
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub name: String,
    pub files: Vec<FileEntry>,
}

fn write_files(mut b: MessageBuilder, files: &[FileEntry]) -> MessageBuilder {
    b = b.write_uint(files.len() as u32);
    for f in files {
        b = b
            .write_byte(f.code)
            .write_string(&f.filename)
            .write_long(f.size as i64)
            .write_string(&f.extension)
            .write_uint(f.attributes.len() as u32);
        for a in &f.attributes {
            b = b.write_uint(a.kind).write_uint(a.value);
        }
    }
    b
}

fn read_files(r: &mut MessageReader) -> Result<Vec<FileEntry>> {
    let count = r.read_uint()? as usize;
    let mut files = Vec::with_capacity(count);
    for _ in 0..count {
        let code = r.read_byte()?;
        let filename = r.read_string()?;
        let size = r.read_long()? as u64;
        let extension = r.read_string()?;
        let attr_count = r.read_uint()? as usize;
        let mut attributes = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            attributes.push(FileAttribute { kind: r.read_uint()?, value: r.read_uint()? });
        }
        files.push(FileEntry { code, filename, size, extension, attributes });
    }
    Ok(files)
}

/// The peer's full shared listing. The payload after the code is
/// zlib-compressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrowseResponse {
    pub directories: Vec<Directory>,
}

impl BrowseResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        r.decompress()?;
        let count = r.read_uint()? as usize;
        let mut directories = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.read_string()?;
            let files = read_files(r)?;
            directories.push(Directory { name, files });
        }
        Ok(Self { directories })
    }

    pub fn encode(&self) -> Result<Message> {
        let mut b = MessageBuilder::new(PeerCode::BrowseResponse as u32)
            .write_uint(self.directories.len() as u32);
        for d in &self.directories {
            b = write_files(b.write_string(&d.name), &d.files);
        }
        Ok(b.compress()?.into_message())
    }
}

/// A peer's answer to a search we broadcast. Compressed like the browse
/// listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub username: String,
    pub token: u32,
    pub files: Vec<FileEntry>,
    pub has_free_slot: bool,
    pub upload_speed: u32,
    pub queue_length: u64,
}

impl SearchResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        r.decompress()?;
        let username = r.read_string()?;
        let token = r.read_uint()?;
        let files = read_files(r)?;
        let has_free_slot = r.read_bool()?;
        let upload_speed = r.read_uint()?;
        let queue_length = r.read_long()? as u64;
        Ok(Self { username, token, files, has_free_slot, upload_speed, queue_length })
    }

    pub fn encode(&self) -> Result<Message> {
        let b = MessageBuilder::new(PeerCode::SearchResponse as u32)
            .write_string(&self.username)
            .write_uint(self.token);
        let b = write_files(b, &self.files)
            .write_bool(self.has_free_slot)
            .write_uint(self.upload_speed)
            .write_long(self.queue_length as i64);
        Ok(b.compress()?.into_message())
    }
}

/// The peer's self-description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    pub description: String,
    pub picture: Option<Bytes>,
    pub upload_slots: u32,
    pub queue_length: u32,
    pub has_free_slot: bool,
}

impl InfoResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let description = r.read_string()?;
        let has_picture = r.read_bool()?;
        let picture = if has_picture {
            let len = r.read_uint()? as usize;
            Some(r.read_bytes(len)?)
        } else {
            None
        };
        let upload_slots = r.read_uint()?;
        let queue_length = r.read_uint()?;
        let has_free_slot = r.read_bool()?;
        Ok(Self { description, picture, upload_slots, queue_length, has_free_slot })
    }
}

impl ToMessage for InfoResponse {
    fn to_message(&self) -> Message {
        let mut b = MessageBuilder::new(PeerCode::InfoResponse as u32)
            .write_string(&self.description);
        match &self.picture {
            Some(p) => {
                b = b.write_bool(true).write_uint(p.len() as u32).write_bytes(p);
            },
            None => b = b.write_bool(false),
        }
        b.write_uint(self.upload_slots)
            .write_uint(self.queue_length)
            .write_bool(self.has_free_slot)
            .into_message()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceInQueueResponse {
    pub filename: String,
    pub place: u32,
}

impl PlaceInQueueResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { filename: r.read_string()?, place: r.read_uint()? })
    }
}

impl ToMessage for PlaceInQueueResponse {
    fn to_message(&self) -> Message {
        MessageBuilder::new(PeerCode::PlaceInQueueResponse as u32)
            .write_string(&self.filename)
            .write_uint(self.place)
            .into_message()
    }
}

/// The peer dropped a queued download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFailedResponse {
    pub filename: String,
    pub message: String,
}

impl QueueFailedResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { filename: r.read_string()?, message: r.read_string()? })
    }
}

impl ToMessage for QueueFailedResponse {
    fn to_message(&self) -> Message {
        MessageBuilder::new(PeerCode::QueueFailed as u32)
            .write_string(&self.filename)
            .write_string(&self.message)
            .into_message()
    }
}

/// The peer aborted an upload it had already granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailedResponse {
    pub filename: String,
}

impl UploadFailedResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { filename: r.read_string()? })
    }
}

impl ToMessage for UploadFailedResponse {
    fn to_message(&self) -> Message {
        MessageBuilder::new(PeerCode::UploadFailed as u32)
            .write_string(&self.filename)
            .into_message()
    }
}
