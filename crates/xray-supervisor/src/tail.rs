// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reverse reader for JSON-lines journals.
//!
//! Journals only grow at the end, so the newest records are found by reading
//! fixed-size blocks backwards from end-of-file and splitting them on newlines
//! from right to left. A line that straddles two blocks is carried over from
//! the more recent block until the block holding its start has been read.

use std::io::{Read, Seek, SeekFrom};

use serde::de::IgnoredAny;
use tokio_util::sync::CancellationToken;

use crate::errors::TailError;

/// Block size used when reading journals backwards.
pub const TAIL_BLOCK_SIZE: usize = 64 * 1024;

/// Returns up to `n` of the last lines of `reader` that hold valid JSON, oldest
/// first, with surrounding whitespace trimmed.
///
/// Lines that are not valid JSON are skipped and do not count towards `n`.
/// Cancellation is checked before every block read.
pub fn tail_json_lines<R: Read + Seek>(
    reader: &mut R,
    n: usize,
    block_size: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<u8>>, TailError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let block_size = block_size.max(1);

    let mut pos = reader.seek(SeekFrom::End(0))?;
    let mut lines: Vec<Vec<u8>> = Vec::with_capacity(n.min(1024));
    // Bytes of the line that continues past the start of the next block to read.
    let mut carry: Vec<u8> = Vec::new();
    let mut block = vec![0u8; block_size];

    while pos > 0 && lines.len() < n {
        if cancel.is_cancelled() {
            return Err(TailError::Cancelled);
        }

        let read_len = usize::try_from(pos).map_or(block_size, |left| left.min(block_size));
        pos -= read_len as u64;
        reader.seek(SeekFrom::Start(pos))?;
        reader.read_exact(&mut block[..read_len])?;

        let mut chunk = &block[..read_len];
        while let Some(newline) = chunk.iter().rposition(|&b| b == b'\n') {
            let mut candidate = Vec::with_capacity(chunk.len() - newline - 1 + carry.len());
            candidate.extend_from_slice(&chunk[newline + 1..]);
            candidate.append(&mut carry);
            push_if_json(&mut lines, &candidate);

            chunk = &chunk[..newline];
            if lines.len() >= n {
                break;
            }
        }

        if lines.len() < n {
            let mut next = Vec::with_capacity(chunk.len() + carry.len());
            next.extend_from_slice(chunk);
            next.append(&mut carry);
            carry = next;
        }
    }

    // The first line of the file has no newline before it.
    if lines.len() < n && !carry.is_empty() {
        push_if_json(&mut lines, &carry);
    }

    lines.reverse();
    Ok(lines)
}

fn push_if_json(lines: &mut Vec<Vec<u8>>, candidate: &[u8]) {
    let trimmed = candidate.trim_ascii();
    if trimmed.is_empty() {
        return;
    }
    if serde_json::from_slice::<IgnoredAny>(trimmed).is_ok() {
        lines.push(trimmed.to_vec());
    }
}
