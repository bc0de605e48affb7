//! Structural check for incoming v1 update payloads.
//!
//! yrs trusts the strings inside an update and reads them without UTF-8
//! validation, so bytes from the network are walked here first, field by
//! field in the decoder's own order. A payload passes only if every string
//! is UTF-8, every content and type tag is known, block clocks stay within
//! `u32`, nested values stay under [`MAX_NESTING`] and nothing trails the
//! delete set.

use yrs::block::{
    BLOCK_GC_REF_NUMBER, BLOCK_ITEM_ANY_REF_NUMBER, BLOCK_ITEM_BINARY_REF_NUMBER,
    BLOCK_ITEM_DELETED_REF_NUMBER, BLOCK_ITEM_DOC_REF_NUMBER, BLOCK_ITEM_EMBED_REF_NUMBER,
    BLOCK_ITEM_FORMAT_REF_NUMBER, BLOCK_ITEM_JSON_REF_NUMBER, BLOCK_ITEM_MOVE_REF_NUMBER,
    BLOCK_ITEM_STRING_REF_NUMBER, BLOCK_ITEM_TYPE_REF_NUMBER, BLOCK_SKIP_REF_NUMBER, HAS_ORIGIN,
    HAS_PARENT_SUB, HAS_RIGHT_ORIGIN,
};
use yrs::encoding::read::{Cursor, Error as ReadError, Read};
use yrs::types::{
    TYPE_REFS_ARRAY, TYPE_REFS_DOC, TYPE_REFS_MAP, TYPE_REFS_TEXT, TYPE_REFS_UNDEFINED,
    TYPE_REFS_XML_ELEMENT, TYPE_REFS_XML_FRAGMENT, TYPE_REFS_XML_HOOK, TYPE_REFS_XML_TEXT,
};

use crate::error::DocumentError;

/// Deepest array/map nesting accepted inside an `Any` value.
pub const MAX_NESTING: usize = 64;

/// Reject `delta` unless yrs can decode it safely.
pub fn check_update(delta: &[u8]) -> Result<(), DocumentError> {
    let mut cursor = Cursor::new(delta);
    walk_update(&mut cursor).map_err(|e| DocumentError::MalformedDelta(e.to_string()))?;
    if cursor.has_content() {
        return Err(DocumentError::MalformedDelta(format!(
            "{} trailing bytes after delete set",
            delta.len() - cursor.next
        )));
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> ReadError {
    ReadError::Custom(reason.into())
}

fn walk_update(cursor: &mut Cursor<'_>) -> Result<(), ReadError> {
    let clients: u32 = cursor.read_var()?;
    for _ in 0..clients {
        let blocks: u32 = cursor.read_var()?;
        let _client: u32 = cursor.read_var()?;
        let mut clock = u64::from(cursor.read_var::<u32>()?);
        for _ in 0..blocks {
            clock += walk_block(cursor)?;
            if clock > u64::from(u32::MAX) {
                return Err(invalid("block clock overflows u32"));
            }
        }
    }

    // Delete set: per client, a list of (clock, len) ranges.
    let clients: u32 = cursor.read_var()?;
    for _ in 0..clients {
        let _client: u32 = cursor.read_var()?;
        let ranges: u32 = cursor.read_var()?;
        for _ in 0..ranges {
            let start: u32 = cursor.read_var()?;
            let len: u32 = cursor.read_var()?;
            if start.checked_add(len).is_none() {
                return Err(invalid("delete range overflows u32"));
            }
        }
    }
    Ok(())
}

/// Walks one block and returns an upper bound of the clock span it covers.
fn walk_block(cursor: &mut Cursor<'_>) -> Result<u64, ReadError> {
    let info = cursor.read_u8()?;
    if info == BLOCK_SKIP_REF_NUMBER || info == BLOCK_GC_REF_NUMBER {
        return Ok(u64::from(cursor.read_var::<u32>()?));
    }
    if info & HAS_ORIGIN != 0 {
        skip_id(cursor)?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        skip_id(cursor)?;
    }
    if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
        let named_parent: u32 = cursor.read_var()?;
        if named_parent == 1 {
            read_str(cursor)?;
        } else {
            skip_id(cursor)?;
        }
        if info & HAS_PARENT_SUB != 0 {
            read_str(cursor)?;
        }
    }
    walk_content(cursor, info & 0b1111)
}

fn walk_content(cursor: &mut Cursor<'_>, content: u8) -> Result<u64, ReadError> {
    match content {
        BLOCK_ITEM_DELETED_REF_NUMBER => Ok(u64::from(cursor.read_var::<u32>()?)),
        BLOCK_ITEM_JSON_REF_NUMBER => {
            // yrs reads one more string than the declared count
            let mut remaining = cursor.read_var::<u32>()? as i32;
            let mut count = 0u64;
            while remaining >= 0 {
                read_str(cursor)?;
                remaining -= 1;
                count += 1;
            }
            Ok(count)
        }
        BLOCK_ITEM_BINARY_REF_NUMBER => {
            cursor.read_buf()?;
            Ok(1)
        }
        BLOCK_ITEM_STRING_REF_NUMBER => read_str(cursor),
        BLOCK_ITEM_EMBED_REF_NUMBER => {
            read_str(cursor)?;
            Ok(1)
        }
        BLOCK_ITEM_FORMAT_REF_NUMBER => {
            read_str(cursor)?;
            read_str(cursor)?;
            Ok(1)
        }
        BLOCK_ITEM_TYPE_REF_NUMBER => {
            match cursor.read_u8()? {
                TYPE_REFS_XML_ELEMENT => {
                    read_str(cursor)?;
                }
                TYPE_REFS_ARRAY | TYPE_REFS_MAP | TYPE_REFS_TEXT | TYPE_REFS_XML_FRAGMENT
                | TYPE_REFS_XML_HOOK | TYPE_REFS_XML_TEXT | TYPE_REFS_DOC
                | TYPE_REFS_UNDEFINED => {}
                other => return Err(invalid(format!("unknown type ref {other}"))),
            }
            Ok(1)
        }
        BLOCK_ITEM_ANY_REF_NUMBER => {
            let len: u32 = cursor.read_var()?;
            for _ in 0..len {
                walk_any(cursor, 0)?;
            }
            Ok(u64::from(len))
        }
        BLOCK_ITEM_MOVE_REF_NUMBER => {
            let flags: i32 = cursor.read_var()?;
            let _client: u64 = cursor.read_var()?;
            let _clock: u32 = cursor.read_var()?;
            if flags & 0b0000_0001 == 0 {
                let _client: u64 = cursor.read_var()?;
                let _clock: u32 = cursor.read_var()?;
            }
            Ok(1)
        }
        BLOCK_ITEM_DOC_REF_NUMBER => {
            read_str(cursor)?;
            walk_any(cursor, 0)?;
            Ok(1)
        }
        other => Err(invalid(format!("unknown content ref {other}"))),
    }
}

fn walk_any(cursor: &mut Cursor<'_>, depth: usize) -> Result<(), ReadError> {
    if depth >= MAX_NESTING {
        return Err(invalid("value nested too deeply"));
    }
    match cursor.read_u8()? {
        127 | 126 | 121 | 120 => {}
        125 => {
            let _: i64 = cursor.read_var()?;
        }
        124 => {
            cursor.read_exact(4)?;
        }
        123 | 122 => {
            cursor.read_exact(8)?;
        }
        119 => {
            read_str(cursor)?;
        }
        118 => {
            let len: usize = cursor.read_var()?;
            for _ in 0..len {
                read_str(cursor)?;
                walk_any(cursor, depth + 1)?;
            }
        }
        117 => {
            let len: usize = cursor.read_var()?;
            for _ in 0..len {
                walk_any(cursor, depth + 1)?;
            }
        }
        116 => {
            cursor.read_buf()?;
        }
        other => return Err(invalid(format!("unknown value tag {other}"))),
    }
    Ok(())
}

fn skip_id(cursor: &mut Cursor<'_>) -> Result<(), ReadError> {
    let _client: u32 = cursor.read_var()?;
    let _clock: u32 = cursor.read_var()?;
    Ok(())
}

/// Reads a length-prefixed string and returns its byte length.
fn read_str(cursor: &mut Cursor<'_>) -> Result<u64, ReadError> {
    let bytes = cursor.read_buf()?;
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.len() as u64),
        Err(e) => Err(invalid(format!("string is not UTF-8: {e}"))),
    }
}
