//! Provides the binary messages exchanged between cluster members.
//!
//! The protocol is deliberately tiny: a [FetchRequest](FetchRequest) names a cache group and a
//! key, a [FetchResponse](FetchResponse) carries the raw value bytes. Every field is encoded as
//! a big-endian u32 length followed by the payload, which keeps the messages compact, trivially
//! skippable and completely unambiguous - there is nothing to escape and nothing to guess.
//!
//! There is no version field. Both parties of a fetch are expected to run the same protocol
//! revision, which holds as the peer set of a cluster is rolled out as one unit.
//!
//! # Examples
//!
//! ```
//! # use callisto::wire::FetchResponse;
//! let response = FetchResponse::new(b"some value".to_vec());
//! let encoded = response.encode();
//!
//! let decoded = FetchResponse::decode(&encoded).unwrap();
//! assert_eq!(decoded.value.as_ref(), b"some value");
//! ```
use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Asks a peer for the value of **key** within the cache group **group**.
///
/// Note that within the HTTP transport this message travels as part of the request path rather
/// than as a request body - the binary encoding exists so that both messages of the protocol
/// share one wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// The name of the cache group to query.
    pub group: String,

    /// The key being requested.
    pub key: String,
}

/// Carries the value bytes answering a [FetchRequest](FetchRequest).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchResponse {
    /// The raw bytes of the requested value.
    pub value: Bytes,
}

impl FetchRequest {
    /// Creates a request for the given group and key.
    pub fn new(group: impl Into<String>, key: impl Into<String>) -> Self {
        FetchRequest {
            group: group.into(),
            key: key.into(),
        }
    }

    /// Encodes the request into its binary representation.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(8 + self.group.len() + self.key.len());
        put_block(&mut buffer, self.group.as_bytes());
        put_block(&mut buffer, self.key.as_bytes());

        buffer.freeze()
    }

    /// Decodes a request from the given bytes.
    ///
    /// Fails on truncated data, on trailing garbage and on fields which are not valid UTF-8.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callisto::wire::FetchRequest;
    /// let request = FetchRequest::new("scores", "user-42");
    /// let decoded = FetchRequest::decode(&request.encode()).unwrap();
    ///
    /// assert_eq!(decoded.group, "scores");
    /// assert_eq!(decoded.key, "user-42");
    /// ```
    pub fn decode(data: &[u8]) -> Result<FetchRequest> {
        let mut cursor = data;
        let group = read_string(&mut cursor)?;
        let key = read_string(&mut cursor)?;
        ensure_consumed(&cursor)?;

        Ok(FetchRequest { group, key })
    }
}

impl FetchResponse {
    /// Creates a response carrying the given value bytes.
    pub fn new(value: impl Into<Bytes>) -> Self {
        FetchResponse {
            value: value.into(),
        }
    }

    /// Encodes the response into its binary representation.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(4 + self.value.len());
        put_block(&mut buffer, &self.value);

        buffer.freeze()
    }

    /// Decodes a response from the given bytes.
    ///
    /// Fails on truncated data and on trailing garbage.
    pub fn decode(data: &[u8]) -> Result<FetchResponse> {
        let mut cursor = data;
        let value = read_block(&mut cursor)?;
        ensure_consumed(&cursor)?;

        Ok(FetchResponse {
            value: Bytes::copy_from_slice(value),
        })
    }
}

/// Appends a length-prefixed block to the given buffer.
fn put_block(buffer: &mut BytesMut, data: &[u8]) {
    buffer.put_u32(data.len() as u32);
    buffer.put_slice(data);
}

/// Reads a length-prefixed block, advancing the cursor past it.
fn read_block<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8]> {
    if cursor.remaining() < 4 {
        return Err(anyhow!("The message is truncated: missing a length prefix."));
    }
    let length = cursor.get_u32() as usize;
    if cursor.remaining() < length {
        return Err(anyhow!(
            "The message is truncated: a field announces {} bytes but only {} remain.",
            length,
            cursor.remaining()
        ));
    }

    let (block, rest) = cursor.split_at(length);
    *cursor = rest;

    Ok(block)
}

/// Reads a length-prefixed UTF-8 string, advancing the cursor past it.
fn read_string(cursor: &mut &[u8]) -> Result<String> {
    let block = read_block(cursor)?;
    Ok(std::str::from_utf8(block)
        .map_err(|_| anyhow!("A string field contains invalid UTF-8 data."))?
        .to_owned())
}

/// Ensures that a decoded message has no trailing bytes.
fn ensure_consumed(cursor: &[u8]) -> Result<()> {
    if cursor.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "The message carries {} unexpected trailing bytes.",
            cursor.len()
        ))
    }
}
