//! The modem transport seam and the chunked response read loop.
//!
//! The cellular modem is an external collaborator. It posts a request body,
//! reports the HTTP status and announced response length, and then hands
//! the response over in small chunks; asking a software serial link for
//! more than [`READ_CHUNK_LEN`] bytes at once loses data.
//!
//! Chunk reads are non-blocking in the [`nb`] sense: a transport that has
//! nothing yet returns [`nb::Error::WouldBlock`] and the read loop polls it
//! again with [`nb::block!`].

use heapless::Vec;

use crate::consts::{HTTP_OK, MAX_RESPONSE_LEN, READ_CHUNK_LEN};
use crate::error::TransportError;

/// Outcome of a POST request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct PostStatus {
    /// HTTP status code.
    pub status: u16,
    /// Announced length of the response body in bytes.
    pub length: usize,
}

/// A request/response link to the backend.
pub trait Transport {
    /// Collaborator-specific failure.
    type Error: core::fmt::Debug;

    /// Sends `body` to `url` and waits for the status line.
    fn post(&mut self, url: &str, body: &[u8]) -> Result<PostStatus, Self::Error>;

    /// Reads up to `dest.len()` response bytes starting at `offset`.
    ///
    /// Returns the number of bytes written into `dest`.
    fn read_chunk(&mut self, dest: &mut [u8], offset: usize) -> nb::Result<usize, Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn post(&mut self, url: &str, body: &[u8]) -> Result<PostStatus, Self::Error> {
        (**self).post(url, body)
    }

    fn read_chunk(&mut self, dest: &mut [u8], offset: usize) -> nb::Result<usize, Self::Error> {
        (**self).read_chunk(dest, offset)
    }
}

/// Posts `body` and returns the announced response length.
///
/// # Errors
/// - [`TransportError::Post`] if the collaborator fails
/// - [`TransportError::Status`] if the status is not 200; nothing is read
pub fn post_envelope<T: Transport>(
    transport: &mut T,
    url: &str,
    body: &[u8],
) -> Result<usize, TransportError> {
    let reply = transport
        .post(url, body)
        .map_err(|_| TransportError::Post)?;
    if reply.status != HTTP_OK {
        return Err(TransportError::Status(reply.status));
    }
    debug!("posted {} bytes, response {} bytes", body.len(), reply.length);
    Ok(reply.length)
}

/// Reads a response of `length` bytes in chunks of at most
/// [`READ_CHUNK_LEN`].
///
/// # Errors
/// - [`TransportError::ResponseTooLong`] if `length` exceeds
///   [`MAX_RESPONSE_LEN`]; nothing is read
/// - [`TransportError::Read`] if a chunk read fails
/// - [`TransportError::Stalled`] if a chunk read returns no bytes
pub fn read_response<T: Transport>(
    transport: &mut T,
    length: usize,
) -> Result<Vec<u8, MAX_RESPONSE_LEN>, TransportError> {
    let too_long = TransportError::ResponseTooLong {
        length,
        limit: MAX_RESPONSE_LEN,
    };
    let mut response: Vec<u8, MAX_RESPONSE_LEN> = Vec::new();
    response.resize(length, 0).map_err(|()| too_long)?;

    let mut offset = 0;
    while offset < length {
        let end = length.min(offset + READ_CHUNK_LEN);
        let read = nb::block!(transport.read_chunk(&mut response[offset..end], offset))
            .map_err(|_| TransportError::Read)?;
        if read == 0 {
            return Err(TransportError::Stalled { offset });
        }
        offset += read.min(end - offset);
        trace!("received {}/{} bytes", offset, length);
    }
    Ok(response)
}
