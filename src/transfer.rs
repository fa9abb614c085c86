//! Implements the data transfer between the host and the bus drivers.
//!
//! The command transport (USB bulk endpoints, in the usual case) is injected
//! as a [`HostChannel`].  The drivers never touch it directly, they go
//! through an [`OutTransfer`] (host to device - a WRITE) or [`InTransfer`]
//! (device to host - a READ), which track how many bytes the host asked for
//! and batch the data into host sized chunks.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use heapless::Vec;
use static_assertions::const_assert;

use crate::constants::HOST_CHUNK_SIZE;
use crate::driver::BusError;
use crate::types::Direction;

// Chunk sizes are counted in a u16, as is the transfer length
const_assert!(HOST_CHUNK_SIZE <= u16::MAX as usize);

/// The payload stream of the command transport.
#[allow(async_fn_in_trait)]
pub trait HostChannel {
    /// Receive up to `buf.len()` bytes from the host.  Returns the number
    /// received, which is non-zero unless the host has nothing more to
    /// send.
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, BusError>;

    /// Send bytes to the host.
    async fn send(&mut self, data: &[u8]) -> Result<(), BusError>;
}

/// Where the bytes for a bus write come from.
#[allow(async_fn_in_trait)]
pub trait ByteSource {
    async fn next_byte(&mut self) -> Result<u8, BusError>;
}

/// Where the bytes from a bus read go.
#[allow(async_fn_in_trait)]
pub trait ByteSink {
    async fn push(&mut self, byte: u8) -> Result<(), BusError>;
}

/// A ByteSource over a slice, used for the command bytes the driver
/// generates itself.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    async fn next_byte(&mut self) -> Result<u8, BusError> {
        let byte = *self.data.get(self.pos).ok_or(BusError::Internal)?;
        self.pos += 1;
        Ok(byte)
    }
}

/// A ByteSink filling a slice.
pub struct SliceSink<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> SliceSink<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// The bytes received so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl ByteSink for SliceSink<'_> {
    async fn push(&mut self, byte: u8) -> Result<(), BusError> {
        let slot = self.buf.get_mut(self.len).ok_or(BusError::Internal)?;
        *slot = byte;
        self.len += 1;
        Ok(())
    }
}

/// An OUT (WRITE) transfer.  Bytes are pulled from the host a chunk at a
/// time and handed to the driver one at a time.
pub struct OutTransfer<'a, C: HostChannel> {
    channel: &'a mut C,

    /// Bytes the host still owes us.
    remaining: u16,

    /// The current chunk.
    data: [u8; HOST_CHUNK_SIZE],

    /// The next byte to hand out from `data`.
    read_pos: usize,

    /// The number of valid bytes in `data`.
    valid_bytes: usize,
}

impl<'a, C: HostChannel> OutTransfer<'a, C> {
    pub fn new(channel: &'a mut C, len: u16) -> Self {
        let transfer = Self {
            channel,
            remaining: len,
            data: [0; HOST_CHUNK_SIZE],
            read_pos: 0,
            valid_bytes: 0,
        };
        trace!("{:?} transfer of {} bytes", transfer.direction(), len);
        transfer
    }

    pub const fn direction(&self) -> Direction {
        Direction::Out
    }

    /// Get the next byte from the host.
    pub async fn next_byte(&mut self) -> Result<u8, BusError> {
        if self.read_pos >= self.valid_bytes {
            self.fill().await?;
        }
        let byte = self.data[self.read_pos];
        self.read_pos += 1;
        Ok(byte)
    }

    // Receive the next chunk from the host
    async fn fill(&mut self) -> Result<(), BusError> {
        if self.remaining == 0 {
            warn!("Out transfer: host data exhausted");
            return Err(BusError::Io);
        }
        let want = (self.remaining as usize).min(HOST_CHUNK_SIZE);
        let got = self.channel.receive(&mut self.data[..want]).await?;
        if got == 0 {
            debug!("Out transfer: host sent no data");
            return Err(BusError::Io);
        }
        let got = got.min(want);
        self.remaining -= got as u16;
        self.read_pos = 0;
        self.valid_bytes = got;
        Ok(())
    }

    /// Discard whatever the host still has to send, so the next command
    /// starts cleanly.
    pub async fn finish(mut self) {
        if self.remaining > 0 {
            debug!("{:?} transfer: draining {} bytes", self.direction(), self.remaining);
        }
        while self.remaining > 0 {
            let want = (self.remaining as usize).min(HOST_CHUNK_SIZE);
            match self.channel.receive(&mut self.data[..want]).await {
                Ok(got) if got > 0 => self.remaining -= got.min(want) as u16,
                _ => break,
            }
        }
    }
}

/// An IN (READ) transfer.  Bytes from the bus are buffered and sent to the
/// host each time a full chunk is ready.
pub struct InTransfer<'a, C: HostChannel> {
    channel: &'a mut C,
    buf: Vec<u8, HOST_CHUNK_SIZE>,
    sent: u16,
}

impl<'a, C: HostChannel> InTransfer<'a, C> {
    pub fn new(channel: &'a mut C, len: u16) -> Self {
        let transfer = Self {
            channel,
            buf: Vec::new(),
            sent: 0,
        };
        trace!("{:?} transfer of {} bytes", transfer.direction(), len);
        transfer
    }

    pub const fn direction(&self) -> Direction {
        Direction::In
    }

    /// Queue a byte for the host, sending the chunk if it is now full.
    pub async fn push(&mut self, byte: u8) -> Result<(), BusError> {
        // The buffer is flushed as soon as it fills, so there is always room
        if self.buf.push(byte).is_err() {
            error!("In transfer: buffer overflow");
            return Err(BusError::Internal);
        }
        if self.buf.is_full() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send any buffered bytes.
    pub async fn flush(&mut self) -> Result<(), BusError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = self.channel.send(&self.buf).await;
        if result.is_ok() {
            self.sent += self.buf.len() as u16;
        }
        self.buf.clear();
        result
    }

    /// Bytes handed to the host so far.
    pub fn sent(&self) -> u16 {
        self.sent
    }

    /// Flush the remainder, ignoring any error so the caller can propagate
    /// the original one.
    pub async fn finish(mut self) -> u16 {
        if self.flush().await.is_err() {
            debug!("{:?} transfer: final flush failed", self.direction());
        }
        self.sent
    }
}

impl<C: HostChannel> ByteSource for OutTransfer<'_, C> {
    async fn next_byte(&mut self) -> Result<u8, BusError> {
        OutTransfer::next_byte(self).await
    }
}

impl<C: HostChannel> ByteSink for InTransfer<'_, C> {
    async fn push(&mut self, byte: u8) -> Result<(), BusError> {
        InTransfer::push(self, byte).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::HostMock;
    use embassy_futures::block_on;

    #[test]
    fn in_transfer_sends_full_chunks_then_remainder() {
        let mut host = HostMock::new(&[]);
        block_on(async {
            let mut xfer = InTransfer::new(&mut host, 100);
            for ii in 0..100u8 {
                xfer.push(ii).await.unwrap();
            }
            assert_eq!(xfer.sent(), 64);
            assert_eq!(xfer.finish().await, 100);
        });
        assert_eq!(host.chunks(), &[64, 36]);
        assert_eq!(host.sent().len(), 100);
        assert_eq!(host.sent()[99], 99);
    }

    #[test]
    fn out_transfer_hands_out_bytes_in_order() {
        let data: std::vec::Vec<u8> = (0..70).collect();
        let mut host = HostMock::new(&data);
        block_on(async {
            let mut xfer = OutTransfer::new(&mut host, 70);
            for ii in 0..70u8 {
                assert_eq!(xfer.next_byte().await, Ok(ii));
            }
            assert_eq!(xfer.next_byte().await, Err(BusError::Io));
        });
    }

    #[test]
    fn transfers_know_their_direction() {
        let mut host = HostMock::new(&[]);
        assert_eq!(OutTransfer::new(&mut host, 0).direction(), Direction::Out);
        assert_eq!(InTransfer::new(&mut host, 0).direction(), Direction::In);
    }

    #[test]
    fn out_transfer_finish_drains_host() {
        let data = [1u8; 200];
        let mut host = HostMock::new(&data);
        block_on(async {
            let mut xfer = OutTransfer::new(&mut host, 200);
            assert_eq!(xfer.next_byte().await, Ok(1));
            xfer.finish().await;
        });
        assert_eq!(host.unread(), 0);
    }
}
