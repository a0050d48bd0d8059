//! Growable receive buffer bound to a single accepted connection.

use crate::{Connection, Error};
use bytes::Bytes;
use std::{net::SocketAddr, sync::Arc};

/// An accepted connection and the address it was accepted from.
pub struct Peer<C: Connection> {
    connection: Arc<C>,
    address: SocketAddr,
}

impl<C: Connection> Peer<C> {
    /// Create a new [Peer].
    pub fn new(address: SocketAddr, connection: C) -> Self {
        Self {
            connection: Arc::new(connection),
            address,
        }
    }

    /// Returns the address of the remote end of the connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns the underlying connection.
    ///
    /// The returned handle may be used to wait for readiness, but only the holder of the
    /// slot lock may read from it.
    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }
}

/// Returns the capacity a buffer of `capacity` bytes grows to when it must hold `needed` bytes.
///
/// The result is at least double the current capacity and never less than `needed`, but never
/// exceeds `limit`. Callers must ensure `needed <= limit`.
pub fn grown_capacity(capacity: usize, needed: usize, limit: usize) -> usize {
    capacity.saturating_mul(2).max(needed).min(limit)
}

/// All bytes received so far on one connection.
///
/// Mutation requires `&mut self`, which callers only obtain through the slot lock (see
/// [crate::SlotHandle]). Bytes are never moved once written: growth extends the backing
/// storage and leaves the prefix untouched.
pub struct ConnectionBuffer<C: Connection> {
    peer: Peer<C>,

    // Backing storage (its length is the buffer's capacity)
    data: Vec<u8>,

    // Number of bytes of `data` that hold received bytes
    length: usize,

    // Upper bound on capacity
    limit: usize,
}

impl<C: Connection> ConnectionBuffer<C> {
    /// Create an empty buffer for `peer` with `capacity` bytes of storage that may grow to `limit`.
    pub fn new(peer: Peer<C>, capacity: usize, limit: usize) -> Self {
        let capacity = capacity.min(limit);
        Self {
            peer,
            data: vec![0; capacity],
            length: 0,
            limit,
        }
    }

    /// Returns the peer this buffer reads from.
    pub fn peer(&self) -> &Peer<C> {
        &self.peer
    }

    /// Returns the number of bytes received.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns true if no bytes have been received.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of bytes the buffer can hold without growing.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the maximum capacity the buffer may grow to.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the received bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Read every byte that is currently available on the connection, returning how many
    /// bytes were appended.
    ///
    /// Returns 0 immediately if nothing is available. Grows the buffer (see [grown_capacity])
    /// when the free space is smaller than what is available.
    ///
    /// # Errors
    ///
    /// Returns [Error::ShortRead] if the connection yields fewer bytes than it reported as
    /// available. No bytes are committed in that case. Returns [Error::BufferLimitExceeded]
    /// (before reading anything) if the bytes would not fit within the limit.
    pub fn append_available(&mut self) -> Result<usize, Error> {
        let available = self.peer.connection.available()?;
        if available == 0 {
            return Ok(0);
        }

        // Ensure there is room for everything that was probed
        let needed = self.length.saturating_add(available);
        if needed > self.limit {
            return Err(Error::BufferLimitExceeded {
                needed,
                limit: self.limit,
            });
        }
        if needed > self.capacity() {
            let capacity = grown_capacity(self.capacity(), needed, self.limit);
            self.data.resize(capacity, 0);
        }

        // Read exactly the probed amount
        let read = self
            .peer
            .connection
            .read(&mut self.data[self.length..needed])?;
        if read != available {
            return Err(Error::ShortRead {
                expected: available,
                actual: read,
            });
        }
        self.length = needed;
        Ok(read)
    }

    /// Copy out the bytes in the inclusive range `[lo, hi]`.
    pub fn extract_range(&self, lo: usize, hi: usize) -> Result<Bytes, Error> {
        if lo > hi || hi >= self.length {
            return Err(Error::InvalidRange {
                lo,
                hi,
                length: self.length,
            });
        }
        Ok(Bytes::copy_from_slice(&self.data[lo..=hi]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn buffer(
        capacity: usize,
        limit: usize,
    ) -> (mocks::Client, ConnectionBuffer<mocks::Connection>) {
        let (client, connection) = mocks::pipe();
        let peer = Peer::new("127.0.0.1:40000".parse().unwrap(), connection);
        (client, ConnectionBuffer::new(peer, capacity, limit))
    }

    fn payload(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_grown_capacity() {
        // Doubling covers the need
        assert_eq!(grown_capacity(1024, 1500, usize::MAX), 2048);

        // Need exceeds double
        assert_eq!(grown_capacity(1024, 5000, usize::MAX), 5000);

        // Empty buffer grows to fit
        assert_eq!(grown_capacity(0, 10, usize::MAX), 10);

        // Capped by the limit
        assert_eq!(grown_capacity(1024, 1500, 1600), 1600);

        // Never overflows
        assert_eq!(grown_capacity(usize::MAX / 2 + 1, usize::MAX, usize::MAX), usize::MAX);
    }

    #[test]
    fn test_append_nothing_available() {
        let (_client, mut buffer) = buffer(1024, 4096);
        assert_eq!(buffer.append_available().unwrap(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 1024);
    }

    #[test]
    fn test_append_within_capacity() {
        let (client, mut buffer) = buffer(1024, 4096);
        client.send(b"hello");
        assert_eq!(buffer.append_available().unwrap(), 5);
        assert_eq!(buffer.as_slice(), b"hello");
        assert_eq!(buffer.capacity(), 1024);

        // Nothing left
        assert_eq!(buffer.append_available().unwrap(), 0);
    }

    #[test]
    fn test_growth_preserves_prefix() {
        let (client, mut buffer) = buffer(1024, 1 << 20);
        let first = payload(0, 1000);
        let second = payload(1, 1000);

        client.send(&first);
        assert_eq!(buffer.append_available().unwrap(), 1000);
        assert_eq!(buffer.capacity(), 1024);

        client.send(&second);
        assert_eq!(buffer.append_available().unwrap(), 1000);
        assert_eq!(buffer.capacity(), 2048);
        assert_eq!(buffer.len(), 2000);
        assert_eq!(&buffer.as_slice()[..1000], &first[..]);
        assert_eq!(&buffer.as_slice()[1000..], &second[..]);

        // Entire range matches what was sent, in order
        let all = buffer.extract_range(0, 1999).unwrap();
        assert_eq!(&all[..1000], &first[..]);
        assert_eq!(&all[1000..], &second[..]);
    }

    #[test]
    fn test_growth_to_exact_fit() {
        let (client, mut buffer) = buffer(16, 1 << 20);
        let data = payload(2, 100);
        client.send(&data);
        assert_eq!(buffer.append_available().unwrap(), 100);
        assert_eq!(buffer.capacity(), 100);
        assert_eq!(buffer.as_slice(), &data[..]);
    }

    #[test]
    fn test_short_read() {
        let (client, mut buffer) = buffer(1024, 4096);
        client.send(b"before");
        assert_eq!(buffer.append_available().unwrap(), 6);

        // Probe reports 500 bytes, read only yields 400
        client.send(&payload(3, 500));
        client.withhold(100);
        let err = buffer.append_available().unwrap_err();
        assert!(matches!(
            err,
            Error::ShortRead {
                expected: 500,
                actual: 400
            }
        ));
        assert!(err.is_fatal());

        // Nothing was committed
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.as_slice(), b"before");
    }

    #[test]
    fn test_limit_exceeded() {
        let (client, mut buffer) = buffer(8, 32);
        client.send(&[7u8; 20]);
        assert_eq!(buffer.append_available().unwrap(), 20);
        assert_eq!(buffer.capacity(), 20);

        client.send(&[9u8; 20]);
        let err = buffer.append_available().unwrap_err();
        assert!(matches!(
            err,
            Error::BufferLimitExceeded {
                needed: 40,
                limit: 32
            }
        ));
        assert!(!err.is_fatal());
        assert_eq!(buffer.len(), 20);
    }

    #[test]
    fn test_read_failure_transient() {
        let (client, mut buffer) = buffer(1024, 4096);
        client.send(b"kept");
        assert_eq!(buffer.append_available().unwrap(), 4);

        client.send(b"lost");
        client.reset();
        let err = buffer.append_available().unwrap_err();
        assert!(matches!(err, Error::ReadFailed(_)));
        assert!(!err.is_fatal());
        assert_eq!(buffer.as_slice(), b"kept");
    }

    #[test]
    fn test_extract_range_bounds() {
        let (client, mut buffer) = buffer(64, 64);
        client.send(b"abcdef");
        buffer.append_available().unwrap();

        assert_eq!(&buffer.extract_range(0, 0).unwrap()[..], b"a");
        assert_eq!(&buffer.extract_range(2, 4).unwrap()[..], b"cde");
        assert_eq!(&buffer.extract_range(5, 5).unwrap()[..], b"f");

        // Idempotent
        assert_eq!(
            buffer.extract_range(1, 3).unwrap(),
            buffer.extract_range(1, 3).unwrap()
        );

        // Past the received bytes (even if within capacity)
        assert!(matches!(
            buffer.extract_range(0, 6),
            Err(Error::InvalidRange {
                lo: 0,
                hi: 6,
                length: 6
            })
        ));

        // Inverted
        assert!(matches!(
            buffer.extract_range(3, 2),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_initial_capacity_capped_by_limit() {
        let (_client, buffer) = buffer(1024, 100);
        assert_eq!(buffer.capacity(), 100);
        assert_eq!(buffer.limit(), 100);
    }
}
