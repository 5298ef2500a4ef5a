//! The handshake prelude: magic number exchange and odd/even role election.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{HANDSHAKE_LEN, HANDSHAKE_MAGIC, HANDSHAKE_RANDOM_LEN};
use crate::error::Error;
use crate::util::read_exact_or_eof;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// The outcome of a successful handshake: which role this party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// This party's random bytes compared greater; it allocates odd ids.
    Odd,
    /// This party's random bytes compared smaller; it allocates even ids.
    Even,
}

impl Role {
    pub fn first_id(self) -> u32 {
        match self {
            Role::Odd => 1,
            Role::Even => 2,
        }
    }
}

/// Perform the handshake described in spec.md §4.1: write our magic number
/// and 16 random bytes, read the peer's, and compare byte-by-byte to decide
/// which party is "odd". Fails with [`Error::ProtocolMismatch`] if the
/// peer's magic doesn't match ours, or [`Error::HandshakeCollision`] if the
/// random bytes are identical (the caller may retry in that case).
#[tracing::instrument(skip_all, level = "debug")]
pub(crate) async fn perform_handshake<T>(transport: &mut T) -> Result<Role, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut our_prelude = [0u8; HANDSHAKE_LEN];
    our_prelude[..HANDSHAKE_MAGIC.len()].copy_from_slice(&HANDSHAKE_MAGIC);
    rand::rng().fill_bytes(&mut our_prelude[HANDSHAKE_MAGIC.len()..]);

    trace!("writing handshake prelude");
    transport.write_all(&our_prelude).await?;
    transport.flush().await?;

    let mut their_prelude = [0u8; HANDSHAKE_LEN];
    if !read_exact_or_eof(transport, &mut their_prelude).await? {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "transport closed during handshake",
        )));
    }

    if their_prelude[..HANDSHAKE_MAGIC.len()] != HANDSHAKE_MAGIC {
        return Err(Error::ProtocolMismatch);
    }

    let our_random = &our_prelude[HANDSHAKE_MAGIC.len()..];
    let their_random = &their_prelude[HANDSHAKE_MAGIC.len()..];
    let role = elect_role(our_random, their_random)?;
    debug!(?role, "handshake complete");
    Ok(role)
}

/// Compare two equal-length random byte strings to elect a role. Split out
/// of [`perform_handshake`] so the comparison itself is testable without
/// faking transport I/O for both sides of a real handshake.
fn elect_role(our_random: &[u8], their_random: &[u8]) -> Result<Role, Error> {
    for i in 0..HANDSHAKE_RANDOM_LEN {
        match our_random[i].cmp(&their_random[i]) {
            std::cmp::Ordering::Greater => return Ok(Role::Odd),
            std::cmp::Ordering::Less => return Ok(Role::Even),
            std::cmp::Ordering::Equal => continue,
        }
    }
    Err(Error::HandshakeCollision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn peers_elect_opposite_roles() {
        let (mut a, mut b) = tokio::io::duplex(128);
        let (ra, rb) = tokio::join!(perform_handshake(&mut a), perform_handshake(&mut b));
        let ra = ra.unwrap();
        let rb = rb.unwrap();
        assert_ne!(ra, rb);
    }

    #[tokio::test]
    async fn bad_magic_is_a_protocol_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            let mut bogus = [0xAAu8; HANDSHAKE_LEN];
            bogus[0] = 0x00;
            b.write_all(&bogus).await.unwrap();
            let mut discard = [0u8; HANDSHAKE_LEN];
            let _ = b.read_exact(&mut discard).await;
        });
        let err = perform_handshake(&mut a).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch));
    }

    #[test]
    fn identical_random_bytes_is_a_collision() {
        let random = [0xFFu8; HANDSHAKE_RANDOM_LEN];
        let err = elect_role(&random, &random).unwrap_err();
        assert!(matches!(err, Error::HandshakeCollision));
    }

    #[test]
    fn first_differing_byte_decides_the_role() {
        let mut ours = [0u8; HANDSHAKE_RANDOM_LEN];
        let mut theirs = [0u8; HANDSHAKE_RANDOM_LEN];
        ours[4] = 9;
        theirs[4] = 3;
        assert_eq!(elect_role(&ours, &theirs).unwrap(), Role::Odd);
        assert_eq!(elect_role(&theirs, &ours).unwrap(), Role::Even);
    }
}
