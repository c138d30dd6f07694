/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Connection tokens: the 16-byte handshake header sent on every fresh channel socket */
use crate::tag;
use crate::util::*;
use nix::time;

/** The 16-byte handshake record written as the first bytes of every freshly
 * opened channel socket.
 *
 * The header carries the protocol version and per-connection flags; the key
 * identifies the session, so that a reconnect attempt (header with
 * [CONN_UPDATE_BIT]) can be matched to the session it resumes. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken {
    pub header: u32,
    pub key: [u32; 3],
}

fn token_header(reconnectable: bool, update: bool) -> u32 {
    (PROTOCOL_VERSION << 16)
        | (if update { CONN_UPDATE_BIT } else { 0 })
        | (if reconnectable {
            CONN_RECONNECTABLE_BIT
        } else {
            0
        })
        | CONN_FIXED_BIT
}

/** Allocator for session keys.
 *
 * Each supervisor owns one minter; the key state persists between mints so
 * that even a hypothetical short random read cannot correlate successive
 * tokens. */
pub struct TokenMinter {
    key: [u32; 3],
}

impl TokenMinter {
    pub fn new() -> TokenMinter {
        TokenMinter { key: [0; 3] }
    }

    /** Fill the key with fresh random data; whatever was in the key before
     * is shuffled in, together with process identity and the clock. */
    fn refill_key(&mut self) -> Result<(), String> {
        self.key[0] = self.key[0].wrapping_mul(13);
        self.key[1] = self.key[1].wrapping_mul(17);
        self.key[2] = self.key[2].wrapping_mul(29);

        self.key[0] = self.key[0].wrapping_add(std::process::id());
        if let Ok(tp) = time::clock_gettime(time::ClockId::CLOCK_MONOTONIC) {
            self.key[1] = self.key[1].wrapping_add(1 + tp.tv_sec() as u32);
            self.key[2] = self.key[2].wrapping_add(1 + tp.tv_nsec() as u32);
        }

        let mut rand_bytes = [0_u8; 12];
        getrandom::getrandom(&mut rand_bytes)
            .map_err(|x| tag!("Failed to get random bytes for session key: {}", x))?;
        for (i, chunk) in rand_bytes.chunks_exact(4).enumerate() {
            self.key[i] = self.key[i].wrapping_add(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(())
    }

    /** Create a token for a fresh connection */
    pub fn mint(&mut self, reconnectable: bool, update: bool) -> Result<ConnectionToken, String> {
        self.refill_key()?;
        Ok(ConnectionToken {
            header: token_header(reconnectable, update),
            key: self.key,
        })
    }
}

impl ConnectionToken {
    /** Return a copy of the token with the update bit set; key and version unchanged */
    pub fn flag_update(&self) -> ConnectionToken {
        ConnectionToken {
            header: self.header | CONN_UPDATE_BIT,
            key: self.key,
        }
    }
    pub fn is_update(&self) -> bool {
        self.header & CONN_UPDATE_BIT != 0
    }
    pub fn is_reconnectable(&self) -> bool {
        self.header & CONN_RECONNECTABLE_BIT != 0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        cat4x4(
            self.header.to_le_bytes(),
            self.key[0].to_le_bytes(),
            self.key[1].to_le_bytes(),
            self.key[2].to_le_bytes(),
        )
    }

    /** Parse and validate a received token; refuses version mismatches */
    pub fn from_bytes(buf: &[u8; 16]) -> Result<ConnectionToken, String> {
        let header = u32::from_le_bytes(buf[..4].try_into().unwrap());
        if header & CONN_FIXED_BIT == 0 {
            return Err(tag!(
                "Connection header {:08x} lacks fixed bit: endianness mismatch or garbage input",
                header
            ));
        }
        let version = header >> 16;
        if version != PROTOCOL_VERSION {
            return Err(tag!(
                "Connection header version mismatch: remote {}, local {}",
                version,
                PROTOCOL_VERSION
            ));
        }
        Ok(ConnectionToken {
            header,
            key: [
                u32::from_le_bytes(buf[4..8].try_into().unwrap()),
                u32::from_le_bytes(buf[8..12].try_into().unwrap()),
                u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let mut minter = TokenMinter::new();
        let t = minter.mint(true, false).unwrap();
        assert!(t.is_reconnectable());
        assert!(!t.is_update());
        let u = t.flag_update();
        assert!(u.is_update());
        assert_eq!(u.key, t.key);

        let parsed = ConnectionToken::from_bytes(&u.to_bytes()).unwrap();
        assert_eq!(parsed, u);
    }

    #[test]
    fn token_rejects_bad_header() {
        /* fixed bit clear */
        let mut buf = [0_u8; 16];
        assert!(ConnectionToken::from_bytes(&buf).is_err());
        /* wrong version */
        buf[..4].copy_from_slice(&(((PROTOCOL_VERSION + 1) << 16) | CONN_FIXED_BIT).to_le_bytes());
        assert!(ConnectionToken::from_bytes(&buf).is_err());
    }

    #[test]
    fn token_keys_unique() {
        /* Across a million mints in one process, no two keys collide */
        let mut minter = TokenMinter::new();
        let mut keys: Vec<[u32; 3]> = Vec::with_capacity(1 << 20);
        for _ in 0..(1 << 20) {
            keys.push(minter.mint(false, false).unwrap().key);
        }
        keys.sort_unstable();
        for w in keys.windows(2) {
            assert_ne!(w[0], w[1]);
        }
    }
}
