
use bytes::Bytes;

/// Keyed byte-oriented stream cipher (RC4). Encryption and decryption are
/// the same operation; one instance is created per worker so that the
/// keystream stays synchronised across the whole session rather than being
/// reset per packet.
pub struct StreamCipher {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl StreamCipher {
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "cipher key must not be empty");

        let mut state = [0u8; 256];
        for (idx, byte) in state.iter_mut().enumerate() {
            *byte = idx as u8;
        }

        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(state[i])
                .wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        StreamCipher { state, i: 0, j: 0 }
    }

    /// Applies the next `data.len()` keystream bytes to `data`.
    pub fn crypt(&mut self, data: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(data.len());
        for &byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state
                [(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize];
            out.push(byte ^ k);
        }
        Bytes::from(out)
    }
}
