//! Rolling CRC-32 (IEEE 802.3) state.

use crc32fast::Hasher;

/// Incremental CRC-32 over the bytes fed to [`append`](Crc32::append).
///
/// The rolling state starts at `0xFFFFFFFF` and [`get`](Crc32::get)
/// returns the finalized (bit-inverted) checksum; both details live
/// inside `crc32fast`.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn get(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        let mut crc = Crc32::new();
        crc.append(b"hello");
        assert_eq!(crc.get(), 0x3610A686);

        let mut crc = Crc32::new();
        crc.append(b"1234");
        assert_eq!(crc.get(), 0x9BE3E0A3);
    }

    #[test]
    fn chunked_equals_whole() {
        let mut a = Crc32::new();
        a.append(b"hel");
        a.append(b"lo");
        let mut b = Crc32::new();
        b.append(b"hello");
        assert_eq!(a.get(), b.get());
    }

    #[test]
    fn empty_input() {
        assert_eq!(Crc32::new().get(), 0);
    }
}
