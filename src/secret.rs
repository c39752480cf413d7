//! Containers for secrets that clear them on drop.
//!
//! We can't be totally sure that every library below us scrubs its own
//! key material, but wrapping what passes through this crate at least
//! reduces the number of secrets left lying around in memory.

use zeroize::{Zeroize, Zeroizing};

/// Constant time byte slice equality.
#[inline]
pub fn secure_eq<A: AsRef<[u8]> + ?Sized, B: AsRef<[u8]> + ?Sized>(a: &A, b: &B) -> bool {
    let (a, b) = (a.as_ref(), b.as_ref());
    if a.len() == b.len() {
        let mut x = 0u8;
        for (aa, bb) in a.iter().zip(b.iter()) {
            x |= *aa ^ *bb;
        }
        x == 0
    } else {
        false
    }
}

/// A variable-length secret byte buffer, zeroed when dropped.
#[derive(Clone)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(len: usize) -> Self {
        Self(Zeroizing::new(vec![0u8; len]))
    }

    /// Move bytes into a secret, scrubbing the source.
    pub fn from_bytes_then_delete(b: &mut [u8]) -> Self {
        let ret = Self(Zeroizing::new(b.to_vec()));
        b.zeroize();
        ret
    }

    /// Copy bytes into a secret. The caller is responsible for the
    /// lifetime of the source copy.
    pub fn from_slice(b: &[u8]) -> Self {
        Self(Zeroizing::new(b.to_vec()))
    }

    pub fn from_vec(mut b: Vec<u8>) -> Self {
        let ret = Self(Zeroizing::new(b.clone()));
        b.zeroize();
        ret
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn eq_bytes(&self, other: &[u8]) -> bool {
        secure_eq(self.as_bytes(), other)
    }
}

impl AsRef<[u8]> for SecretBytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        secure_eq(self.as_bytes(), other.as_bytes())
    }
}
impl Eq for SecretBytes {}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_eq_matches_and_rejects() {
        assert!(secure_eq(&[1u8, 2, 3][..], &[1u8, 2, 3][..]));
        assert!(!secure_eq(&[1u8, 2, 3][..], &[1u8, 2, 4][..]));
        assert!(!secure_eq(&[1u8, 2][..], &[1u8, 2, 3][..]));
    }

    #[test]
    fn from_bytes_then_delete_scrubs_source() {
        let mut src = [7u8; 8];
        let s = SecretBytes::from_bytes_then_delete(&mut src);
        assert_eq!(src, [0u8; 8]);
        assert_eq!(s.as_bytes(), &[7u8; 8]);
    }
}
