use dog_blob::Sha256Digest;
use sha2::{Digest, Sha256};

/// Streaming digest over the bytes of an upload, or nothing at all when no
/// checksum was declared or the stream does not start at object offset 0.
#[derive(Clone, Default)]
pub enum Digester {
    Sha256(Sha256),
    #[default]
    Noop,
}

impl Digester {
    pub fn sha256() -> Self {
        Self::Sha256(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Self::Sha256(hasher) = self {
            hasher.update(data);
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Sha256(_))
    }

    /// The digest, or `None` for the no-op variant.
    pub fn finish(self) -> Option<Sha256Digest> {
        match self {
            Self::Sha256(hasher) => Some(hasher.finalize().into()),
            Self::Noop => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_blob::sha256;

    #[test]
    fn streaming_matches_one_shot() {
        let mut digester = Digester::sha256();
        digester.update(b"hello ");
        digester.update(b"");
        digester.update(b"world");
        assert_eq!(digester.finish(), Some(sha256(b"hello world")));
    }

    #[test]
    fn noop_yields_nothing() {
        let mut digester = Digester::default();
        digester.update(b"ignored");
        assert!(!digester.is_active());
        assert_eq!(digester.finish(), None);
    }
}
