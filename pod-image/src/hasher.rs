use blake3;
use std::hash::{Hash, Hasher};

pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct StdHasher<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for StdHasher<'a> {
            fn finish(&self) -> u64 {
                unreachable!("blake3 digests are read with finalize");
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut StdHasher(self))
    }
}

/// Hex digest of everything in `inputs`, in order.
pub fn digest<I: Hash>(inputs: I) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.input(inputs);
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_give_equal_digests() {
        assert_eq!(digest(("fastapi==0.104.1", 8000u16)), digest(("fastapi==0.104.1", 8000u16)));
        assert_ne!(digest(("fastapi==0.104.1", 8000u16)), digest(("fastapi==0.104.1", 3000u16)));
    }
}
