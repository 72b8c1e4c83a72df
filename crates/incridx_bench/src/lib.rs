//! Benchmark utilities.

/// Deterministic pseudo-random bytes of the given size.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// A document of `words` words drawn from a vocabulary of `vocabulary`
/// distinct words, shifted by `seed` so consecutive documents differ.
pub fn document(words: usize, vocabulary: usize, seed: usize) -> String {
    let vocabulary = vocabulary.max(1);
    (0..words)
        .map(|i| format!("w{}", (i * 7 + seed) % vocabulary))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_are_deterministic() {
        assert_eq!(document(3, 10, 0), "w0 w7 w4");
        assert_eq!(document(3, 10, 0), document(3, 10, 0));
        assert_ne!(document(3, 10, 0), document(3, 10, 1));
    }

    #[test]
    fn payload_has_requested_size() {
        assert_eq!(payload(17).len(), 17);
    }
}
