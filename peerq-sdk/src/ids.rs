//! Time-sortable id generation for transfers and offline operations.
//!
//! 26 characters of Crockford base32: 48 bits of milliseconds since
//! epoch, then 80 bits of randomness. Ids generated by one process sort
//! chronologically, which the offline replay path leans on as a
//! tie-break alongside the stored `ts`.

use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const TIME_CHARS: usize = 10;
const RAND_CHARS: usize = 16;

/// Generate a new time-sortable id.
pub fn generate() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let entropy: u128 = {
        let mut rng = rand::thread_rng();
        let hi: u64 = rng.r#gen();
        let lo: u64 = rng.r#gen();
        ((hi as u128) << 64) | lo as u128
    };

    let mut out = String::with_capacity(TIME_CHARS + RAND_CHARS);
    out.extend(base32(millis as u128, TIME_CHARS));
    out.extend(base32(entropy, RAND_CHARS));
    out
}

/// Most-significant-first base32 digits of `value`, `width` chars wide.
fn base32(value: u128, width: usize) -> impl Iterator<Item = char> {
    (0..width).map(move |i| {
        let shift = 5 * (width - 1 - i);
        ALPHABET[((value >> shift) & 0x1F) as usize] as char
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_and_uniqueness() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
    }

    #[test]
    fn alphabet_is_crockford() {
        for c in generate().chars() {
            assert!(
                ALPHABET.contains(&(c as u8)),
                "unexpected id character: {c}"
            );
        }
    }

    #[test]
    fn sorts_chronologically() {
        let a = generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate();
        assert!(a < b, "ids should sort by time: {a} vs {b}");
    }
}
