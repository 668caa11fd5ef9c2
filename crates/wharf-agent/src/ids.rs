//! Short opaque identifiers for connections, watchers and events.

use rand::rngs::OsRng;
use rand::RngCore;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TOKEN_LEN: usize = 7;

/// A 7-character base36 token. Collision probability is negligible for the
/// lifetimes involved (connections and watchers within one agent process).
pub fn token() -> String {
    let mut value = OsRng.next_u64();
    let mut out = String::with_capacity(TOKEN_LEN);
    for _ in 0..TOKEN_LEN {
        out.push(ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_seven_base36_chars() {
        for _ in 0..100 {
            let t = token();
            assert_eq!(t.len(), 7);
            assert!(t.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn tokens_are_not_constant() {
        let a = token();
        let b = token();
        let c = token();
        assert!(a != b || b != c);
    }
}
