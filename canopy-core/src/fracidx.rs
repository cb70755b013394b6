//! Fractional indices for ordering siblings without renumbering.
//!
//! An index is a string over the printable ASCII range `' '..='~'`.
//! Siblings sort by plain byte comparison, so a new sibling can always be
//! placed between two neighbours by generating a key that sorts strictly
//! between theirs:
//!
//! ```text
//!   before = "A"          after = "B"
//!   "A" < "AO" < "B"      (midpoint found one digit deeper)
//! ```
//!
//! Random trailing digits are appended after the midpoint so two replicas
//! inserting into the same gap rarely pick the same key. The RNG is passed
//! in by the caller; a seeded RNG makes the output reproducible.
//!
//! Reference: Evan Wallace, "CRDT: Fractional Indexing"

use rand::Rng;

/// Smallest digit of the alphabet.
pub const MIN_DIGIT: u8 = b' ';
/// Largest digit of the alphabet.
pub const MAX_DIGIT: u8 = b'~';

/// Exclusive upper bound of the random jitter appended to a new key.
const MAX_JITTER: u32 = 0x100;

/// Whether `value` only uses digits of the index alphabet.
pub fn is_frac_idx(value: &str) -> bool {
    value.bytes().all(|b| (MIN_DIGIT..=MAX_DIGIT).contains(&b))
}

/// Generate a key sorting strictly after `before` and strictly before
/// `after`. An empty string means "unbounded" on that side.
///
/// Keys outside the alphabet are tolerated but the ordering guarantee
/// only holds for valid keys with `before < after`.
pub fn between<R: Rng + ?Sized>(rng: &mut R, before: &str, after: &str) -> String {
    let before = before.as_bytes();
    let after = after.as_bytes();
    let past_max = u32::from(MAX_DIGIT) + 1;

    let mut found_difference = false;
    let mut digits: Vec<u8> = Vec::with_capacity(before.len().max(after.len()) + 3);
    let mut i = 0;

    loop {
        // Missing digits of `before` count as the minimum digit.
        let digit_before = before.get(i).map_or(u32::from(MIN_DIGIT), |&d| u32::from(d));
        // Missing digits of `after`, and every digit once the shared prefix
        // has ended, count as one past the maximum digit.
        let digit_after = if found_difference {
            past_max
        } else {
            after.get(i).map_or(past_max, |&d| u32::from(d))
        };

        let pick = (digit_before + digit_after) / 2;
        digits.push(pick as u8);

        if pick <= digit_before {
            if digit_before < digit_after {
                found_difference = true;
            }
            i += 1;
            continue;
        }

        // `pick` is already below the upper bound at this digit, so any
        // suffix keeps the key below `after`.
        let base = u32::from(MAX_DIGIT - MIN_DIGIT) + 1;
        let mut jitter = rng.gen_range(0..MAX_JITTER);
        while jitter > 0 {
            digits.push(MIN_DIGIT + (jitter % base) as u8);
            jitter /= base;
        }

        return digits.into_iter().map(char::from).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn zero() -> StepRng {
        StepRng::new(0, 0)
    }

    #[test]
    fn test_unbounded_both_sides() {
        assert_eq!(between(&mut zero(), "", ""), "O");
    }

    #[test]
    fn test_before_first() {
        assert_eq!(between(&mut zero(), "", "A"), "0");
    }

    #[test]
    fn test_after_last() {
        let got = between(&mut zero(), "A", "");
        assert_eq!(got, "`");
        assert!(got.as_str() > "A");
    }

    #[test]
    fn test_between_distant_neighbours() {
        assert_eq!(between(&mut zero(), "A", "O"), "I");
    }

    #[test]
    fn test_between_adjacent_digits_goes_deeper() {
        let got = between(&mut zero(), "A", "B");
        assert_eq!(got, "AO");
        assert!("A" < got.as_str() && got.as_str() < "B");
    }

    #[test]
    fn test_after_with_shared_prefix() {
        let got = between(&mut zero(), "AB", "AC");
        assert!("AB" < got.as_str() && got.as_str() < "AC", "got {got:?}");
    }

    #[test]
    fn test_jitter_stays_in_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let key = between(&mut rng, "a", "b");
            assert!(is_frac_idx(&key), "{key:?} left the alphabet");
            assert!("a" < key.as_str() && key.as_str() < "b");
        }
    }

    #[test]
    fn test_repeated_insertion_keeps_order() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut keys = vec![between(&mut rng, "", "")];
        for step in 0..300 {
            // alternate between appending, prepending and splitting a gap
            let (before, after) = match step % 3 {
                0 => (keys.last().cloned().unwrap_or_default(), String::new()),
                1 => (String::new(), keys[0].clone()),
                _ => {
                    let at = step % (keys.len() - 1);
                    (keys[at].clone(), keys[at + 1].clone())
                }
            };
            let key = between(&mut rng, &before, &after);
            assert!(before.is_empty() || before < key, "{before:?} !< {key:?}");
            assert!(after.is_empty() || key < after, "{key:?} !< {after:?}");
            keys.push(key);
            keys.sort();
        }
    }

    #[test]
    fn test_deterministic_with_seed() {
        let mut a = StdRng::seed_from_u64(99);
        let mut b = StdRng::seed_from_u64(99);
        for _ in 0..20 {
            assert_eq!(between(&mut a, "F", "G"), between(&mut b, "F", "G"));
        }
    }

    #[test]
    fn test_is_frac_idx() {
        assert!(is_frac_idx(""));
        assert!(is_frac_idx(" ~AZaz09"));
        assert!(!is_frac_idx("\u{7f}"));
        assert!(!is_frac_idx("é"));
        assert!(!is_frac_idx("\n"));
    }
}
