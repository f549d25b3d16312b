//! Debian-policy version ordering.
//!
//! Versions have the shape `[epoch:]upstream[-revision]`. Comparison looks
//! at the epoch numerically, then at the upstream part and the revision
//! with the dpkg algorithm: alternating non-digit and digit runs, where the
//! non-digit runs use an alphabet in which `~` sorts before everything
//! (even the end of the string) and letters sort before other characters.
//!
//! Parsing never fails. Anything that does not look like a version is
//! still compared lexically on a best-effort basis.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed `[epoch:]upstream[-revision]` version.
///
/// Equality follows the ordering, so `1.0` and `1.00` are equal.
#[derive(Debug, Clone)]
pub struct Version {
    epoch: u32,
    upstream: String,
    revision: String,
}

impl Version {
    /// Parse a version string. Malformed input degrades gracefully.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();

        let (epoch, rest) = match input.split_once(':') {
            Some((head, tail)) if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) => {
                match head.parse::<u32>() {
                    Ok(epoch) => (epoch, tail),
                    Err(_) => (u32::MAX, tail),
                }
            }
            _ => (0, input),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((upstream, revision)) => (upstream, revision),
            None => (rest, "0"),
        };

        Self {
            epoch,
            upstream: upstream.to_string(),
            revision: revision.to_string(),
        }
    }

    /// Leading epoch, `0` when absent.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Upstream part (may itself contain `-` when a revision exists).
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Revision part, `"0"` when absent.
    pub fn revision(&self) -> &str {
        &self.revision
    }
}

impl FromStr for Version {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}:", self.epoch)?;
        }
        f.write_str(&self.upstream)?;
        if self.revision != "0" {
            write!(f, "-{}", self.revision)?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        compare(self, other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

/// Compare two versions under Debian policy.
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.epoch
        .cmp(&b.epoch)
        .then_with(|| compare_fragment(&a.upstream, &b.upstream))
        .then_with(|| compare_fragment(&a.revision, &b.revision))
}

/// Parse and compare two version strings.
pub fn compare_str(a: &str, b: &str) -> Ordering {
    compare(&Version::parse(a), &Version::parse(b))
}

/// Weight of a single character inside a non-digit run.
///
/// `None` stands for the end of the string or the start of a digit run.
fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(b'~') => -1,
        Some(c) => i32::from(c) + 256,
    }
}

/// dpkg `verrevcmp` over one upstream or revision fragment.
fn compare_fragment(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < a.len() || j < b.len() {
        // Non-digit prefix.
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = char_order(a.get(i).copied().filter(|c| !c.is_ascii_digit()));
            let bc = char_order(b.get(j).copied().filter(|c| !c.is_ascii_digit()));
            if ac != bc {
                return ac.cmp(&bc);
            }
            if i < a.len() && !a[i].is_ascii_digit() {
                i += 1;
            }
            if j < b.len() && !b[j].is_ascii_digit() {
                j += 1;
            }
        }

        // Digit run, compared numerically without parsing into an integer.
        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while i < a.len() && a[i].is_ascii_digit() && j < b.len() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_components() {
        let v = Version::parse("10:4.0.1~alpha-4-5");
        assert_eq!(v.epoch(), 10);
        assert_eq!(v.upstream(), "4.0.1~alpha-4");
        assert_eq!(v.revision(), "5");

        let v = Version::parse("1.2.3");
        assert_eq!(v.epoch(), 0);
        assert_eq!(v.upstream(), "1.2.3");
        assert_eq!(v.revision(), "0");
    }

    #[test]
    fn test_non_numeric_epoch_is_upstream() {
        let v = Version::parse("abc:1.0");
        assert_eq!(v.epoch(), 0);
        assert_eq!(v.upstream(), "abc:1.0");
    }

    #[test]
    fn test_basic_ordering() {
        assert_eq!(compare_str("1.1", "1.10"), Ordering::Less);
        assert_eq!(compare_str("9", "10"), Ordering::Less);
        assert_eq!(compare_str("3.0~beta1", "3.0"), Ordering::Less);
        assert_eq!(compare_str("2:1", "1:2"), Ordering::Greater);
        assert_eq!(compare_str("1.0", "1.0"), Ordering::Equal);
        assert_eq!(compare_str("1.0", "1.00"), Ordering::Equal);
    }

    #[test]
    fn test_tilde_and_letters() {
        assert_eq!(compare_str("1.0~rc1", "1.0~rc2"), Ordering::Less);
        assert_eq!(compare_str("1.0~~", "1.0~"), Ordering::Less);
        assert_eq!(compare_str("1.0a", "1.0"), Ordering::Greater);
        // Letters sort before non-letters.
        assert_eq!(compare_str("1.0a", "1.0+"), Ordering::Less);
        assert_eq!(compare_str("1.0+", "1.0."), Ordering::Less);
    }

    #[test]
    fn test_revision_ordering() {
        assert_eq!(compare_str("1.0-1", "1.0-2"), Ordering::Less);
        assert_eq!(compare_str("1.0", "1.0-0"), Ordering::Equal);
        assert_eq!(compare_str("1.0-10", "1.0-9"), Ordering::Greater);
    }

    #[test]
    fn test_large_digit_runs_do_not_overflow() {
        let big = "123456789012345678901234567890";
        let bigger = "123456789012345678901234567891";
        assert_eq!(compare_str(big, bigger), Ordering::Less);
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(Version::parse("2:1.4-3").to_string(), "2:1.4-3");
        assert_eq!(Version::parse("1.4").to_string(), "1.4");
    }

    #[test]
    fn test_garbage_never_panics() {
        for s in ["", ":", "-", "::--", "~~~", "é1", "1:-"] {
            let _ = compare_str(s, "1.0");
            let _ = compare_str("1.0", s);
        }
    }
}
