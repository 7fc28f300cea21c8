use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A loose dotted version string, as found in pkginfo records, bundle
/// plists and package receipts.
///
/// Trailing zero components are insignificant: `10.0` compares equal to
/// `10.0.0`. Components mix numeric runs and alphabetic runs, so `10.5.8a1`
/// parses as `[10, 5, 8, a, 1]`. Numeric components order below alphabetic
/// ones.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    raw: String,
    components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Component {
    Num(u64),
    Alpha(String),
}

impl Version {
    pub fn new(raw: &str) -> Version {
        Version {
            raw: raw.to_string(),
            components: tokenize(raw),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The version with trailing `.0` components removed; `1.2.0`
    /// normalizes to `1.2`. A bare `0` stays `0`.
    pub fn normalized(&self) -> String {
        let trimmed = self.trimmed();
        if trimmed.is_empty() {
            return "0".to_string();
        }
        trimmed
            .iter()
            .map(|c| match c {
                Component::Num(n) => n.to_string(),
                Component::Alpha(a) => a.clone(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    fn trimmed(&self) -> &[Component] {
        let mut end = self.components.len();
        while end > 0 && self.components[end - 1] == Component::Num(0) {
            end -= 1;
        }
        &self.components[..end]
    }
}

fn tokenize(raw: &str) -> Vec<Component> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut cur_is_digit = false;

    let mut flush = |buf: &mut String, is_digit: bool, out: &mut Vec<Component>| {
        if buf.is_empty() {
            return;
        }
        if is_digit {
            // Absurdly long digit runs saturate rather than wrap.
            let n = buf.parse::<u64>().unwrap_or(u64::max_value());
            out.push(Component::Num(n));
        } else {
            out.push(Component::Alpha(buf.clone()));
        }
        buf.clear();
    };

    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            if !cur.is_empty() && !cur_is_digit {
                flush(&mut cur, cur_is_digit, &mut out);
            }
            cur_is_digit = true;
            cur.push(ch);
        } else if ch.is_ascii_alphabetic() {
            if !cur.is_empty() && cur_is_digit {
                flush(&mut cur, cur_is_digit, &mut out);
            }
            cur_is_digit = false;
            cur.push(ch.to_ascii_lowercase());
        } else {
            // Separators: '.', '-', '_', whitespace and anything else.
            flush(&mut cur, cur_is_digit, &mut out);
        }
    }
    flush(&mut cur, cur_is_digit, &mut out);

    out
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.trimmed();
        let b = other.trimmed();
        let len = a.len().max(b.len());
        const ZERO: Component = Component::Num(0);

        for i in 0..len {
            let x = a.get(i).unwrap_or(&ZERO);
            let y = b.get(i).unwrap_or(&ZERO);
            let ord = match (x, y) {
                (Component::Num(m), Component::Num(n)) => m.cmp(n),
                (Component::Alpha(m), Component::Alpha(n)) => m.cmp(n),
                // Numbers sort below letters: 1.0.1 < 1.0b1
                (Component::Num(_), Component::Alpha(_)) => Ordering::Less,
                (Component::Alpha(_), Component::Num(_)) => Ordering::Greater,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }

        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.trimmed().hash(state)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Version::new(s))
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Version {
        Version::new(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Version {
        Version::new(&s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Version::new(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_right_zero_equivalence() {
        assert_eq!(Version::new("1.0"), Version::new("1.0.0"));
        assert_eq!(Version::new("1.0"), Version::new("1.0.0.0"));
        assert_eq!(Version::new("10.0"), Version::new("10.0.0"));
        assert_ne!(Version::new("1.0"), Version::new("1.0.1"));
    }

    #[test]
    fn test_total_order() {
        assert!(Version::new("1.0.1") > Version::new("1.0"));
        assert!(Version::new("2.0") > Version::new("1.9.9"));
        assert!(Version::new("10.10") > Version::new("10.9"));
        assert!(Version::new("0.1.2") < Version::new("34.1.0"));
    }

    #[test]
    fn test_alpha_components() {
        // Letters sort above numbers in the same position.
        assert!(Version::new("1.0b1") > Version::new("1.0.1"));
        assert!(Version::new("1.0a1") < Version::new("1.0b1"));
        assert_eq!(Version::new("1.0B1"), Version::new("1.0b1"));
        // "8a1" splits into three components.
        assert!(Version::new("10.5.8a1") > Version::new("10.5.8"));
    }

    #[test]
    fn test_hash_matches_eq() {
        use std::collections::hash_map::DefaultHasher;

        let h = |v: &Version| {
            let mut hasher = DefaultHasher::new();
            v.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(h(&Version::new("2.0")), h(&Version::new("2.0.0")));
    }

    #[test]
    fn test_normalized() {
        assert_eq!(Version::new("10.0.0").normalized(), "10");
        assert_eq!(Version::new("1.2.0").normalized(), "1.2");
        assert_eq!(Version::new("1.2.3").normalized(), "1.2.3");
        assert_eq!(Version::new("0").normalized(), "0");
        assert_eq!(Version::new("1.0b1").normalized(), "1.0.b.1");
    }

    #[test]
    fn test_display_keeps_raw() {
        assert_eq!(Version::new("10.0").to_string(), "10.0");
    }
}
