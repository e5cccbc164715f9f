//! Message signature parsing.
//!
//! A signature is a compact string like `"2u?sn"`: an optional leading
//! decimal number is the "since version" of the message, `?` marks the next
//! argument nullable, and each remaining character names an argument kind.

/// The eight argument kinds a signature character can denote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// `i` — signed 32-bit integer.
    Int,
    /// `u` — unsigned 32-bit integer.
    Uint,
    /// `f` — signed 24.8 fixed-point number.
    Fixed,
    /// `s` — NUL-terminated string.
    Str,
    /// `o` — reference to an existing object by id.
    Object,
    /// `n` — id of an object created by this message.
    NewId,
    /// `a` — raw byte array.
    Array,
    /// `h` — file descriptor (carried out of band).
    Fd,
}

impl ArgKind {
    pub fn code(self) -> char {
        match self {
            ArgKind::Int => 'i',
            ArgKind::Uint => 'u',
            ArgKind::Fixed => 'f',
            ArgKind::Str => 's',
            ArgKind::Object => 'o',
            ArgKind::NewId => 'n',
            ArgKind::Array => 'a',
            ArgKind::Fd => 'h',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'i' => Some(ArgKind::Int),
            'u' => Some(ArgKind::Uint),
            'f' => Some(ArgKind::Fixed),
            's' => Some(ArgKind::Str),
            'o' => Some(ArgKind::Object),
            'n' => Some(ArgKind::NewId),
            'a' => Some(ArgKind::Array),
            'h' => Some(ArgKind::Fd),
            _ => None,
        }
    }
}

/// One parsed argument slot: its kind and whether null is permitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub nullable: bool,
}

/// Iterate the argument slots of a signature, skipping the version prefix.
pub fn iter_args(signature: &str) -> SignatureIter<'_> {
    SignatureIter {
        rest: signature.chars(),
    }
}

/// Number of arguments the signature declares.
pub fn arg_count(signature: &str) -> usize {
    iter_args(signature).count()
}

/// The "since version" encoded as a leading decimal prefix; 1 when absent.
pub fn since_version(signature: &str) -> u32 {
    let digits: String = signature.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(1).max(1)
}

pub struct SignatureIter<'a> {
    rest: std::str::Chars<'a>,
}

impl Iterator for SignatureIter<'_> {
    type Item = ArgSpec;

    fn next(&mut self) -> Option<ArgSpec> {
        let mut nullable = false;
        for c in self.rest.by_ref() {
            if c == '?' {
                nullable = true;
            } else if c.is_ascii_digit() {
                // version prefix
            } else if let Some(kind) = ArgKind::from_code(c) {
                return Some(ArgSpec { kind, nullable });
            } else {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_kinds_parse() {
        let specs: Vec<_> = iter_args("iufsonah").collect();
        let kinds: Vec<_> = specs.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ArgKind::Int,
                ArgKind::Uint,
                ArgKind::Fixed,
                ArgKind::Str,
                ArgKind::Object,
                ArgKind::NewId,
                ArgKind::Array,
                ArgKind::Fd,
            ]
        );
        assert!(specs.iter().all(|s| !s.nullable));
    }

    #[test]
    fn nullable_marks_following_argument_only() {
        let specs: Vec<_> = iter_args("u?so").collect();
        assert_eq!(specs.len(), 3);
        assert!(!specs[0].nullable);
        assert!(specs[1].nullable);
        assert_eq!(specs[1].kind, ArgKind::Str);
        assert!(!specs[2].nullable);
    }

    #[test]
    fn version_prefix_skipped_in_args() {
        assert_eq!(arg_count("3u"), 1);
        assert_eq!(since_version("3u"), 3);
        assert_eq!(since_version("12?o"), 12);
        assert_eq!(since_version("u"), 1);
        assert_eq!(since_version(""), 1);
    }

    #[test]
    fn empty_signature_has_no_args() {
        assert_eq!(arg_count(""), 0);
        assert_eq!(arg_count("4"), 0);
    }
}
