//! Dependency kinds and their canonical bitmask form.

use crate::spec::SpecError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Canonical bit-set over dependency kinds (build, link, run, test).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DepFlag(u8);

impl DepFlag {
    pub const NONE: DepFlag = DepFlag(0);
    pub const BUILD: DepFlag = DepFlag(0b0001);
    pub const LINK: DepFlag = DepFlag(0b0010);
    pub const RUN: DepFlag = DepFlag(0b0100);
    pub const TEST: DepFlag = DepFlag(0b1000);
    pub const ALL: DepFlag = DepFlag(0b1111);
    /// Edges that matter at install time: link and run.
    pub const LINK_RUN: DepFlag = DepFlag(0b0110);
    /// Kinds assumed for a `^` edge that names none.
    pub const DEFAULT: DepFlag = DepFlag(0b0011);

    /// Names in canonical order, paired with their bit.
    pub const NAMES: [(&'static str, DepFlag); 4] = [
        ("build", DepFlag::BUILD),
        ("link", DepFlag::LINK),
        ("run", DepFlag::RUN),
        ("test", DepFlag::TEST),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        DepFlag(bits & DepFlag::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: DepFlag) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: DepFlag) -> bool {
        self.0 & other.0 != 0
    }

    /// Kind names set in this flag, in canonical order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl BitOr for DepFlag {
    type Output = DepFlag;
    fn bitor(self, rhs: DepFlag) -> DepFlag {
        DepFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for DepFlag {
    fn bitor_assign(&mut self, rhs: DepFlag) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DepFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

impl Serialize for DepFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DepFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        canonicalize(&names).map_err(serde::de::Error::custom)
    }
}

/// Convert a list of dependency kind names into a canonical bitmask.
///
/// Accepts `build`, `link`, `run`, `test` and the shorthand `all`. Names are
/// trimmed; empty entries are ignored.
pub fn canonicalize<S: AsRef<str>>(names: &[S]) -> Result<DepFlag, SpecError> {
    let mut flag = DepFlag::NONE;
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() {
            continue;
        }
        if name == "all" {
            flag |= DepFlag::ALL;
            continue;
        }
        match DepFlag::NAMES.iter().find(|(n, _)| *n == name) {
            Some((_, bit)) => flag |= *bit,
            None => return Err(SpecError::InvalidDeptype(name.to_owned())),
        }
    }
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_unions_kinds() {
        let flag = canonicalize(&["link", "build"]).unwrap();
        assert_eq!(flag, DepFlag::BUILD | DepFlag::LINK);
        assert_eq!(flag.names(), vec!["build", "link"]);
    }

    #[test]
    fn canonicalize_all_shorthand() {
        assert_eq!(canonicalize(&["all"]).unwrap(), DepFlag::ALL);
    }

    #[test]
    fn canonicalize_rejects_unknown_kind() {
        let err = canonicalize(&["build", "color"]).unwrap_err();
        assert!(err.to_string().contains("color"));
    }

    #[test]
    fn empty_list_is_no_flag() {
        let empty: [&str; 0] = [];
        assert!(canonicalize(&empty).unwrap().is_empty());
    }

    #[test]
    fn serializes_as_name_list() {
        let flag = DepFlag::BUILD | DepFlag::RUN;
        let json = serde_json::to_string(&flag).unwrap();
        assert_eq!(json, r#"["build","run"]"#);
        let back: DepFlag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flag);
    }

    #[test]
    fn link_run_mask() {
        assert!(DepFlag::LINK_RUN.intersects(DepFlag::LINK));
        assert!(!DepFlag::LINK_RUN.intersects(DepFlag::BUILD));
    }
}
