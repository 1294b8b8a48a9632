use std::fmt;

use crate::types::{Result, StoreError};

const KIND_MASK: i64 = 0x0F;
const FLAG_INDEXED: i64 = 0x10;
const FLAG_UNIQUE: i64 = 0x20;
const TARGET_SHIFT: u32 = 8;

const CODE_INT: i64 = 0;
const CODE_BOOL: i64 = 1;
const CODE_LINK: i64 = 2;
const CODE_LINK_LIST: i64 = 3;

/// The closed set of column encodings.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ColumnKind {
    /// Signed 64-bit integers.
    Int,
    /// Booleans stored as 0 and 1.
    Bool,
    /// A nullable link to one row of `target`, stored as `row + 1`.
    Link {
        /// Target table index.
        target: usize,
    },
    /// Per row, an ordered list of rows of `target`.
    LinkList {
        /// Target table index.
        target: usize,
    },
}

/// Persisted per-column flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ColumnFlags {
    /// The column carries a search index.
    pub indexed: bool,
    /// The search index rejects duplicate values.
    pub unique: bool,
}

impl ColumnKind {
    /// Whether cells hold child refs.
    pub fn has_refs(self) -> bool {
        matches!(self, ColumnKind::LinkList { .. })
    }

    /// Target table of a link column.
    pub fn link_target(self) -> Option<usize> {
        match self {
            ColumnKind::Link { target } | ColumnKind::LinkList { target } => Some(target),
            ColumnKind::Int | ColumnKind::Bool => None,
        }
    }

    /// Same kind pointing at another table.
    pub fn with_target(self, target: usize) -> ColumnKind {
        match self {
            ColumnKind::Link { .. } => ColumnKind::Link { target },
            ColumnKind::LinkList { .. } => ColumnKind::LinkList { target },
            other => other,
        }
    }

    /// Whether the column may carry a search index.
    pub fn supports_search_index(self) -> bool {
        matches!(self, ColumnKind::Int | ColumnKind::Bool)
    }

    /// Value stored in new rows.
    pub fn default_value(self) -> i64 {
        0
    }

    /// Short lowercase name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            ColumnKind::Int => "int",
            ColumnKind::Bool => "bool",
            ColumnKind::Link { .. } => "link",
            ColumnKind::LinkList { .. } => "link_list",
        }
    }

    /// Encodes kind and flags as one spec entry.
    pub fn to_spec(self, flags: ColumnFlags) -> i64 {
        let (code, target) = match self {
            ColumnKind::Int => (CODE_INT, 0),
            ColumnKind::Bool => (CODE_BOOL, 0),
            ColumnKind::Link { target } => (CODE_LINK, target as i64),
            ColumnKind::LinkList { target } => (CODE_LINK_LIST, target as i64),
        };
        let mut spec = code | (target << TARGET_SHIFT);
        if flags.indexed {
            spec |= FLAG_INDEXED;
        }
        if flags.unique {
            spec |= FLAG_UNIQUE;
        }
        spec
    }

    /// Decodes a spec entry written by [`to_spec`](Self::to_spec).
    pub fn from_spec(spec: i64) -> Result<(ColumnKind, ColumnFlags)> {
        if spec < 0 || spec & !(KIND_MASK | FLAG_INDEXED | FLAG_UNIQUE) & 0xFF != 0 {
            return Err(StoreError::InvalidDatabase("column spec has unknown bits"));
        }
        let target = (spec >> TARGET_SHIFT) as usize;
        let kind = match spec & KIND_MASK {
            CODE_INT => ColumnKind::Int,
            CODE_BOOL => ColumnKind::Bool,
            CODE_LINK => ColumnKind::Link { target },
            CODE_LINK_LIST => ColumnKind::LinkList { target },
            _ => return Err(StoreError::InvalidDatabase("unknown column kind")),
        };
        if kind.link_target().is_none() && target != 0 {
            return Err(StoreError::InvalidDatabase("link target on non-link column"));
        }
        let flags = ColumnFlags {
            indexed: spec & FLAG_INDEXED != 0,
            unique: spec & FLAG_UNIQUE != 0,
        };
        if flags.unique && !flags.indexed {
            return Err(StoreError::InvalidDatabase("unique flag without index"));
        }
        if flags.indexed && !kind.supports_search_index() {
            return Err(StoreError::InvalidDatabase("search index on link column"));
        }
        Ok((kind, flags))
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.link_target() {
            Some(target) => write!(f, "{}->{}", self.name(), target),
            None => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_roundtrip_keeps_target_and_flags() {
        let flags = ColumnFlags {
            indexed: true,
            unique: true,
        };
        let spec = ColumnKind::Int.to_spec(flags);
        assert_eq!(ColumnKind::from_spec(spec).unwrap(), (ColumnKind::Int, flags));
        let link = ColumnKind::Link { target: 300 }.to_spec(ColumnFlags::default());
        assert_eq!(
            ColumnKind::from_spec(link).unwrap().0,
            ColumnKind::Link { target: 300 }
        );
        let plain = ColumnKind::LinkList { target: 2 }.to_spec(ColumnFlags::default());
        assert_eq!(
            ColumnKind::from_spec(plain).unwrap().0,
            ColumnKind::LinkList { target: 2 }
        );
    }

    #[test]
    fn malformed_specs_are_rejected() {
        assert!(ColumnKind::from_spec(9).is_err());
        assert!(ColumnKind::from_spec(CODE_INT | FLAG_UNIQUE).is_err());
        assert!(ColumnKind::from_spec(CODE_LINK_LIST | FLAG_INDEXED).is_err());
        assert!(ColumnKind::from_spec(CODE_LINK | FLAG_INDEXED).is_err());
        assert!(ColumnKind::from_spec(CODE_BOOL | (4 << TARGET_SHIFT)).is_err());
        assert!(ColumnKind::from_spec(0x40).is_err());
    }
}
