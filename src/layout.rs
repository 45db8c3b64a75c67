//! Layout manifest: describes how a version's bytes — content or packed —
//! are assembled from base ranges and newly emitted segments.
//!
//! Derives `serde::Serialize` (not `Deserialize` — a manifest is produced
//! by this crate, never consumed back in) so a caller embedding the
//! engine in a service can log or ship it.

use serde::Serialize;

/// One contiguous run of a [`Layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "src", rename_all = "lowercase")]
pub enum LayoutSection {
    /// Freshly emitted bytes this version. `len` is `None` only for a
    /// trailing endless section.
    New { ofs: u64, len: Option<u64> },
    /// Bytes reused verbatim from the base version at `[base_ofs,
    /// base_ofs+len)`.
    Base { ofs: u64, len: u64, base_ofs: u64 },
}

impl LayoutSection {
    fn ofs(&self) -> u64 {
        match *self {
            LayoutSection::New { ofs, .. } => ofs,
            LayoutSection::Base { ofs, .. } => ofs,
        }
    }

    fn len(&self) -> Option<u64> {
        match *self {
            LayoutSection::New { len, .. } => len,
            LayoutSection::Base { len, .. } => Some(len),
        }
    }

    /// Whether `self` immediately precedes `next` and the two can be
    /// merged into one run without losing information.
    fn merges_into(&self, next: &LayoutSection) -> bool {
        let Some(my_len) = self.len() else {
            return false;
        };
        if self.ofs() + my_len != next.ofs() {
            return false;
        }
        match (self, next) {
            (LayoutSection::New { .. }, LayoutSection::New { .. }) => true,
            (
                LayoutSection::Base { base_ofs: a, len: a_len, .. },
                LayoutSection::Base { base_ofs: b, .. },
            ) => a + a_len == *b,
            _ => false,
        }
    }

    fn merge(self, next: LayoutSection) -> LayoutSection {
        match (self, next) {
            (LayoutSection::New { ofs, len: a }, LayoutSection::New { len: b, .. }) => {
                LayoutSection::New {
                    ofs,
                    len: match (a, b) {
                        (Some(a), Some(b)) => Some(a + b),
                        _ => None,
                    },
                }
            }
            (
                LayoutSection::Base { ofs, len: a, base_ofs },
                LayoutSection::Base { len: b, .. },
            ) => LayoutSection::Base {
                ofs,
                len: a + b,
                base_ofs,
            },
            (a, _) => a,
        }
    }
}

/// A manifest describing how one version's bytes are assembled. `base` is
/// the prior version number, present iff any [`LayoutSection::Base`]
/// appears in `sections`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Layout {
    pub base: Option<u64>,
    pub sections: Vec<LayoutSection>,
}

impl Layout {
    pub fn new(base: Option<u64>) -> Self {
        Self {
            base,
            sections: Vec::new(),
        }
    }

    /// Appends `section`, merging it into the last section when they're
    /// adjacent same-kind runs.
    pub fn push(&mut self, section: LayoutSection) {
        if let Some(last) = self.sections.last() {
            if last.merges_into(&section) {
                let merged = self.sections.pop().unwrap().merge(section);
                self.sections.push(merged);
                return;
            }
        }
        self.sections.push(section);
    }
}
