//! Model-build template with named insertion slots.
//!
//! A template line containing `INSERT_FLAG_<NAME>` is a slot. Each of the six
//! markers must appear exactly once; rendering replaces the whole slot line
//! with the generated block.

use std::fmt;

const FLAG_PREFIX: &str = "INSERT_FLAG_";

/// Insertion points in `build_model.c`, in generation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Includes,
    Constants,
    BuildTests,
    BuildMainNet,
    BuildPhases,
    BuildPhaseItems,
}

impl Marker {
    pub const ALL: [Marker; 6] = [
        Marker::Includes,
        Marker::Constants,
        Marker::BuildTests,
        Marker::BuildMainNet,
        Marker::BuildPhases,
        Marker::BuildPhaseItems,
    ];

    /// Literal flag text as it appears in the template.
    pub fn flag(self) -> &'static str {
        match self {
            Self::Includes => "INSERT_FLAG_INCLUDES",
            Self::Constants => "INSERT_FLAG_CONSTANTS",
            Self::BuildTests => "INSERT_FLAG_BUILD_TESTS",
            Self::BuildMainNet => "INSERT_FLAG_BUILD_MAIN_NET",
            Self::BuildPhases => "INSERT_FLAG_BUILD_PHASES",
            Self::BuildPhaseItems => "INSERT_FLAG_BUILD_PHASE_ITEMS",
        }
    }

    fn from_flag(flag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.flag() == flag)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flag())
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Slot(Marker),
}

/// Parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

/// The `INSERT_FLAG_<NAME>` token on a line, if any.
fn find_flag(line: &str) -> Option<&str> {
    let start = line.find(FLAG_PREFIX)?;
    let rest = &line[start..];
    let len = FLAG_PREFIX.len()
        + rest[FLAG_PREFIX.len()..]
            .bytes()
            .take_while(|b| b.is_ascii_uppercase() || *b == b'_')
            .count();
    Some(&rest[..len])
}

impl Template {
    /// Parse template text. Fails if any marker is missing, repeated, or unknown.
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut seen = Vec::new();

        for line in source.replace('\r', "").split_inclusive('\n') {
            let Some(found) = find_flag(line) else {
                text.push_str(line);
                continue;
            };
            let marker = Marker::from_flag(found)
                .ok_or_else(|| format!("unknown template marker {}", found))?;
            if seen.contains(&marker) {
                return Err(format!("template marker {} appears more than once", marker));
            }
            seen.push(marker);
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Slot(marker));
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        if let Some(missing) = Marker::ALL.into_iter().find(|m| !seen.contains(m)) {
            return Err(format!("template is missing marker {}", missing));
        }
        Ok(Self { segments })
    }

    /// Fill every slot with `block(marker)`. Blocks are newline-terminated.
    pub fn render(&self, mut block: impl FnMut(Marker) -> String) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Slot(m) => {
                    out.push_str(&block(*m));
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
            }
        }
        out
    }
}

/// Prefix every line of `block` with one tab.
pub fn indent(block: &str) -> String {
    let mut out = String::with_capacity(block.len() + block.lines().count());
    for line in block.lines() {
        out.push('\t');
        out.push_str(line);
        out.push('\n');
    }
    out
}
