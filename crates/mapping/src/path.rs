//! Property paths into content trees.
//!
//! Syntax: dot separated keys, `[]` iterates a sequence and `["key"]` quotes a
//! key containing dots or slashes:
//! `spec.template.spec.containers[].envFrom[].configMapRef.name`,
//! `metadata.annotations["kubernetes.io/service-account.name"]`.
//! A plain key applied to a sequence iterates it implicitly.

use serde_json::Map;
use thiserror::Error;

use manifold_core::Content;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("malformed path {path:?} at offset {offset}")]
    Malformed { path: String, offset: usize },
    #[error("cannot read key {key:?} from a scalar")]
    NotAMapping { key: String },
    #[error("cannot iterate a non-sequence")]
    NotASequence,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Each,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    raw: String,
    segments: Vec<Segment>,
}

/// A value reached by a path, with the mapping that holds it (for sibling lookups).
#[derive(Debug, Clone, Copy)]
pub struct Located<'a> {
    pub value: &'a Content,
    pub parent: Option<&'a Map<String, Content>>,
}

impl Located<'_> {
    pub fn sibling(&self, key: &str) -> Option<&Content> { self.parent.and_then(|m| m.get(key)) }

    pub fn sibling_str(&self, key: &str) -> Option<&str> { self.sibling(key).and_then(|v| v.as_str()) }
}

impl PropertyPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let raw = raw.trim();
        if raw.is_empty() { return Err(PathError::Empty); }
        let malformed = |offset: usize| PathError::Malformed { path: raw.to_string(), offset };
        let chars: Vec<char> = raw.chars().collect();
        let mut segments = Vec::new();
        let mut cur = String::new();
        // true right after `]`, where a `.` may follow without a key
        let mut closed = false;
        let mut i = 0usize;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if cur.is_empty() {
                        if !closed { return Err(malformed(i)); }
                    } else {
                        segments.push(Segment::Key(std::mem::take(&mut cur)));
                    }
                    if i + 1 == chars.len() { return Err(malformed(i)); }
                    closed = false;
                }
                '[' => {
                    if !cur.is_empty() { segments.push(Segment::Key(std::mem::take(&mut cur))); }
                    match chars.get(i + 1) {
                        Some(']') => {
                            segments.push(Segment::Each);
                            i += 1;
                        }
                        Some('"') => {
                            let start = i + 2;
                            let end = (start..chars.len()).find(|&j| chars[j] == '"').ok_or_else(|| malformed(i))?;
                            if chars.get(end + 1) != Some(&']') || end == start { return Err(malformed(end)); }
                            segments.push(Segment::Key(chars[start..end].iter().collect()));
                            i = end + 1;
                        }
                        _ => return Err(malformed(i)),
                    }
                    closed = true;
                }
                ']' | '"' => return Err(malformed(i)),
                c => {
                    if closed { return Err(malformed(i)); }
                    cur.push(c);
                }
            }
            i += 1;
        }
        if !cur.is_empty() { segments.push(Segment::Key(cur)); }
        if segments.is_empty() { return Err(PathError::Empty); }
        Ok(Self { raw: raw.to_string(), segments })
    }

    pub fn as_str(&self) -> &str { &self.raw }
    pub fn segments(&self) -> &[Segment] { &self.segments }

    /// Every value the path reaches. Missing keys and nulls yield nothing;
    /// descending into a scalar is an error. A sequence reached by the last
    /// segment is expanded into its elements.
    pub fn read<'a>(&self, root: &'a Content) -> Result<Vec<Located<'a>>, PathError> {
        let mut frontier = vec![Located { value: root, parent: None }];
        for seg in self.segments.iter() {
            let mut next = Vec::new();
            for loc in frontier.into_iter() {
                step(seg, loc, &mut next)?;
            }
            if next.is_empty() { return Ok(next); }
            frontier = next;
        }
        let mut out = Vec::with_capacity(frontier.len());
        for loc in frontier.into_iter() {
            match loc.value {
                Content::Array(items) => out.extend(items.iter().filter(|v| !v.is_null()).map(|v| Located { value: v, parent: loc.parent })),
                Content::Null => {}
                _ => out.push(loc),
            }
        }
        Ok(out)
    }

    /// Read the first value as a string, used for target-side lookups.
    pub fn read_str<'a>(&self, root: &'a Content) -> Option<&'a str> {
        self.read(root).ok()?.into_iter().find_map(|l| l.value.as_str())
    }
}

impl std::fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.raw) }
}

fn step<'a>(seg: &Segment, loc: Located<'a>, out: &mut Vec<Located<'a>>) -> Result<(), PathError> {
    match (seg, loc.value) {
        (_, Content::Null) => Ok(()),
        (Segment::Key(k), Content::Object(map)) => {
            if let Some(v) = map.get(k) { out.push(Located { value: v, parent: Some(map) }); }
            Ok(())
        }
        (Segment::Key(_), Content::Array(items)) => {
            for item in items.iter() {
                step(seg, Located { value: item, parent: loc.parent }, out)?;
            }
            Ok(())
        }
        (Segment::Key(k), _) => Err(PathError::NotAMapping { key: k.clone() }),
        (Segment::Each, Content::Array(items)) => {
            out.extend(items.iter().map(|v| Located { value: v, parent: loc.parent }));
            Ok(())
        }
        (Segment::Each, _) => Err(PathError::NotASequence),
    }
}

/// Render a scalar for equality matching; mappings and sequences have no scalar form.
pub fn scalar_string(v: &Content) -> Option<String> {
    match v {
        Content::String(s) => Some(s.clone()),
        Content::Number(n) => Some(n.to_string()),
        Content::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
