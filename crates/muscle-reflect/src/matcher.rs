// Compiled wildcard patterns over slash-separated node paths.
//
// Per-segment grammar: literals, `*` (any run), `?` (one char), bracketed
// character classes (`[abc]`, `[a-z]`, `[!x]`), and `<lo-hi>` numeric-range
// segments that match auto-generated names.  Matching always anchors at
// segment boundaries: a `*` never crosses a `/`.
use crate::error::{ReflectError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Literal(char),
    AnyRun,
    OneChar,
    Class { negated: bool, items: Vec<ClassItem> },
}

#[derive(Debug, Clone, PartialEq)]
enum ClassItem {
    Char(char),
    Range(char, char),
}

/// Matcher for one path segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentMatcher {
    /// Plain name; matched by direct lookup, never by iteration.
    Literal(String),
    Wild(Vec<Tok>),
    /// `<lo-hi>`: matches an optional `I` followed by digits in the range.
    NumericRange(u32, u32),
}

impl SegmentMatcher {
    pub fn parse(segment: &str) -> Result<Self> {
        if segment.is_empty() {
            return Err(ReflectError::BadArgument("empty path segment".into()));
        }
        if let Some(range) = parse_numeric_range(segment) {
            return Ok(SegmentMatcher::NumericRange(range.0, range.1));
        }
        if !has_wildcards(segment) {
            return Ok(SegmentMatcher::Literal(segment.to_owned()));
        }
        let mut toks = Vec::new();
        let mut chars = segment.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    // Collapse runs of stars; they match the same strings.
                    if toks.last() != Some(&Tok::AnyRun) {
                        toks.push(Tok::AnyRun);
                    }
                }
                '?' => toks.push(Tok::OneChar),
                '[' => {
                    let negated = chars.peek() == Some(&'!') || chars.peek() == Some(&'^');
                    if negated {
                        chars.next();
                    }
                    let mut items = Vec::new();
                    loop {
                        let c = chars.next().ok_or_else(|| {
                            ReflectError::BadArgument(format!(
                                "unterminated character class in {segment}"
                            ))
                        })?;
                        if c == ']' && !items.is_empty() {
                            break;
                        }
                        if chars.peek() == Some(&'-') {
                            chars.next();
                            match chars.next() {
                                Some(']') | None => {
                                    return Err(ReflectError::BadArgument(format!(
                                        "dangling range in character class in {segment}"
                                    )))
                                }
                                Some(end) => items.push(ClassItem::Range(c, end)),
                            }
                        } else {
                            items.push(ClassItem::Char(c));
                        }
                    }
                    toks.push(Tok::Class { negated, items });
                }
                other => toks.push(Tok::Literal(other)),
            }
        }
        Ok(SegmentMatcher::Wild(toks))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, SegmentMatcher::Literal(_))
    }

    pub fn literal(&self) -> Option<&str> {
        match self {
            SegmentMatcher::Literal(name) => Some(name),
            _ => None,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            SegmentMatcher::Literal(lit) => lit == name,
            SegmentMatcher::Wild(toks) => {
                let chars: Vec<char> = name.chars().collect();
                match_tokens(toks, &chars)
            }
            SegmentMatcher::NumericRange(lo, hi) => {
                let digits = name.strip_prefix('I').unwrap_or(name);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return false;
                }
                match digits.parse::<u32>() {
                    Ok(value) => value >= *lo && value <= *hi,
                    Err(_) => false,
                }
            }
        }
    }
}

/// True when the segment contains metacharacters, meaning child maps must be
/// iterated instead of looked up directly.
pub fn has_wildcards(segment: &str) -> bool {
    segment
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | '<'))
        || parse_numeric_range(segment).is_some()
}

fn parse_numeric_range(segment: &str) -> Option<(u32, u32)> {
    let inner = segment.strip_prefix('<')?.strip_suffix('>')?;
    let (lo, hi) = inner.split_once('-')?;
    let lo = lo.parse::<u32>().ok()?;
    let hi = hi.parse::<u32>().ok()?;
    (lo <= hi).then_some((lo, hi))
}

fn match_tokens(toks: &[Tok], chars: &[char]) -> bool {
    match toks.first() {
        None => chars.is_empty(),
        Some(Tok::AnyRun) => {
            (0..=chars.len()).any(|skip| match_tokens(&toks[1..], &chars[skip..]))
        }
        Some(Tok::OneChar) => !chars.is_empty() && match_tokens(&toks[1..], &chars[1..]),
        Some(Tok::Literal(expect)) => {
            chars.first() == Some(expect) && match_tokens(&toks[1..], &chars[1..])
        }
        Some(Tok::Class { negated, items }) => match chars.first() {
            None => false,
            Some(c) => {
                let hit = items.iter().any(|item| match item {
                    ClassItem::Char(x) => x == c,
                    ClassItem::Range(a, b) => *a <= *c && *c <= *b,
                });
                hit != *negated && match_tokens(&toks[1..], &chars[1..])
            }
        },
    }
}

/// A compiled multi-segment pattern.  Patterns match nodes at exactly their
/// own depth; there is no implicit recursion below the last segment.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMatcher {
    segments: Vec<SegmentMatcher>,
}

impl PathMatcher {
    /// Compiles an absolute slash-separated pattern.  `.` and `..` are
    /// ordinary literal names.
    pub fn parse(pattern: &str) -> Result<Self> {
        let trimmed = pattern.strip_prefix('/').ok_or_else(|| {
            ReflectError::BadArgument(format!("pattern must be absolute: {pattern}"))
        })?;
        if trimmed.is_empty() {
            return Err(ReflectError::BadArgument("pattern names no segments".into()));
        }
        let segments = trimmed
            .split('/')
            .map(SegmentMatcher::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[SegmentMatcher] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Matches a full absolute path; depth must equal the pattern's.
    pub fn matches_path(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != self.segments.len() {
            return false;
        }
        parts
            .iter()
            .zip(&self.segments)
            .all(|(part, seg)| seg.matches(part))
    }

    /// True when the pattern could match nodes under the given ancestor
    /// path, i.e. its leading segments match the ancestor's segments.
    pub fn matches_prefix(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() > self.segments.len() {
            return false;
        }
        parts
            .iter()
            .zip(&self.segments)
            .all(|(part, seg)| seg.matches(part))
    }
}
