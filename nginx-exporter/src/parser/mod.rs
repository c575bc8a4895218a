//! Declarative line layouts and the tokenizer that applies them.
//!
//! A [`LineLayout`] is an ordered list of [`Segment`]s separated by single spaces. Each field
//! segment names its delimiter (bare, quoted or bracketed) and the characters it may contain, so
//! a layout can be checked field by field instead of through one large pattern.

pub mod access_log;

pub use access_log::{
    AccessLogParser, DurationPolicy, LogRecord, ParseError, UPSTREAM_TIMING_LAYOUT,
};

/// How a field is framed inside the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    /// Runs up to the next space (or the end of the line for the last segment).
    Bare,
    /// Wrapped in `"`; closes at the earliest quote after which the rest of the line still fits.
    Quoted,
    /// Wrapped in `[` `]`; closes like [`Delimiter::Quoted`].
    Bracketed,
}

/// Characters a field value may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Any,
    NonEmpty,
    NoWhitespace,
    Digits,
}

impl Charset {
    pub fn accepts(self, value: &str) -> bool {
        match self {
            Charset::Any => true,
            Charset::NonEmpty => !value.is_empty(),
            Charset::NoWhitespace => {
                !value.is_empty() && !value.bytes().any(|b| b.is_ascii_whitespace())
            }
            Charset::Digits => !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub delimiter: Delimiter,
    pub charset: Charset,
}

impl FieldSpec {
    pub const fn bare(name: &'static str) -> Self {
        Self {
            name,
            delimiter: Delimiter::Bare,
            charset: Charset::NoWhitespace,
        }
    }

    pub const fn digits(name: &'static str) -> Self {
        Self {
            name,
            delimiter: Delimiter::Bare,
            charset: Charset::Digits,
        }
    }

    pub const fn quoted(name: &'static str, charset: Charset) -> Self {
        Self {
            name,
            delimiter: Delimiter::Quoted,
            charset,
        }
    }

    pub const fn bracketed(name: &'static str) -> Self {
        Self {
            name,
            delimiter: Delimiter::Bracketed,
            charset: Charset::NonEmpty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Field(FieldSpec),
    /// Fixed text that must appear verbatim and produces no value.
    Literal(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct LineLayout {
    segments: &'static [Segment],
}

impl LineLayout {
    pub const fn new(segments: &'static [Segment]) -> Self {
        Self { segments }
    }

    /// Field names in the order their values are returned by [`LineLayout::tokenize`].
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Field(field) => Some(field.name),
            Segment::Literal(_) => None,
        })
    }

    pub fn field_count(&self) -> usize {
        self.field_names().count()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.field_names().position(|candidate| candidate == name)
    }

    /// Splits `line` into one value per field, or `None` when the line does not fit the layout.
    ///
    /// Enclosed fields may contain their closing character followed by a space. When a later
    /// segment fails, the tokenizer backs up and retries the field with the next closing candidate.
    pub fn tokenize<'a>(&self, line: &'a str) -> Option<Vec<&'a str>> {
        let mut values = Vec::with_capacity(self.segments.len());
        match_segments(self.segments, line, &mut values).then_some(values)
    }
}

fn match_segments<'a>(segments: &[Segment], input: &'a str, values: &mut Vec<&'a str>) -> bool {
    let Some((segment, remaining)) = segments.split_first() else {
        return input.is_empty();
    };
    let last = remaining.is_empty();

    let continue_with = |rest: &'a str, values: &mut Vec<&'a str>| {
        if last {
            return rest.is_empty();
        }
        match rest.strip_prefix(' ') {
            Some(rest) => match_segments(remaining, rest, values),
            None => false,
        }
    };

    match segment {
        Segment::Literal(text) => match input.strip_prefix(text) {
            Some(rest) => continue_with(rest, values),
            None => false,
        },
        Segment::Field(field) => {
            for (value, rest) in Candidates::new(input, field.delimiter, last) {
                if !field.charset.accepts(value) {
                    continue;
                }
                values.push(value);
                if continue_with(rest, values) {
                    return true;
                }
                values.pop();
            }
            false
        }
    }
}

/// Possible `(value, rest)` splits for one field, shortest value first.
struct Candidates<'a> {
    input: &'a str,
    delimiter: Delimiter,
    last: bool,
    search_from: usize,
    done: bool,
}

impl<'a> Candidates<'a> {
    fn new(input: &'a str, delimiter: Delimiter, last: bool) -> Self {
        Self {
            input,
            delimiter,
            last,
            search_from: 0,
            done: false,
        }
    }

    fn next_enclosed(&mut self, open: char, close: char) -> Option<(&'a str, &'a str)> {
        let Some(body) = self.input.strip_prefix(open) else {
            self.done = true;
            return None;
        };
        while let Some(found) = body[self.search_from..].find(close) {
            let idx = self.search_from + found;
            self.search_from = idx + close.len_utf8();
            let after = &body[self.search_from..];
            let closes = if self.last {
                after.is_empty()
            } else {
                after.starts_with(' ')
            };
            if closes {
                return Some((&body[..idx], after));
            }
        }
        self.done = true;
        None
    }
}

impl<'a> Iterator for Candidates<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.delimiter {
            Delimiter::Bare => {
                self.done = true;
                if self.last {
                    return Some((self.input, ""));
                }
                let end = self.input.find(' ')?;
                Some((&self.input[..end], &self.input[end..]))
            }
            Delimiter::Quoted => self.next_enclosed('"', '"'),
            Delimiter::Bracketed => self.next_enclosed('[', ']'),
        }
    }
}

/// Creates a preview string from a line, truncating at `limit` characters with an ellipsis.
/// Used for logging skipped lines without overwhelming the logs.
pub(crate) fn line_preview(line: &str, limit: usize) -> String {
    let mut preview = String::new();
    for (idx, ch) in line.chars().enumerate() {
        if idx >= limit {
            preview.push_str("...");
            return preview;
        }
        preview.push(ch);
    }
    preview
}
