//! Push-style RSS parser.
//!
//! Bytes arrive in arbitrary chunks via [`FeedParser::feed`]. A small lexer
//! splits the pending bytes into complete markup tokens (tags, text, CDATA,
//! comments, processing instructions, DOCTYPE); only the trailing incomplete
//! token is kept between calls. Each complete token is decoded by `quick-xml`
//! and applied to an element stack that checks well-formedness and collects
//! `rss/channel/item` entries as they close.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// SEC-003: Maximum element nesting depth.
/// Prevents unbounded stack growth from maliciously deep documents.
const MAX_DEPTH: usize = 64;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Element path (from the root) of one feed entry.
const ITEM_PATH: [&str; 3] = ["rss", "channel", "item"];

/// Errors produced while parsing a feed document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The document is not well-formed.
    #[error("malformed document at byte {offset}: {reason}")]
    Malformed { offset: u64, reason: String },
    /// Entries were requested before `finish()` succeeded.
    #[error("feed document was not finished")]
    NotFinished,
}

/// One `<item>` of the feed, before validation.
///
/// Every field is optional here; a missing child element is not a parse
/// error. Values are trimmed text content with entities resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Description,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "title" => Some(Field::Title),
            "link" => Some(Field::Link),
            "description" => Some(Field::Description),
            _ => None,
        }
    }
}

impl FeedEntry {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Description => &mut self.description,
        }
    }
}

/// Outcome of scanning the pending bytes for one token.
enum Scan {
    /// A complete token of this many bytes starts at the scan origin.
    Complete(usize),
    /// Not enough bytes yet; scanning may resume at this offset.
    Incomplete(usize),
}

/// Splits a byte stream into complete markup tokens.
#[derive(Debug, Default)]
struct Lexer {
    buf: Vec<u8>,
    /// Start of the first unconsumed token in `buf`
    start: usize,
    /// Offset (relative to `start`) already searched for the token's end
    resume: usize,
}

impl Lexer {
    fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    fn next_token(&mut self) -> Option<&[u8]> {
        let pending = &self.buf[self.start..];
        match scan_token(pending, self.resume) {
            Scan::Complete(len) => {
                let begin = self.start;
                self.start += len;
                self.resume = 0;
                Some(&self.buf[begin..begin + len])
            }
            Scan::Incomplete(resume) => {
                self.resume = resume;
                None
            }
        }
    }

    fn remainder(&self) -> &[u8] {
        &self.buf[self.start..]
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Find the end of the token at the start of `bytes`.
fn scan_token(bytes: &[u8], resume: usize) -> Scan {
    const COMMENT: &[u8] = b"<!--";
    const CDATA: &[u8] = b"<![CDATA[";

    if bytes.is_empty() {
        return Scan::Incomplete(0);
    }

    if bytes[0] != b'<' {
        return match bytes[resume..].iter().position(|&b| b == b'<') {
            Some(i) => Scan::Complete(resume + i),
            None => Scan::Incomplete(bytes.len()),
        };
    }

    if bytes.len() < 2 {
        return Scan::Incomplete(0);
    }

    let delimited = |open: &[u8], close: &[u8]| {
        let from = resume.saturating_sub(close.len() - 1).max(open.len());
        match find(bytes, close, from) {
            Some(i) => Scan::Complete(i + close.len()),
            None => Scan::Incomplete(bytes.len()),
        }
    };

    match bytes[1] {
        b'?' => delimited(b"<?", b"?>"),
        b'!' => {
            if bytes.len() < COMMENT.len() && COMMENT.starts_with(bytes) {
                return Scan::Incomplete(0);
            }
            if bytes.starts_with(COMMENT) {
                return delimited(COMMENT, b"-->");
            }
            if bytes.len() < CDATA.len() && CDATA.starts_with(bytes) {
                return Scan::Incomplete(0);
            }
            if bytes.starts_with(CDATA) {
                return delimited(CDATA, b"]]>");
            }
            // DOCTYPE: may carry an internal subset in brackets
            let mut quote = None;
            let mut brackets = 0usize;
            for (i, &b) in bytes.iter().enumerate().skip(2) {
                match (quote, b) {
                    (Some(q), _) if b == q => quote = None,
                    (Some(_), _) => {}
                    (None, b'"' | b'\'') => quote = Some(b),
                    (None, b'[') => brackets += 1,
                    (None, b']') => brackets = brackets.saturating_sub(1),
                    (None, b'>') if brackets == 0 => return Scan::Complete(i + 1),
                    _ => {}
                }
            }
            Scan::Incomplete(0)
        }
        _ => {
            // Start, end, or empty-element tag; '>' may appear in quoted attributes
            let mut quote = None;
            for (i, &b) in bytes.iter().enumerate().skip(1) {
                match (quote, b) {
                    (Some(q), _) if b == q => quote = None,
                    (Some(_), _) => {}
                    (None, b'"' | b'\'') => quote = Some(b),
                    (None, b'>') => return Scan::Complete(i + 1),
                    _ => {}
                }
            }
            Scan::Incomplete(0)
        }
    }
}

#[derive(Debug)]
enum State {
    Open,
    Finished,
    Failed(ParseError),
}

/// Incremental parser for one RSS document.
///
/// ```
/// use loanwatch::feed::FeedParser;
///
/// let mut parser = FeedParser::new();
/// parser.feed(b"<rss><channel><item><title>Fa").unwrap();
/// parser.feed(b"ust</title></item></channel></rss>").unwrap();
/// parser.finish().unwrap();
///
/// let entries: Vec<_> = parser.entries().unwrap().collect();
/// assert_eq!(entries[0].title.as_deref(), Some("Faust"));
/// ```
#[derive(Debug)]
pub struct FeedParser {
    lexer: Lexer,
    state: State,
    /// Names of the currently open elements, outermost first
    stack: Vec<String>,
    root_seen: bool,
    /// Bytes of input consumed by completed tokens
    consumed: u64,
    /// Only offset where an XML declaration may start (past a BOM)
    decl_offset: u64,
    current: Option<FeedEntry>,
    /// Field being captured and its text so far
    capture: Option<(Field, String)>,
    entries: Vec<FeedEntry>,
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedParser {
    pub fn new() -> Self {
        Self {
            lexer: Lexer::default(),
            state: State::Open,
            stack: Vec::new(),
            root_seen: false,
            consumed: 0,
            decl_offset: 0,
            current: None,
            capture: None,
            entries: Vec::new(),
        }
    }

    /// Incorporate the next chunk of the document.
    ///
    /// Every complete token in the pending input is processed right away; an
    /// incomplete trailing token waits for the next chunk. Once an error has
    /// been returned the parser stays failed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
        self.ensure_open()?;
        self.lexer.push(chunk);

        let result = self.drain_tokens();
        self.fail_on_error(result)
    }

    /// Signal end of input and check the document is complete.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        self.ensure_open()?;

        let result = self.drain_tokens().and_then(|()| self.finish_document());
        self.fail_on_error(result)?;
        self.state = State::Finished;
        Ok(())
    }

    /// The entries of a successfully finished document, in document order.
    ///
    /// Consumes the parser, so the sequence can be walked only once.
    pub fn entries(self) -> Result<Entries, ParseError> {
        match self.state {
            State::Finished => Ok(Entries {
                inner: self.entries.into_iter(),
            }),
            State::Failed(err) => Err(err),
            State::Open => Err(ParseError::NotFinished),
        }
    }

    fn ensure_open(&self) -> Result<(), ParseError> {
        match &self.state {
            State::Open => Ok(()),
            State::Failed(err) => Err(err.clone()),
            State::Finished => Err(self.malformed("input after end of document")),
        }
    }

    fn fail_on_error(&mut self, result: Result<(), ParseError>) -> Result<(), ParseError> {
        if let Err(err) = &result {
            tracing::debug!(error = %err, "Feed parser failed");
            self.state = State::Failed(err.clone());
        }
        result
    }

    fn malformed(&self, reason: impl Into<String>) -> ParseError {
        ParseError::Malformed {
            offset: self.consumed,
            reason: reason.into(),
        }
    }

    fn drain_tokens(&mut self) -> Result<(), ParseError> {
        // The token borrows the lexer buffer, so take the lexer out while
        // the token is applied to the rest of the parser state.
        let mut lexer = std::mem::take(&mut self.lexer);
        let result = loop {
            let Some(token) = lexer.next_token() else {
                break Ok(());
            };
            if let Err(err) = self.apply_token(token) {
                break Err(err);
            }
            self.consumed += token.len() as u64;
        };
        self.lexer = lexer;
        result
    }

    fn finish_document(&mut self) -> Result<(), ParseError> {
        let rest = self.lexer.remainder();
        if !rest.is_empty() {
            if rest[0] == b'<' {
                return Err(self.malformed("unterminated markup at end of input"));
            }
            // Trailing text has no closing '<' to end it
            let rest = rest.to_vec();
            self.apply_token(&rest)?;
            self.consumed += rest.len() as u64;
        }

        if let Some(open) = self.stack.last() {
            return Err(self.malformed(format!("unclosed element <{}>", open)));
        }
        if !self.root_seen {
            return Err(self.malformed("document has no root element"));
        }
        Ok(())
    }

    fn apply_token(&mut self, token: &[u8]) -> Result<(), ParseError> {
        if token[0] != b'<' {
            return self.apply_text(token);
        }

        let mut reader = Reader::from_reader(token);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;

        let event = reader
            .read_event()
            .map_err(|e| self.malformed(format!("invalid markup: {}", e)))?;

        match event {
            Event::Start(e) => {
                let name = element_name(e.name().as_ref()).map_err(|r| self.malformed(r))?;
                check_attributes(&e).map_err(|r| self.malformed(r))?;
                self.open_element(name)
            }
            Event::Empty(e) => {
                let name = element_name(e.name().as_ref()).map_err(|r| self.malformed(r))?;
                check_attributes(&e).map_err(|r| self.malformed(r))?;
                self.open_element(name.clone())?;
                self.close_element(&name)
            }
            Event::End(e) => {
                let name = element_name(e.name().as_ref()).map_err(|r| self.malformed(r))?;
                self.close_element(&name)
            }
            Event::CData(cdata) => {
                if self.stack.is_empty() {
                    return Err(self.malformed("CDATA outside the root element"));
                }
                let text = std::str::from_utf8(&cdata)
                    .map_err(|_| self.malformed("CDATA is not valid UTF-8"))?;
                self.append_text(text);
                Ok(())
            }
            Event::Decl(_) => {
                if self.consumed != self.decl_offset {
                    return Err(self.malformed("XML declaration must start the document"));
                }
                Ok(())
            }
            Event::DocType(_) => {
                if self.root_seen {
                    return Err(self.malformed("DOCTYPE after the root element"));
                }
                Ok(())
            }
            Event::Comment(_) | Event::PI(_) => Ok(()),
            Event::Text(_) | Event::Eof => Err(self.malformed("unexpected markup")),
        }
    }

    fn apply_text(&mut self, token: &[u8]) -> Result<(), ParseError> {
        let token = match (self.consumed, token.strip_prefix(UTF8_BOM)) {
            (0, Some(rest)) => {
                if rest.is_empty() {
                    self.decl_offset = UTF8_BOM.len() as u64;
                }
                rest
            }
            _ => token,
        };
        if self.stack.is_empty() {
            if token.iter().all(u8::is_ascii_whitespace) {
                return Ok(());
            }
            return Err(self.malformed("text outside the root element"));
        }

        std::str::from_utf8(token).map_err(|_| self.malformed("text is not valid UTF-8"))?;

        let mut reader = Reader::from_reader(token);
        let text = match reader.read_event() {
            Ok(Event::Text(t)) => t
                .unescape()
                .map_err(|e| self.malformed(format!("invalid text: {}", e)))?
                .into_owned(),
            Ok(_) => return Err(self.malformed("unexpected text token")),
            Err(e) => return Err(self.malformed(format!("invalid text: {}", e))),
        };
        self.append_text(&text);
        Ok(())
    }

    fn append_text(&mut self, text: &str) {
        if let Some((_, buf)) = &mut self.capture {
            buf.push_str(text);
        }
    }

    fn open_element(&mut self, name: String) -> Result<(), ParseError> {
        if self.stack.is_empty() {
            if self.root_seen {
                return Err(self.malformed(format!("second root element <{}>", name)));
            }
            self.root_seen = true;
        }
        if self.stack.len() >= MAX_DEPTH {
            return Err(self.malformed(format!(
                "nesting depth exceeds maximum of {} levels",
                MAX_DEPTH
            )));
        }

        self.stack.push(name);

        let in_item = self.stack.len() == ITEM_PATH.len()
            && self.stack.iter().map(String::as_str).eq(ITEM_PATH);
        if in_item {
            self.current = Some(FeedEntry::default());
        } else if self.stack.len() == ITEM_PATH.len() + 1 && self.capture.is_none() {
            let field = self.stack.last().and_then(|n| Field::from_name(n));
            if let (Some(entry), Some(field)) = (self.current.as_mut(), field) {
                if entry.slot(field).is_none() {
                    self.capture = Some((field, String::new()));
                }
            }
        }
        Ok(())
    }

    fn close_element(&mut self, name: &str) -> Result<(), ParseError> {
        match self.stack.last() {
            Some(open) if open == name => {}
            Some(open) => {
                return Err(self.malformed(format!(
                    "end tag </{}> does not match <{}>",
                    name, open
                )))
            }
            None => return Err(self.malformed(format!("end tag </{}> without start", name))),
        }

        if self.stack.len() == ITEM_PATH.len() + 1 {
            if let (Some((field, text)), Some(entry)) = (self.capture.take(), &mut self.current) {
                *entry.slot(field) = Some(text.trim().to_string());
            }
        } else if self.stack.len() == ITEM_PATH.len() {
            if let Some(entry) = self.current.take() {
                self.entries.push(entry);
            }
        }

        self.stack.pop();
        Ok(())
    }
}

fn element_name(raw: &[u8]) -> Result<String, String> {
    let name = std::str::from_utf8(raw).map_err(|_| "element name is not valid UTF-8".to_string())?;
    if name.is_empty() {
        return Err("empty element name".to_string());
    }
    Ok(name.to_string())
}

fn check_attributes(e: &quick_xml::events::BytesStart<'_>) -> Result<(), String> {
    for attr in e.attributes() {
        attr.map_err(|err| format!("malformed attribute: {}", err))?;
    }
    Ok(())
}

/// Entries of a finished feed document.
#[derive(Debug)]
pub struct Entries {
    inner: std::vec::IntoIter<FeedEntry>,
}

impl Iterator for Entries {
    type Item = FeedEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Entries {}
