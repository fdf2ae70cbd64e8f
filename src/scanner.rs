//! Two-pass JSON token scanner.
//!
//! The scanner turns a buffered JSON document into a flat sequence of typed
//! [`Token`]s, each a byte span into the source. No tree is built and no
//! bytes are copied or decoded.
//!
//! ## Passes
//!
//! 1. [`count_tokens`] walks the input without storing anything and fails
//!    as soon as the caller's limit is exceeded. This bounds the memory a
//!    hostile or garbled response can make the device commit.
//! 2. [`scan`] repeats the walk into a token buffer capped at exactly the
//!    counted number of tokens. Any disagreement between the passes is
//!    reported as [`ParseError::ParseMismatch`].
//!
//! ## Token layout
//!
//! Tokens are stored in document order. An object is followed by its
//! key/value pairs (key token, then the value's subtree), an array by its
//! elements. [`Token::children`] holds the pair count for objects and the
//! element count for arrays.
//!
//! String spans exclude the quotes and escapes are left encoded; callers
//! compare keys by exact bytes. Primitives (numbers, `true`, `false`,
//! `null`) are kept as raw text and decoded on demand.
//!
//! ## Navigation
//!
//! [`Cursor`] walks a [`TokenSequence`] without manual index arithmetic:
//! [`Cursor::skip_value`] steps over a whole subtree and
//! [`Cursor::entries`] yields the key/value pairs of an object.
//!
//! ```
//! use fieldlink::scanner::{scan, TokenKind};
//!
//! let json = br#"{"i":900,"c":[1,2]}"#;
//! let tokens = scan::<16>(json).unwrap();
//! assert_eq!(tokens.len(), 7);
//!
//! let root = tokens.root();
//! let interval = root.get("i").unwrap();
//! assert_eq!(interval.bytes(), b"900");
//! assert_eq!(root.get("c").unwrap().kind(), TokenKind::Array);
//! ```

use core::ops::Range;

use heapless::Vec;

use crate::consts::MAX_NESTING;
use crate::error::ParseError;

/// Type of a scanned JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum TokenKind {
    /// `{ ... }`
    Object,
    /// `[ ... ]`
    Array,
    /// A quoted run, span excluding the quotes.
    String,
    /// A number or literal, span covering its raw text.
    Primitive,
}

/// A typed byte span into a scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Token {
    /// What kind of value the span holds.
    pub kind: TokenKind,
    /// Offset of the first byte.
    pub start: u16,
    /// Offset one past the last byte.
    pub end: u16,
    /// Key/value pairs of an object, elements of an array, otherwise 0.
    pub children: u16,
}

impl Token {
    /// The token's byte range in the source buffer.
    pub fn span(&self) -> Range<usize> {
        usize::from(self.start)..usize::from(self.end)
    }

    /// Length of the span in bytes.
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    /// Whether the span is empty (only possible for `""`).
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The bytes this token covers in `source`.
    ///
    /// Returns an empty slice if `source` is not the scanned buffer and the
    /// span falls outside it.
    pub fn bytes<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        source.get(self.span()).unwrap_or(&[])
    }

    /// Whether this is a string token spelling exactly `key`.
    pub fn is_key(&self, source: &[u8], key: &str) -> bool {
        self.kind == TokenKind::String && self.bytes(source) == key.as_bytes()
    }

    /// Number of tokens directly below this one in document order.
    fn descendants(&self) -> usize {
        match self.kind {
            TokenKind::Object => usize::from(self.children) * 2,
            TokenKind::Array => usize::from(self.children),
            TokenKind::String | TokenKind::Primitive => 0,
        }
    }
}

/// Receives tokens as the scanner discovers them.
trait TokenSink {
    /// Records a new token and returns its index.
    fn open(&mut self, token: Token) -> Result<usize, ParseError>;
    /// Sets the end offset of the container at `index`.
    fn close(&mut self, index: usize, end: u16);
    /// Counts one more child of the container at `index`.
    fn add_child(&mut self, index: usize);
    /// Number of tokens recorded so far.
    fn emitted(&self) -> usize;
}

/// Counting pass: no storage, fails past `limit`.
struct Counter {
    count: usize,
    limit: usize,
}

impl TokenSink for Counter {
    fn open(&mut self, _token: Token) -> Result<usize, ParseError> {
        if self.count >= self.limit {
            return Err(ParseError::TooManyTokens { limit: self.limit });
        }
        self.count += 1;
        Ok(self.count - 1)
    }

    fn close(&mut self, _index: usize, _end: u16) {}

    fn add_child(&mut self, _index: usize) {}

    fn emitted(&self) -> usize {
        self.count
    }
}

/// Fill pass: stores tokens, refuses to go past the counted total.
struct Filler<'t, const N: usize> {
    tokens: &'t mut Vec<Token, N>,
    expected: usize,
}

impl<const N: usize> TokenSink for Filler<'_, N> {
    fn open(&mut self, token: Token) -> Result<usize, ParseError> {
        let mismatch = ParseError::ParseMismatch {
            counted: self.expected,
            filled: self.tokens.len() + 1,
        };
        if self.tokens.len() >= self.expected {
            return Err(mismatch);
        }
        self.tokens.push(token).map_err(|_| mismatch)?;
        Ok(self.tokens.len() - 1)
    }

    fn close(&mut self, index: usize, end: u16) {
        if let Some(token) = self.tokens.get_mut(index) {
            token.end = end;
        }
    }

    fn add_child(&mut self, index: usize) {
        if let Some(token) = self.tokens.get_mut(index) {
            token.children = token.children.saturating_add(1);
        }
    }

    fn emitted(&self) -> usize {
        self.tokens.len()
    }
}

/// What an open container accepts next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// Right after `{`: a key or `}`.
    KeyOrClose,
    /// After `,` in an object.
    Key,
    /// After a key.
    Colon,
    /// After `:` or after `,` in an array.
    Value,
    /// Right after `[`: a value or `]`.
    ValueOrClose,
    /// After a complete value.
    CommaOrClose,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    index: usize,
    kind: TokenKind,
    expect: Expect,
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

fn is_delimiter(byte: u8) -> bool {
    is_whitespace(byte) || matches!(byte, b',' | b']' | b'}' | b':')
}

/// Validates the string starting at the opening quote `open` and returns the
/// offset of its closing quote.
fn string_end(source: &[u8], open: usize) -> Result<usize, ParseError> {
    let mut pos = open + 1;
    while let Some(&byte) = source.get(pos) {
        match byte {
            b'"' => return Ok(pos),
            b'\\' => {
                let escaped = *source.get(pos + 1).ok_or(ParseError::Incomplete)?;
                match escaped {
                    b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => pos += 2,
                    b'u' => {
                        for offset in pos + 2..pos + 6 {
                            let digit = *source.get(offset).ok_or(ParseError::Incomplete)?;
                            if !digit.is_ascii_hexdigit() {
                                return Err(ParseError::Invalid { offset });
                            }
                        }
                        pos += 6;
                    }
                    _ => return Err(ParseError::Invalid { offset: pos + 1 }),
                }
            }
            0x00..=0x1f => return Err(ParseError::Invalid { offset: pos }),
            _ => pos += 1,
        }
    }
    Err(ParseError::Incomplete)
}

/// Returns the offset one past the primitive starting at `start`.
fn primitive_end(source: &[u8], start: usize) -> Result<usize, ParseError> {
    if !matches!(source[start], b'-' | b'0'..=b'9' | b't' | b'f' | b'n') {
        return Err(ParseError::Invalid { offset: start });
    }
    let mut pos = start;
    while let Some(&byte) = source.get(pos) {
        if is_delimiter(byte) {
            break;
        }
        if byte < 0x20 || matches!(byte, b'"' | b'{' | b'[' | b'\\') {
            return Err(ParseError::Invalid { offset: pos });
        }
        pos += 1;
    }
    Ok(pos)
}

/// Marks the innermost container as having received a value in value
/// position, counting it as an array element where applicable.
fn begin_value<S: TokenSink>(
    frames: &mut Vec<Frame, MAX_NESTING>,
    sink: &mut S,
    offset: usize,
) -> Result<(), ParseError> {
    let frame = frames.last_mut().ok_or(ParseError::Invalid { offset })?;
    match frame.expect {
        Expect::Value | Expect::ValueOrClose => {
            if frame.kind == TokenKind::Array {
                sink.add_child(frame.index);
            }
            frame.expect = Expect::CommaOrClose;
            Ok(())
        }
        _ => Err(ParseError::Invalid { offset }),
    }
}

/// Walks `source` once, reporting every token to `sink`.
///
/// Returns the number of tokens emitted.
fn tokenize<S: TokenSink>(source: &[u8], sink: &mut S) -> Result<usize, ParseError> {
    let limit = usize::from(u16::MAX);
    if source.len() > limit {
        return Err(ParseError::InputTooLong { limit });
    }
    let first = source
        .iter()
        .position(|&b| !is_whitespace(b))
        .ok_or(ParseError::Incomplete)?;
    if source[first] != b'{' {
        return Err(ParseError::UnexpectedRoot);
    }

    let mut frames: Vec<Frame, MAX_NESTING> = Vec::new();
    let mut root_closed = false;
    let mut pos = first;

    while pos < source.len() {
        let byte = source[pos];
        if is_whitespace(byte) {
            pos += 1;
            continue;
        }
        if root_closed {
            return Err(ParseError::Invalid { offset: pos });
        }
        match byte {
            b'{' | b'[' => {
                let kind = if byte == b'{' {
                    TokenKind::Object
                } else {
                    TokenKind::Array
                };
                if !frames.is_empty() {
                    begin_value(&mut frames, sink, pos)?;
                }
                let index = sink.open(Token {
                    kind,
                    start: pos as u16,
                    end: pos as u16,
                    children: 0,
                })?;
                let expect = if kind == TokenKind::Object {
                    Expect::KeyOrClose
                } else {
                    Expect::ValueOrClose
                };
                frames
                    .push(Frame {
                        index,
                        kind,
                        expect,
                    })
                    .map_err(|_| ParseError::TooDeep { limit: MAX_NESTING })?;
                pos += 1;
            }
            b'}' | b']' => {
                let kind = if byte == b'}' {
                    TokenKind::Object
                } else {
                    TokenKind::Array
                };
                let frame = frames.pop().ok_or(ParseError::Invalid { offset: pos })?;
                let may_close = match frame.expect {
                    Expect::CommaOrClose => true,
                    Expect::KeyOrClose => kind == TokenKind::Object,
                    Expect::ValueOrClose => kind == TokenKind::Array,
                    Expect::Key | Expect::Colon | Expect::Value => false,
                };
                if frame.kind != kind || !may_close {
                    return Err(ParseError::Invalid { offset: pos });
                }
                pos += 1;
                sink.close(frame.index, pos as u16);
                root_closed = frames.is_empty();
            }
            b'"' => {
                let close = string_end(source, pos)?;
                let frame = frames.last_mut().ok_or(ParseError::Invalid { offset: pos })?;
                let is_key = matches!(frame.expect, Expect::Key | Expect::KeyOrClose);
                if is_key {
                    sink.add_child(frame.index);
                    frame.expect = Expect::Colon;
                } else {
                    begin_value(&mut frames, sink, pos)?;
                }
                let _ = sink.open(Token {
                    kind: TokenKind::String,
                    start: (pos + 1) as u16,
                    end: close as u16,
                    children: 0,
                })?;
                pos = close + 1;
            }
            b':' => {
                let frame = frames.last_mut().ok_or(ParseError::Invalid { offset: pos })?;
                if frame.expect != Expect::Colon {
                    return Err(ParseError::Invalid { offset: pos });
                }
                frame.expect = Expect::Value;
                pos += 1;
            }
            b',' => {
                let frame = frames.last_mut().ok_or(ParseError::Invalid { offset: pos })?;
                if frame.expect != Expect::CommaOrClose {
                    return Err(ParseError::Invalid { offset: pos });
                }
                frame.expect = if frame.kind == TokenKind::Object {
                    Expect::Key
                } else {
                    Expect::Value
                };
                pos += 1;
            }
            _ => {
                let end = primitive_end(source, pos)?;
                begin_value(&mut frames, sink, pos)?;
                let _ = sink.open(Token {
                    kind: TokenKind::Primitive,
                    start: pos as u16,
                    end: end as u16,
                    children: 0,
                })?;
                pos = end;
            }
        }
    }

    if !root_closed {
        return Err(ParseError::Incomplete);
    }
    Ok(sink.emitted())
}

/// Counts the tokens a full scan of `source` would produce.
///
/// # Errors
/// - [`ParseError::TooManyTokens`] as soon as more than `limit` tokens are seen
/// - any syntax error found on the way
pub fn count_tokens(source: &[u8], limit: usize) -> Result<usize, ParseError> {
    let mut counter = Counter { count: 0, limit };
    tokenize(source, &mut counter)
}

/// Scans `source` into a sequence of at most `N` tokens.
///
/// Runs the counting pass first, then fills a buffer capped at the counted
/// total.
///
/// # Errors
/// - [`ParseError::UnexpectedRoot`] if the top-level value is not an object
/// - [`ParseError::TooManyTokens`] if the document needs more than `N` tokens
/// - [`ParseError::ParseMismatch`] if the passes disagree
/// - [`ParseError::Invalid`], [`ParseError::Incomplete`], [`ParseError::TooDeep`]
///   or [`ParseError::InputTooLong`] for malformed input
pub fn scan<const N: usize>(source: &[u8]) -> Result<TokenSequence<'_, N>, ParseError> {
    let counted = count_tokens(source, N)?;
    let tokens = fill_tokens(source, counted)?;
    Ok(TokenSequence { source, tokens })
}

/// Fill pass: stores exactly `counted` tokens of `source`.
fn fill_tokens<const N: usize>(source: &[u8], counted: usize) -> Result<Vec<Token, N>, ParseError> {
    let mut tokens = Vec::new();
    let filled = tokenize(
        source,
        &mut Filler {
            tokens: &mut tokens,
            expected: counted,
        },
    )?;
    if filled != counted {
        return Err(ParseError::ParseMismatch { counted, filled });
    }
    Ok(tokens)
}

/// Tokens of one scanned buffer, in document order.
///
/// Borrows the buffer it was scanned from; tokens are views into it.
#[derive(Debug)]
pub struct TokenSequence<'a, const N: usize> {
    source: &'a [u8],
    tokens: Vec<Token, N>,
}

impl<'a, const N: usize> TokenSequence<'a, N> {
    /// The scanned buffer.
    pub fn source(&self) -> &'a [u8] {
        self.source
    }

    /// All tokens in document order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the sequence holds no tokens. Never true for a successful scan.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Cursor on the root object.
    pub fn root(&self) -> Cursor<'_, 'a, N> {
        Cursor {
            seq: self,
            index: 0,
        }
    }

    fn token(&self, index: usize) -> Option<Token> {
        self.tokens.get(index).copied()
    }
}

/// A position in a [`TokenSequence`].
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'s, 'a, const N: usize> {
    seq: &'s TokenSequence<'a, N>,
    index: usize,
}

impl<'s, 'a, const N: usize> Cursor<'s, 'a, N> {
    /// Index of the token under the cursor.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The token under the cursor.
    pub fn token(&self) -> Token {
        self.seq.tokens[self.index]
    }

    /// Kind of the token under the cursor.
    pub fn kind(&self) -> TokenKind {
        self.token().kind
    }

    /// Source bytes of the token under the cursor.
    pub fn bytes(&self) -> &'a [u8] {
        self.token().bytes(self.seq.source)
    }

    /// Whether the cursor is on a string spelling exactly `key`.
    pub fn is_key(&self, key: &str) -> bool {
        self.token().is_key(self.seq.source, key)
    }

    /// Index one past the subtree rooted at the cursor.
    pub fn skip_value(&self) -> usize {
        let mut pending = 1usize;
        let mut index = self.index;
        while pending > 0 {
            let Some(token) = self.seq.token(index) else {
                break;
            };
            pending = pending - 1 + token.descendants();
            index += 1;
        }
        index
    }

    /// Cursor on the first token after this subtree, if any.
    ///
    /// Inside an object this moves from a value to the next key, and from a
    /// key to its value.
    pub fn next_sibling(&self) -> Option<Self> {
        let index = self.skip_value();
        (index < self.seq.len()).then_some(Self {
            seq: self.seq,
            index,
        })
    }

    /// Key/value pairs of the object under the cursor.
    ///
    /// Yields nothing if the cursor is not on an object.
    pub fn entries(&self) -> Entries<'s, 'a, N> {
        let token = self.token();
        let remaining = if token.kind == TokenKind::Object {
            token.children
        } else {
            0
        };
        Entries {
            seq: self.seq,
            next: self.index + 1,
            remaining,
        }
    }

    /// Value of the first entry named `key` in the object under the cursor.
    pub fn get(&self, key: &str) -> Option<Self> {
        self.entries()
            .find(|(name, _)| name.is_key(key))
            .map(|(_, value)| value)
    }
}

/// Iterator over the key/value pairs of an object.
///
/// Bounded by the object's child count and stepping over each value's
/// subtree.
#[derive(Debug, Clone)]
pub struct Entries<'s, 'a, const N: usize> {
    seq: &'s TokenSequence<'a, N>,
    next: usize,
    remaining: u16,
}

impl<'s, 'a, const N: usize> Iterator for Entries<'s, 'a, N> {
    type Item = (Cursor<'s, 'a, N>, Cursor<'s, 'a, N>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.next + 1 >= self.seq.len() {
            return None;
        }
        let key = Cursor {
            seq: self.seq,
            index: self.next,
        };
        let value = Cursor {
            seq: self.seq,
            index: self.next + 1,
        };
        self.next = value.skip_value();
        self.remaining -= 1;
        Some((key, value))
    }
}
