//! Keystroke scripts fed into the master side

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Unknown escape sequence \\{0} at offset {1}")]
    UnknownEscape(char, usize),

    #[error("Malformed \\x escape at offset {0}: expected two hex digits")]
    MalformedHex(usize),

    #[error("Trailing backslash at end of script")]
    TrailingBackslash,
}

const DEMO: &[&[u8]] = &[
    b"hello world\r",
    "中文\r".as_bytes(),
    b"  printable characters (ASCII or not):\r",
    b"    1. are echoed by the line discipline before the program reads them\r",
    b"    2. are passed through to the program unchanged\r",
    b"    3. arrive with \\r translated to \\n\r",
    b"    4. are held in the line buffer until \\r is typed\r",
    b"line editing with backspace\x7f: hello world,\x7f!\r",
    b"  the \\x7f erased the comma, so the program reads hello world!\r",
    b"line editing with arrow keys: world\x1b[D\x1b[D\x1b[D\x1b[D\x1b[Dhello \r",
    b"  arrow keys do not move the line discipline's edit point\r",
    b"* sending ctrl+c next, the program should receive SIGINT (2)\r",
    b"\x03",
];

/// An immutable byte sequence injected one byte at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    bytes: Vec<u8>,
}

impl Script {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The built-in demonstration: plain and multi-byte lines, an erase edit, a
    /// cursor-movement edit, and a closing interrupt character.
    pub fn demo() -> Self {
        Self::from_bytes(DEMO.concat())
    }

    /// Parse a script written with backslash escapes.
    ///
    /// Supported: `\r \n \t \0 \\ \e` and `\xHH`. Everything else is taken as UTF-8.
    pub fn from_escaped(text: &str) -> Result<Self, ScriptError> {
        let mut bytes = Vec::with_capacity(text.len());
        let mut chars = text.char_indices();

        while let Some((offset, c)) = chars.next() {
            if c != '\\' {
                let mut utf8 = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                continue;
            }

            let (_, escape) = chars.next().ok_or(ScriptError::TrailingBackslash)?;
            match escape {
                'r' => bytes.push(b'\r'),
                'n' => bytes.push(b'\n'),
                't' => bytes.push(b'\t'),
                '0' => bytes.push(0),
                'e' => bytes.push(0x1b),
                '\\' => bytes.push(b'\\'),
                'x' => {
                    let mut value = 0u8;
                    for _ in 0..2 {
                        let digit = chars
                            .next()
                            .and_then(|(_, d)| d.to_digit(16))
                            .ok_or(ScriptError::MalformedHex(offset))?;
                        value = value * 16 + digit as u8;
                    }
                    bytes.push(value);
                }
                other => return Err(ScriptError::UnknownEscape(other, offset)),
            }
        }

        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::demo()
    }
}
