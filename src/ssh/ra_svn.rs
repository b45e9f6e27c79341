//! Minimal codec for the first message of Subversion's native `ra_svn`
//! protocol, as spoken over `svnserve -t` tunnels.
//!
//! Only the client greeting is understood:
//!
//! ```text
//! ( version ( capability ... ) url:string ra-client:string ( client:string? ) )
//! ```
//!
//! where numbers and bare words are space-terminated and strings are
//! length-prefixed as `N:bytes `. See
//! <https://svn.apache.org/repos/asf/subversion/trunk/subversion/libsvn_ra_svn/protocol>.

/// Error code svnserve uses for client-side failures.
const FAILURE_CODE: &str = "210005";

/// The fields of a client greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u64,
    pub capabilities: Vec<String>,
    pub url: String,
    pub ra_client: String,
    pub client: Option<String>,
}

impl Handshake {
    /// Parses a complete greeting frame as captured by [`read_frame`].
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(frame);

        cursor.expect(b'(')?;
        let version = cursor.number()?;
        cursor.expect(b'(')?;
        let mut capabilities = Vec::new();
        while !cursor.at(b')') {
            capabilities.push(cursor.word()?);
        }
        cursor.expect(b')')?;
        let url = cursor.string()?;
        let ra_client = cursor.string()?;
        cursor.expect(b'(')?;
        let client = if cursor.at(b')') {
            None
        } else {
            Some(cursor.string()?)
        };
        cursor.expect(b')')?;
        cursor.expect(b')')?;

        Some(Self {
            version,
            capabilities,
            url,
            ra_client,
            client,
        })
    }

    /// Re-encodes the greeting in wire form, suitable for forwarding to the
    /// spawned `svnserve` process.
    pub fn encode(&self) -> String {
        // An empty capability list encodes as `( )`, like the client field.
        let capabilities = match self.capabilities.is_empty() {
            true => String::new(),
            false => format!("{} ", self.capabilities.join(" ")),
        };
        let client = self.client.as_deref().map(svn_string).unwrap_or_default();
        format!(
            "( {} ( {}) {}{}( {}) ) ",
            self.version,
            capabilities,
            svn_string(&self.url),
            svn_string(&self.ra_client),
            client,
        )
    }
}

/// A length-prefixed protocol string, `N:bytes `. Empty input encodes to
/// nothing, matching how optional fields are omitted on the wire.
pub fn svn_string(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    format!("{}:{} ", s.len(), s)
}

/// One protocol-correct failure response, terminated like a printed line.
/// Written to the client exactly once when the handshake cannot proceed.
pub fn failure(message: &str) -> String {
    format!(
        "( failure ( ( {} {} 0: 0 ) ) )\n",
        FAILURE_CODE,
        svn_string(message)
    )
}

/// Assembles one top-level frame from a byte source: bytes are consumed
/// until the first space at parenthesis depth zero. Returns `None` when the
/// source runs dry (EOF or timeout) before the frame completes.
pub fn read_frame(mut next_byte: impl FnMut() -> Option<u8>) -> Option<Vec<u8>> {
    let mut frame = Vec::new();
    let mut depth = 0usize;
    loop {
        let byte = next_byte()?;
        frame.push(byte);
        match byte {
            b'(' => depth += 1,
            b')' => depth = depth.checked_sub(1)?,
            b' ' if depth == 0 => break,
            _ => {}
        }
    }
    Some(frame)
}

/// Byte cursor over a greeting frame. Every token consumes its trailing
/// space, matching the wire grammar.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at(&self, byte: u8) -> bool {
        self.peek() == Some(byte)
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn space(&mut self) -> Option<()> {
        (self.bump()? == b' ').then_some(())
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        if self.bump()? != byte {
            return None;
        }
        self.space()
    }

    fn number(&mut self) -> Option<u64> {
        let digits = self.take_while(|b| b.is_ascii_digit())?;
        self.space()?;
        digits.parse().ok()
    }

    fn word(&mut self) -> Option<String> {
        let word = self.take_while(|b| b != b' ')?;
        self.space()?;
        Some(word)
    }

    fn string(&mut self) -> Option<String> {
        let length = self.take_while(|b| b.is_ascii_digit())?;
        if self.bump()? != b':' {
            return None;
        }
        let length: usize = length.parse().ok()?;
        let end = self.pos.checked_add(length)?;
        let bytes = self.bytes.get(self.pos..end)?;
        self.pos = end;
        self.space()?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> Option<String> {
        let start = self.pos;
        while self.peek().map(&pred).unwrap_or(false) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        String::from_utf8(self.bytes[start..self.pos].to_vec()).ok()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    const GREETING: &str =
        "( 2 ( edit-pipeline svndiff1 absent-entries depth ) \
         26:svn+ssh://host/teams/alpha 38:SVN/1.9.7 (x86_64-pc-linux-gnu) ra_svn \
         ( ) ) ";

    #[test]
    fn test_parse_greeting() {
        let handshake = Handshake::parse(GREETING.as_bytes()).unwrap();
        assert_eq!(handshake.version, 2);
        assert_eq!(
            handshake.capabilities,
            vec!["edit-pipeline", "svndiff1", "absent-entries", "depth"]
        );
        assert_eq!(handshake.url, "svn+ssh://host/teams/alpha");
        assert_eq!(handshake.ra_client, "SVN/1.9.7 (x86_64-pc-linux-gnu) ra_svn");
        assert_eq!(handshake.client, None);
    }

    #[test]
    fn test_parse_greeting_with_client() {
        let frame = "( 2 ( edit-pipeline ) 21:svn+ssh://host/repo/x 8:SVN/1.14 ( 7:mybuild ) ) ";
        let handshake = Handshake::parse(frame.as_bytes()).unwrap();
        assert_eq!(handshake.client.as_deref(), Some("mybuild"));
    }

    #[test]
    fn test_encode_roundtrip() {
        for frame in [
            GREETING,
            "( 2 ( edit-pipeline ) 21:svn+ssh://host/repo/x 8:SVN/1.14 ( 7:mybuild ) ) ",
        ] {
            let handshake = Handshake::parse(frame.as_bytes()).unwrap();
            let encoded = handshake.encode();
            assert_eq!(Handshake::parse(encoded.as_bytes()).unwrap(), handshake);
        }
    }

    #[test]
    fn test_encode_roundtrip_empty_capabilities() {
        let handshake = Handshake {
            version: 2,
            capabilities: Vec::new(),
            url: "svn+ssh://host/repo/x".to_owned(),
            ra_client: "SVN/1.14".to_owned(),
            client: None,
        };
        let encoded = handshake.encode();
        assert_eq!(encoded, "( 2 ( ) 21:svn+ssh://host/repo/x 8:SVN/1.14 ( ) ) ");
        assert_eq!(Handshake::parse(encoded.as_bytes()).unwrap(), handshake);
    }

    #[test]
    fn test_parse_rejects_malformed_frames() {
        for frame in [
            "",
            "( ",
            "( x ( ) 4:url 2:ra ( ) ) ",
            "( 2 ( edit-pipeline ) 99:short 2:ra ( ) ) ",
            "( 2 ( edit-pipeline ) 4:url! ) ",
            "hello world ",
        ] {
            assert_eq!(Handshake::parse(frame.as_bytes()), None, "{frame:?}");
        }
    }

    #[test]
    fn test_read_frame_tracks_depth() {
        let mut bytes = GREETING.bytes().chain("( next-frame ) ".bytes());
        let frame = read_frame(|| bytes.next()).unwrap();
        assert_eq!(frame, GREETING.as_bytes());

        let frame = read_frame(|| bytes.next()).unwrap();
        assert_eq!(frame, b"( next-frame ) ");
    }

    #[test]
    fn test_read_frame_incomplete_input() {
        let mut bytes = "( 2 ( edit-".bytes();
        assert_eq!(read_frame(|| bytes.next()), None);
    }

    #[test]
    fn test_read_frame_unbalanced_close() {
        let mut bytes = ") ".bytes();
        assert_eq!(read_frame(|| bytes.next()), None);
    }

    #[test]
    fn test_failure_frame() {
        assert_eq!(
            failure("Exited by timeout"),
            "( failure ( ( 210005 17:Exited by timeout  0: 0 ) ) )\n"
        );
    }

    #[test]
    fn test_svn_string() {
        assert_eq!(svn_string("abc"), "3:abc ");
        assert_eq!(svn_string(""), "");
    }
}
