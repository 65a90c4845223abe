//! A small MIME tree for outgoing messages.
//!
//! Only what the builder needs: leaf parts with explicit transfer
//! encodings, nested multiparts with fixed boundaries, and deterministic
//! rendering. Boundaries are chosen at construction time so a part renders
//! to identical bytes every time; signatures are computed over one
//! rendering and shipped alongside another.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Content transfer encoding of a leaf part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    SevenBit,
    QuotedPrintable,
    Base64,
}

impl Encoding {
    fn header_value(self) -> &'static str {
        match self {
            Encoding::SevenBit => "7bit",
            Encoding::QuotedPrintable => "quoted-printable",
            Encoding::Base64 => "base64",
        }
    }
}

#[derive(Debug, Clone)]
enum Body {
    Leaf(Vec<u8>),
    Multipart(Vec<MimePart>),
}

/// One node of the message tree.
#[derive(Debug, Clone)]
pub struct MimePart {
    content_type: String,
    /// Extra Content-Type parameters, rendered in order.
    params: Vec<(String, String)>,
    /// Additional part headers (disposition, description).
    headers: Vec<(String, String)>,
    encoding: Encoding,
    body: Body,
    preamble: Option<String>,
    boundary: Option<String>,
}

impl MimePart {
    /// A `text/plain` part, quoted-printable when the content needs it.
    pub fn text_plain(content: &str) -> Self {
        Self::text("text/plain", content)
    }

    /// A `text/html` alternative part.
    pub fn text_html(content: &str) -> Self {
        Self::text("text/html", content)
    }

    fn text(content_type: &str, content: &str) -> Self {
        let encoding = if needs_transfer_encoding(content) || !content.is_ascii() {
            Encoding::QuotedPrintable
        } else {
            Encoding::SevenBit
        };
        MimePart {
            content_type: content_type.to_string(),
            params: vec![("charset".to_string(), "utf-8".to_string())],
            headers: Vec::new(),
            encoding,
            body: Body::Leaf(content.as_bytes().to_vec()),
            preamble: None,
            boundary: None,
        }
    }

    /// An attachment part. Text types are quoted-printable explicitly,
    /// since strict signature verifiers reject implicitly encoded text;
    /// everything else travels base64.
    pub fn attachment(filename: &str, content_type: &str, data: &[u8]) -> Self {
        let encoding = if content_type.starts_with("text/") {
            Encoding::QuotedPrintable
        } else {
            Encoding::Base64
        };
        MimePart {
            content_type: content_type.to_string(),
            params: vec![("name".to_string(), filename.to_string())],
            headers: vec![(
                "Content-Disposition".to_string(),
                format!("attachment; filename=\"{}\"", filename),
            )],
            encoding,
            body: Body::Leaf(data.to_vec()),
            preamble: None,
            boundary: None,
        }
    }

    /// An arbitrary leaf part with full header control.
    pub fn leaf(
        content_type: &str,
        params: Vec<(String, String)>,
        headers: Vec<(String, String)>,
        encoding: Encoding,
        data: Vec<u8>,
    ) -> Self {
        MimePart {
            content_type: content_type.to_string(),
            params,
            headers,
            encoding,
            body: Body::Leaf(data),
            preamble: None,
            boundary: None,
        }
    }

    /// A multipart container with a freshly chosen boundary.
    pub fn multipart(subtype: &str, params: Vec<(String, String)>, children: Vec<MimePart>) -> Self {
        MimePart {
            content_type: format!("multipart/{}", subtype),
            params,
            headers: Vec::new(),
            encoding: Encoding::SevenBit,
            body: Body::Multipart(children),
            preamble: None,
            boundary: Some(make_boundary()),
        }
    }

    /// Attach a human-readable preamble shown before the first boundary.
    pub fn with_preamble(mut self, preamble: &str) -> Self {
        self.preamble = Some(preamble.to_string());
        self
    }

    /// The part's content type, e.g. `multipart/encrypted`.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Children of a multipart, empty for leaves.
    pub fn children(&self) -> &[MimePart] {
        match &self.body {
            Body::Multipart(children) => children,
            Body::Leaf(_) => &[],
        }
    }

    /// Render the part (headers and body) to wire format with CRLF line
    /// endings. Rendering is deterministic for a given part.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        out.push_str(&format!("Content-Type: {}", self.content_type));
        for (name, value) in &self.params {
            out.push_str(&format!("; {}=\"{}\"", name, value));
        }
        if let Some(boundary) = &self.boundary {
            out.push_str(&format!("; boundary=\"{}\"", boundary));
        }
        out.push_str("\r\n");

        match &self.body {
            Body::Leaf(data) => {
                out.push_str(&format!(
                    "Content-Transfer-Encoding: {}\r\n",
                    self.encoding.header_value()
                ));
                for (name, value) in &self.headers {
                    out.push_str(&format!("{}: {}\r\n", name, value));
                }
                out.push_str("\r\n");
                match self.encoding {
                    Encoding::SevenBit => {
                        out.push_str(&normalize_crlf(&String::from_utf8_lossy(data)))
                    }
                    Encoding::QuotedPrintable => out.push_str(&quoted_printable(data)),
                    Encoding::Base64 => out.push_str(&base64_wrapped(data)),
                }
                out.push_str("\r\n");
            }
            Body::Multipart(children) => {
                for (name, value) in &self.headers {
                    out.push_str(&format!("{}: {}\r\n", name, value));
                }
                out.push_str("\r\n");
                let boundary = self.boundary.as_deref().unwrap_or_default();
                if let Some(preamble) = &self.preamble {
                    out.push_str(preamble);
                    out.push_str("\r\n");
                }
                for child in children {
                    out.push_str(&format!("--{}\r\n", boundary));
                    child.render_into(out);
                }
                out.push_str(&format!("--{}--\r\n", boundary));
            }
        }
    }
}

/// Render a complete message: envelope headers, then the root part.
pub fn render_message(headers: &[(String, String)], root: &MimePart) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("MIME-Version: 1.0\r\n");
    root.render_into(&mut out);
    out
}

/// Whether body text must be protected by a transfer encoding before
/// signing: lines over 76 bytes, trailing whitespace, or mbox-style
/// `From ` openings all get mangled in transit.
pub fn needs_transfer_encoding(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.strip_suffix('\r').unwrap_or(line);
        line.len() > 76
            || line.ends_with(' ')
            || line.ends_with('\t')
            || line.starts_with("From ")
    })
}

/// Normalize line endings to CRLF. OpenPGP signatures are computed over
/// canonical CRLF text.
pub fn normalize_crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Quoted-printable per RFC 2045: bytes outside the printable range and
/// stray `=` are escaped, trailing whitespace is escaped, lines are soft
/// wrapped at 76 characters. Line breaks in the input become hard CRLF.
pub fn quoted_printable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 8);
    let mut col = 0usize;
    let mut i = 0usize;
    while i < data.len() {
        let b = data[i];
        if b == b'\r' && data.get(i + 1) == Some(&b'\n') {
            out.push_str("\r\n");
            col = 0;
            i += 2;
            continue;
        }
        if b == b'\n' {
            out.push_str("\r\n");
            col = 0;
            i += 1;
            continue;
        }

        let printable = (33..=126).contains(&b) && b != b'=';
        let whitespace = b == b' ' || b == b'\t';
        let ends_line = match data.get(i + 1) {
            None => true,
            Some(&b'\n') => true,
            Some(&b'\r') => data.get(i + 2) == Some(&b'\n'),
            _ => false,
        };
        let escape = !(printable || whitespace) || (whitespace && ends_line);

        let width = if escape { 3 } else { 1 };
        if col + width > 75 {
            out.push_str("=\r\n");
            col = 0;
        }
        if escape {
            out.push_str(&format!("={:02X}", b));
        } else {
            out.push(b as char);
        }
        col += width;
        i += 1;
    }
    out
}

/// Base64 with 76-column wrapping.
pub fn base64_wrapped(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(76)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\r\n")
}

fn make_boundary() -> String {
    format!("==============={:016x}==", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_escapes_equals_and_nonprintable() {
        assert_eq!(quoted_printable(b"a=b"), "a=3Db");
        assert_eq!(quoted_printable(b"caf\xc3\xa9"), "caf=C3=A9");
    }

    #[test]
    fn qp_escapes_trailing_whitespace_only() {
        assert_eq!(quoted_printable(b"word \nnext"), "word=20\r\nnext");
        assert_eq!(quoted_printable(b"mid space"), "mid space");
    }

    #[test]
    fn qp_wraps_long_lines_with_soft_breaks() {
        let long = vec![b'x'; 200];
        let encoded = quoted_printable(&long);
        for line in encoded.split("\r\n") {
            assert!(line.len() <= 76, "line too long: {}", line.len());
        }
        let rejoined: String = encoded.replace("=\r\n", "");
        assert_eq!(rejoined, "x".repeat(200));
    }

    #[test]
    fn needs_encoding_triggers() {
        assert!(needs_transfer_encoding(&"y".repeat(80)));
        assert!(needs_transfer_encoding("line with trailing space \nok"));
        assert!(needs_transfer_encoding("From the top"));
        assert!(!needs_transfer_encoding("an ordinary body\nwith two lines"));
    }

    #[test]
    fn normalize_crlf_is_idempotent() {
        assert_eq!(normalize_crlf("a\nb\r\nc"), "a\r\nb\r\nc");
        assert_eq!(normalize_crlf("a\r\nb"), "a\r\nb");
    }

    #[test]
    fn render_is_deterministic() {
        let part = MimePart::multipart(
            "mixed",
            vec![],
            vec![MimePart::text_plain("hello"), MimePart::text_plain("world")],
        );
        assert_eq!(part.render(), part.render());
    }

    #[test]
    fn multipart_renders_nested_boundaries() {
        let inner = MimePart::multipart("alternative", vec![], vec![MimePart::text_plain("hi")]);
        let outer = MimePart::multipart("mixed", vec![], vec![inner]);
        let rendered = outer.render();
        assert!(rendered.starts_with("Content-Type: multipart/mixed; boundary="));
        assert!(rendered.contains("Content-Type: multipart/alternative; boundary="));
        assert!(rendered.contains("Content-Type: text/plain"));
        assert!(rendered.trim_end().ends_with("--"));
    }

    #[test]
    fn attachment_encodings_follow_type() {
        let text = MimePart::attachment("notes.txt", "text/plain", b"hello");
        assert!(text.render().contains("Content-Transfer-Encoding: quoted-printable"));
        let binary = MimePart::attachment("data.bin", "application/octet-stream", &[0u8, 1, 2]);
        let rendered = binary.render();
        assert!(rendered.contains("Content-Transfer-Encoding: base64"));
        assert!(rendered.contains("Content-Disposition: attachment; filename=\"data.bin\""));
    }

    #[test]
    fn message_rendering_prepends_headers() {
        let root = MimePart::text_plain("body");
        let rendered = render_message(
            &[("Subject".to_string(), "Hi".to_string())],
            &root,
        );
        assert!(rendered.starts_with("Subject: Hi\r\nMIME-Version: 1.0\r\nContent-Type: text/plain"));
    }
}
