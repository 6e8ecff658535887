//! Incremental XML element reader
//!
//! The INDI server streams top-level XML fragments with no framing, so the
//! decoder must work byte-at-a-time: `feed` consumes one byte and yields a
//! completed element once its closing tag (or self-close) has been seen.
//! Because the unit of input is a single byte, chunk boundaries cannot
//! affect the output. A framer tracks element depth and quoting; completed
//! fragments are parsed into a tree with quick-xml.
//!
//! One reader instance is scoped to one connection: create at connect,
//! discard at disconnect. Any framing or parse failure is fatal for the
//! connection.

use crate::error::{IndiError, IndiResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// A parsed XML element: tag, attributes, nested children, and the
/// concatenated (whitespace-trimmed) character data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    /// Look up an attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Depth zero, outside any markup
    Between,
    /// Consumed `<`, markup kind not yet known
    AfterLt,
    /// Inside a start or end tag; `closing` set for `</...`, `last` is the
    /// previous byte (detects `/>`)
    Tag { closing: bool, last: u8 },
    /// Inside a quoted attribute value
    Quote { delim: u8, closing: bool },
    /// Consumed `<!`
    Bang,
    /// Consumed `<!-`
    BangDash,
    /// Inside `<!-- ... -->`; `dashes` counts the trailing `-` run
    Comment { dashes: u8 },
    /// Inside `<! ... >` (declarations; the protocol never nests these)
    Decl,
    /// Inside `<? ... ?>`
    Pi,
    /// Saw `?` inside a processing instruction
    PiQm,
    /// Element content at depth >= 1
    Content,
}

/// Connection-scoped incremental decoder.
pub struct ElementReader {
    state: FrameState,
    depth: u32,
    buf: Vec<u8>,
}

impl Default for ElementReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementReader {
    pub fn new() -> Self {
        Self {
            state: FrameState::Between,
            depth: 0,
            buf: Vec::new(),
        }
    }

    /// Consume one byte. Returns a completed top-level element when this
    /// byte closes one, `None` while a fragment is still open, or
    /// `MalformedXml` on bad markup (fatal for the connection).
    pub fn feed(&mut self, byte: u8) -> IndiResult<Option<XmlElement>> {
        match self.state {
            FrameState::Between => match byte {
                b if b.is_ascii_whitespace() => Ok(None),
                b'<' => {
                    self.state = FrameState::AfterLt;
                    Ok(None)
                }
                b => Err(IndiError::MalformedXml(format!(
                    "unexpected character {:?} between elements",
                    b as char
                ))),
            },
            FrameState::AfterLt => match byte {
                b'!' => {
                    if self.depth > 0 {
                        self.buf.extend_from_slice(b"<!");
                    }
                    self.state = FrameState::Bang;
                    Ok(None)
                }
                b'?' => {
                    if self.depth > 0 {
                        self.buf.extend_from_slice(b"<?");
                    }
                    self.state = FrameState::Pi;
                    Ok(None)
                }
                b'/' => {
                    if self.depth == 0 {
                        return Err(IndiError::MalformedXml(
                            "closing tag with no open element".to_string(),
                        ));
                    }
                    self.buf.extend_from_slice(b"</");
                    self.state = FrameState::Tag {
                        closing: true,
                        last: b'/',
                    };
                    Ok(None)
                }
                b'>' => Err(IndiError::MalformedXml("empty tag '<>'".to_string())),
                b => {
                    self.buf.push(b'<');
                    self.buf.push(b);
                    self.state = FrameState::Tag {
                        closing: false,
                        last: b,
                    };
                    Ok(None)
                }
            },
            FrameState::Tag { closing, last } => match byte {
                b'"' | b'\'' => {
                    self.buf.push(byte);
                    self.state = FrameState::Quote {
                        delim: byte,
                        closing,
                    };
                    Ok(None)
                }
                b'>' => {
                    self.buf.push(b'>');
                    if closing {
                        self.depth -= 1;
                    } else if last != b'/' {
                        self.depth += 1;
                    }
                    if self.depth == 0 {
                        self.state = FrameState::Between;
                        self.complete().map(Some)
                    } else {
                        self.state = FrameState::Content;
                        Ok(None)
                    }
                }
                b => {
                    self.buf.push(b);
                    self.state = FrameState::Tag { closing, last: b };
                    Ok(None)
                }
            },
            FrameState::Quote { delim, closing } => {
                self.buf.push(byte);
                if byte == delim {
                    self.state = FrameState::Tag {
                        closing,
                        last: byte,
                    };
                }
                Ok(None)
            }
            FrameState::Bang => {
                if self.depth > 0 {
                    self.buf.push(byte);
                }
                self.state = if byte == b'-' {
                    FrameState::BangDash
                } else {
                    FrameState::Decl
                };
                Ok(None)
            }
            FrameState::BangDash => {
                if self.depth > 0 {
                    self.buf.push(byte);
                }
                self.state = if byte == b'-' {
                    FrameState::Comment { dashes: 0 }
                } else {
                    FrameState::Decl
                };
                Ok(None)
            }
            FrameState::Comment { dashes } => {
                if self.depth > 0 {
                    self.buf.push(byte);
                }
                match byte {
                    b'-' => {
                        self.state = FrameState::Comment {
                            dashes: (dashes + 1).min(2),
                        };
                    }
                    b'>' if dashes >= 2 => {
                        self.state = self.resume_state();
                    }
                    _ => self.state = FrameState::Comment { dashes: 0 },
                }
                Ok(None)
            }
            FrameState::Decl => {
                if self.depth > 0 {
                    self.buf.push(byte);
                }
                if byte == b'>' {
                    self.state = self.resume_state();
                }
                Ok(None)
            }
            FrameState::Pi => {
                if self.depth > 0 {
                    self.buf.push(byte);
                }
                if byte == b'?' {
                    self.state = FrameState::PiQm;
                }
                Ok(None)
            }
            FrameState::PiQm => {
                if self.depth > 0 {
                    self.buf.push(byte);
                }
                match byte {
                    b'>' => self.state = self.resume_state(),
                    b'?' => {}
                    _ => self.state = FrameState::Pi,
                }
                Ok(None)
            }
            FrameState::Content => {
                if byte == b'<' {
                    self.state = FrameState::AfterLt;
                } else {
                    self.buf.push(byte);
                }
                Ok(None)
            }
        }
    }

    /// Feed a whole chunk, collecting every element it completes.
    pub fn feed_slice(&mut self, bytes: &[u8]) -> IndiResult<Vec<XmlElement>> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(element) = self.feed(b)? {
                out.push(element);
            }
        }
        Ok(out)
    }

    fn resume_state(&self) -> FrameState {
        if self.depth == 0 {
            FrameState::Between
        } else {
            FrameState::Content
        }
    }

    fn complete(&mut self) -> IndiResult<XmlElement> {
        let bytes = std::mem::take(&mut self.buf);
        let fragment = String::from_utf8(bytes)
            .map_err(|e| IndiError::MalformedXml(format!("invalid UTF-8 in element: {}", e)))?;
        parse_fragment(&fragment)
    }
}

/// Parse one complete, framed fragment into an element tree.
fn parse_fragment(fragment: &str) -> IndiResult<XmlElement> {
    let mut reader = Reader::from_str(fragment);
    reader.trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from_start(&e)?),
            Ok(Event::Empty(e)) => {
                let element = element_from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| IndiError::MalformedXml(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| IndiError::MalformedXml("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Ok(Event::Eof) => {
                return Err(IndiError::MalformedXml(
                    "truncated element fragment".to_string(),
                ))
            }
            // Comments, declarations, and PIs carry no protocol content
            Ok(_) => {}
            Err(e) => return Err(IndiError::MalformedXml(e.to_string())),
        }
    }
}

fn element_from_start(e: &BytesStart) -> IndiResult<XmlElement> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| IndiError::MalformedXml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| IndiError::MalformedXml(e.to_string()))?
            .to_string();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        tag,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SET_VECTOR: &str = "<setNumberVector device='Telescope' name='EQUATORIAL_EOD_COORD' state='Ok'>\n\
         <oneNumber name='RA'>\n 1.5\n</oneNumber>\n\
         <oneNumber name='DEC'>\n -20.25\n</oneNumber>\n\
         </setNumberVector>";

    fn decode_all(xml: &str) -> Vec<XmlElement> {
        ElementReader::new().feed_slice(xml.as_bytes()).unwrap()
    }

    #[test]
    fn decodes_single_element() {
        let elements = decode_all(SET_VECTOR);
        assert_eq!(elements.len(), 1);
        let root = &elements[0];
        assert_eq!(root.tag, "setNumberVector");
        assert_eq!(root.attr("device"), Some("Telescope"));
        assert_eq!(root.attr("state"), Some("Ok"));
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].attr("name"), Some("RA"));
        assert_eq!(root.children[0].text, "1.5");
        assert_eq!(root.children[1].text, "-20.25");
    }

    #[test]
    fn chunking_invariance() {
        // Same document split at every possible boundary must yield the
        // same element sequence.
        let doc = format!("{}\n<getProperties version='1.7'/>\n{}", SET_VECTOR, SET_VECTOR);
        let expected = decode_all(&doc);
        assert_eq!(expected.len(), 3);
        let bytes = doc.as_bytes();
        for split in 0..bytes.len() {
            let mut reader = ElementReader::new();
            let mut got = reader.feed_slice(&bytes[..split]).unwrap();
            got.extend(reader.feed_slice(&bytes[split..]).unwrap());
            assert_eq!(got, expected, "split at {}", split);
        }
    }

    #[test]
    fn self_closing_top_level() {
        let elements = decode_all("<getProperties version=\"1.7\" device=\"CCD\"/>");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].tag, "getProperties");
        assert_eq!(elements[0].attr("device"), Some("CCD"));
        assert!(elements[0].children.is_empty());
    }

    #[test]
    fn tolerates_whitespace_and_comments_between_elements() {
        let elements =
            decode_all("  \n\t <!-- server banner --> <message device='CCD' message='hi'/> \n");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].attr("message"), Some("hi"));
    }

    #[test]
    fn rejects_garbage_between_elements() {
        let mut reader = ElementReader::new();
        let err = reader.feed_slice(b"bogus<message/>").unwrap_err();
        assert!(matches!(err, IndiError::MalformedXml(_)));
    }

    #[test]
    fn rejects_stray_closing_tag() {
        let mut reader = ElementReader::new();
        let err = reader.feed_slice(b"</oops>").unwrap_err();
        assert!(matches!(err, IndiError::MalformedXml(_)));
    }

    #[test]
    fn rejects_mismatched_tags() {
        let mut reader = ElementReader::new();
        let err = reader.feed_slice(b"<a><b></a></b>").unwrap_err();
        assert!(matches!(err, IndiError::MalformedXml(_)));
    }

    #[test]
    fn unescapes_attribute_entities() {
        let elements = decode_all("<message device='CCD' message='a &gt; b &lt; c'/>");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].attr("message"), Some("a > b < c"));
    }

    #[test]
    fn unescapes_entities() {
        let elements = decode_all("<oneText name='NOTE'>fish &amp; chips</oneText>");
        assert_eq!(elements[0].text, "fish & chips");
    }

    #[test]
    fn reader_reusable_across_elements() {
        let mut reader = ElementReader::new();
        let first = reader.feed_slice(b"<message device='A'/>").unwrap();
        let second = reader.feed_slice(b"<message device='B'/>").unwrap();
        assert_eq!(first[0].attr("device"), Some("A"));
        assert_eq!(second[0].attr("device"), Some("B"));
    }
}
