//! Outbound INDI command encoding
//!
//! Builders for the client-to-server vocabulary: `getProperties`,
//! `new{Text,Number,Switch,BLOB}Vector`, and `enableBLOB`. Values are
//! XML-escaped; numbers use the general float format (the property's
//! display format string is an inbound concern only).

use crate::BlobPolicy;
use quick_xml::escape::escape;

/// Payload bytes per line in a BLOB element body.
pub const BLOB_LINE_LEN: usize = 72;

pub fn get_properties(version: &str, device: Option<&str>) -> String {
    match device {
        Some(device) => format!(
            "<getProperties version='{}' device='{}'/>\n",
            escape(version),
            escape(device)
        ),
        None => format!("<getProperties version='{}'/>\n", escape(version)),
    }
}

pub fn new_text_vector(device: &str, name: &str, elements: &[(&str, &str)]) -> String {
    let mut out = format!(
        "<newTextVector device='{}' name='{}'>\n",
        escape(device),
        escape(name)
    );
    for (element, text) in elements {
        out.push_str(&format!(
            "  <oneText name='{}'>{}</oneText>\n",
            escape(element),
            escape(text)
        ));
    }
    out.push_str("</newTextVector>\n");
    out
}

pub fn new_number_vector(device: &str, name: &str, elements: &[(&str, f64)]) -> String {
    let mut out = format!(
        "<newNumberVector device='{}' name='{}'>\n",
        escape(device),
        escape(name)
    );
    for (element, value) in elements {
        out.push_str(&format!(
            "  <oneNumber name='{}'>{}</oneNumber>\n",
            escape(element),
            value
        ));
    }
    out.push_str("</newNumberVector>\n");
    out
}

pub fn new_switch_vector(device: &str, name: &str, elements: &[(&str, bool)]) -> String {
    let mut out = format!(
        "<newSwitchVector device='{}' name='{}'>\n",
        escape(device),
        escape(name)
    );
    for (element, on) in elements {
        out.push_str(&format!(
            "  <oneSwitch name='{}'>{}</oneSwitch>\n",
            escape(element),
            if *on { "On" } else { "Off" }
        ));
    }
    out.push_str("</newSwitchVector>\n");
    out
}

/// Open a `newBLOBVector`. Must be followed by one or more [`one_blob`]
/// bodies and closed with [`finish_blob`].
pub fn start_blob(device: &str, name: &str, timestamp: &str) -> String {
    format!(
        "<newBLOBVector device='{}' name='{}' timestamp='{}'>\n",
        escape(device),
        escape(name),
        escape(timestamp)
    )
}

/// Encode one BLOB element. The payload (typically base64 text) is declared
/// with its total size and format once, then streamed in lines of at most
/// [`BLOB_LINE_LEN`] bytes.
pub fn one_blob(name: &str, format: &str, payload: &[u8]) -> String {
    let mut out = format!(
        "  <oneBLOB name='{}' size='{}' format='{}'>\n",
        escape(name),
        payload.len(),
        escape(format)
    );
    for line in payload.chunks(BLOB_LINE_LEN) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str("  </oneBLOB>\n");
    out
}

pub fn finish_blob() -> String {
    "</newBLOBVector>\n".to_string()
}

pub fn enable_blob(device: &str, property: Option<&str>, policy: BlobPolicy) -> String {
    match property {
        Some(property) => format!(
            "<enableBLOB device='{}' name='{}'>{}</enableBLOB>\n",
            escape(device),
            escape(property),
            policy.as_str()
        ),
        None => format!(
            "<enableBLOB device='{}'>{}</enableBLOB>\n",
            escape(device),
            policy.as_str()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::ElementReader;

    #[test]
    fn get_properties_forms() {
        assert_eq!(
            get_properties("1.7", None),
            "<getProperties version='1.7'/>\n"
        );
        assert_eq!(
            get_properties("1.7", Some("CCD Simulator")),
            "<getProperties version='1.7' device='CCD Simulator'/>\n"
        );
    }

    #[test]
    fn switch_vector_contains_all_elements() {
        let cmd = new_switch_vector(
            "Camera",
            "CONNECTION",
            &[("CONNECT", true), ("DISCONNECT", false)],
        );
        assert!(cmd.contains("<oneSwitch name='CONNECT'>On</oneSwitch>"));
        assert!(cmd.contains("<oneSwitch name='DISCONNECT'>Off</oneSwitch>"));
    }

    #[test]
    fn encoded_commands_decode_cleanly() {
        // Everything we emit must frame as a single well-formed element.
        let commands = [
            new_text_vector("CCD", "UPLOAD_SETTINGS", &[("UPLOAD_DIR", "/tmp & more")]),
            new_number_vector("Focuser", "ABS_FOCUS_POSITION", &[("POSITION", 1250.5)]),
            new_switch_vector("Camera", "CONNECTION", &[("CONNECT", true)]),
            enable_blob("CCD", Some("CCD1"), BlobPolicy::Also),
        ];
        for cmd in commands {
            let elements = ElementReader::new().feed_slice(cmd.as_bytes()).unwrap();
            assert_eq!(elements.len(), 1, "command: {}", cmd);
        }
    }

    #[test]
    fn blob_body_chunked_into_72_byte_lines() {
        let payload = vec![b'A'; 300];
        let body = one_blob("CCD1", ".fits", &payload);
        assert!(body.contains("size='300'"));
        assert!(body.contains("format='.fits'"));
        let payload_lines: Vec<&str> = body
            .lines()
            .filter(|l| !l.trim_start().starts_with('<') && !l.is_empty())
            .collect();
        // ceil(300 / 72) = 5
        assert_eq!(payload_lines.len(), 5);
        assert!(payload_lines[..4].iter().all(|l| l.len() == 72));
        assert_eq!(payload_lines[4].len(), 300 - 4 * 72);
    }

    #[test]
    fn blob_vector_frames_as_one_element() {
        let mut doc = start_blob("CCD", "CCD1", "2026-08-23T00:00:00");
        doc.push_str(&one_blob("CCD1", ".fits", b"QUJDREVGRw=="));
        doc.push_str(&finish_blob());
        let elements = ElementReader::new().feed_slice(doc.as_bytes()).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].tag, "newBLOBVector");
        assert_eq!(elements[0].children.len(), 1);
        assert_eq!(elements[0].children[0].attr("size"), Some("12"));
    }

    #[test]
    fn enable_blob_policies() {
        assert!(enable_blob("CCD", None, BlobPolicy::Never).contains(">Never<"));
        assert!(enable_blob("CCD", None, BlobPolicy::Only).contains(">Only<"));
    }
}
