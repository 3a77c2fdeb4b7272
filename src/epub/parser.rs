//! Low-level XML helpers shared by the extractor and the patcher.

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{Error, Result};

/// Path of the OCF container descriptor inside every EPUB.
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Parse META-INF/container.xml and return the `full-path` of the first rootfile.
pub fn parse_container_xml(bytes: &[u8]) -> Result<String> {
    let content = std::str::from_utf8(strip_bom(bytes))
        .map_err(|e| Error::corrupt("container.xml is not UTF-8", e))?;

    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if local_name(e.name().as_ref()) == b"rootfile" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"full-path" {
                        let raw = std::str::from_utf8(&attr.value)
                            .map_err(|e| Error::corrupt("rootfile path is not UTF-8", e))?;
                        return Ok(unescape_attr(raw));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::corrupt("malformed container.xml", e)),
            _ => {}
        }
    }

    Err(Error::Corrupt("No rootfile found in container.xml".into()))
}

/// Strip UTF-8 BOM if present.
pub fn strip_bom(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &data[3..]
    } else {
        data
    }
}

/// Extract local name from namespaced XML name (e.g., "dc:title" -> "title").
pub fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

/// Unescape an attribute value, keeping the raw text if it holds an unknown entity.
pub fn unescape_attr(raw: &str) -> String {
    match quick_xml::escape::unescape(raw) {
        Ok(value) => value.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Resolve XML entity references.
pub fn resolve_entity(entity: &str) -> Option<String> {
    match entity {
        "apos" => return Some("'".to_string()),
        "quot" => return Some("\"".to_string()),
        "lt" => return Some("<".to_string()),
        "gt" => return Some(">".to_string()),
        "amp" => return Some("&".to_string()),
        _ => {}
    }

    if let Some(hex) = entity.strip_prefix("#x") {
        if let Ok(code) = u32::from_str_radix(hex, 16)
            && let Some(c) = char::from_u32(code)
        {
            return Some(c.to_string());
        }
    } else if let Some(dec) = entity.strip_prefix('#')
        && let Ok(code) = dec.parse::<u32>()
        && let Some(c) = char::from_u32(code)
    {
        return Some(c.to_string());
    }

    None
}
