//! Origin/source extraction from embedded XMP packets.

use regex::Regex;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::LazyLock;

/// XMP packets sit near the start of a file; bytes past this are not read.
pub const MAX_SCAN_BYTES: u64 = 512 * 1024;

const PACKET_START: &[u8] = b"<x:xmpmeta";
const PACKET_END: &[u8] = b"</x:xmpmeta>";

/// Checked in order; the first element with usable text wins.
const ORIGIN_TAGS: [&str; 8] = [
    "dc:source",
    "photoshop:Source",
    "Iptc4xmpCore:Source",
    "dc:creator",
    "xmpMM:DerivedFrom",
    "xmpMM:History",
    "photoshop:Author",
    "dc:publisher",
];

/// Element and attribute patterns for each entry of `ORIGIN_TAGS`.
static ORIGIN_PATTERNS: LazyLock<Vec<(Regex, Regex)>> = LazyLock::new(|| {
    ORIGIN_TAGS
        .iter()
        .map(|tag| {
            let tag = regex::escape(tag);
            let element = Regex::new(&format!(r"(?s)<{tag}\b[^>]*>(.*?)</{tag}>")).unwrap();
            let attribute = Regex::new(&format!(r#"\b{tag}\s*=\s*"([^"]*)""#)).unwrap();
            (element, attribute)
        })
        .collect()
});

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<rdf:li\b[^>]*>(.*?)</rdf:li>").unwrap());

static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static FALLBACK_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<([A-Za-z][\w.-]*:[\w.-]*(?:origin|source)[\w.-]*)\b[^>]*>(.*?)</([A-Za-z][\w.-]*:[\w.-]*)>")
        .unwrap()
});

/// Read the origin of the image at `path`, if its XMP declares one.
pub fn read_origin(path: &Path) -> io::Result<Option<String>> {
    let mut buffer = Vec::new();
    File::open(path)?
        .take(MAX_SCAN_BYTES)
        .read_to_end(&mut buffer)?;

    Ok(extract_packet(&buffer).and_then(|packet| origin_from_packet(&packet)))
}

/// Locate the `<x:xmpmeta>` packet inside raw file bytes.
pub fn extract_packet(bytes: &[u8]) -> Option<String> {
    let start = find(bytes, PACKET_START, 0)?;
    let end = find(bytes, PACKET_END, start)? + PACKET_END.len();
    Some(String::from_utf8_lossy(&bytes[start..end]).into_owned())
}

pub fn origin_from_packet(packet: &str) -> Option<String> {
    for (element, attribute) in ORIGIN_PATTERNS.iter() {
        let value = element
            .captures_iter(packet)
            .find_map(|captures| first_text(&captures[1]))
            .or_else(|| {
                attribute
                    .captures_iter(packet)
                    .find_map(|captures| clean(&captures[1]))
            });
        if value.is_some() {
            return value;
        }
    }

    // Any other element whose name mentions an origin or source.
    FALLBACK_ELEMENT
        .captures_iter(packet)
        .filter(|captures| captures[1] == captures[3])
        .find_map(|captures| first_text(&captures[2]))
}

/// Prefer the first `rdf:li` entry, then the element's own text.
fn first_text(inner: &str) -> Option<String> {
    LIST_ITEM
        .captures_iter(inner)
        .find_map(|captures| clean(&ANY_TAG.replace_all(&captures[1], " ")))
        .or_else(|| clean(&ANY_TAG.replace_all(inner, " ")))
}

fn clean(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(unescape(&collapsed))
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|offset| from + offset)
}
