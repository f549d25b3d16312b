//! Appcast feed model and parser.
//!
//! An appcast is an RSS-like XML document. Releases are `<item>` elements,
//! optionally grouped in `<channel>` containers. Parsing is pure data
//! extraction: nothing in the document is ever executed or dereferenced.
//!
//! ```text
//! <rss xmlns:sparkle="http://www.andymatuschak.org/xml-namespaces/sparkle">
//!   <channel>
//!     <item>
//!       <title>Version 2.0</title>
//!       <sparkle:version>2.0</sparkle:version>
//!       <sparkle:minimumSystemVersion>10.0</sparkle:minimumSystemVersion>
//!       <enclosure url="https://example.com/app-2.0.exe" length="1024"
//!                  sparkle:os="windows-x64" sparkle:edSignature="..."/>
//!     </item>
//!   </channel>
//! </rss>
//! ```
//!
//! Namespace prefixes are ignored; elements and attributes are matched on
//! their local names.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, trace};

use crate::error::ParseError;
use crate::version::Version;

/// Channel identity shared by the empty string and `"release"`.
pub const RELEASE_CHANNEL: &str = "release";

/// Whether an item channel satisfies the channel the caller asked for.
///
/// Equal names match, and the empty channel and `"release"` are the same
/// identity in both directions.
pub fn channel_matches(item_channel: &str, required_channel: &str) -> bool {
    let is_release = |c: &str| c.is_empty() || c == RELEASE_CHANNEL;
    item_channel == required_channel || (is_release(item_channel) && is_release(required_channel))
}

/// How a release marks itself as critical.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CriticalUpdate {
    /// Not critical.
    #[default]
    None,
    /// Critical for every installed version.
    Always,
    /// Critical only for installed versions older than this one.
    Below(String),
}

impl CriticalUpdate {
    /// Whether the release is critical for the given installed version.
    pub fn applies_to(&self, installed: &Version) -> bool {
        match self {
            Self::None => false,
            Self::Always => true,
            Self::Below(threshold) => *installed < Version::parse(threshold),
        }
    }
}

/// Binary artifact attributes of an item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Enclosure {
    pub url: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub length: Option<u64>,
    pub content_type: Option<String>,
    pub sha_hash: Option<String>,
    pub md5_hash: Option<String>,
    pub ed_signature: Option<String>,
    pub ed_key_version: Option<String>,
}

/// One release candidate parsed from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestItem {
    pub title: String,
    pub link: String,
    pub version: String,
    pub minimum_system_version: Option<String>,
    pub critical_update: CriticalUpdate,
    pub installer_args: String,
    /// Human-readable publication date.
    pub published_at: String,
    /// Publication time when the feed gave it as epoch seconds.
    pub published_epoch: Option<i64>,
    pub description: String,
    pub release_notes_link: Option<String>,
    pub os_label: Option<String>,
    pub build_label: Option<String>,
    /// Channel the item was published in (empty for the default channel).
    pub channel: String,
    pub enclosure: Option<Enclosure>,
}

impl ManifestItem {
    /// Version of the release: the item element, else the enclosure attribute.
    pub fn effective_version(&self) -> &str {
        if !self.version.is_empty() {
            return &self.version;
        }
        self.enclosure
            .as_ref()
            .and_then(|e| e.version.as_deref())
            .unwrap_or("")
    }

    /// Parsed release version.
    pub fn parsed_version(&self) -> Version {
        Version::parse(self.effective_version())
    }

    /// Whether this release is critical for `installed`.
    pub fn is_critical_for(&self, installed: &Version) -> bool {
        self.critical_update.applies_to(installed)
    }
}

/// Parse every item of `document` that belongs to `required_channel`.
///
/// Items in non-matching `<channel>` containers are skipped without being
/// built. Parsing stops as soon as a matching container closes.
pub fn parse_items(document: &str, required_channel: &str) -> Result<Vec<ManifestItem>, ParseError> {
    FeedParser::new(document, required_channel).run()
}

/// Format epoch seconds as an RFC 2822 date.
pub fn format_epoch(secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.to_rfc2822())
}

// ============================================================================
// Parser
// ============================================================================

struct ItemBuilder {
    item: ManifestItem,
    /// Stack depth of the `<item>` element.
    depth: usize,
    in_tags: bool,
    pub_date: Option<String>,
    item_channel: Option<String>,
}

struct FeedParser<'a> {
    document: &'a str,
    reader: Reader<&'a [u8]>,
    required_channel: &'a str,
    stack: Vec<String>,
    /// Depth of a non-matching `<channel>` whose content is ignored.
    skip_depth: Option<usize>,
    /// Name and depth of the enclosing `<channel>`, if any.
    channel: Option<(String, usize)>,
    item: Option<ItemBuilder>,
    text: String,
    items: Vec<ManifestItem>,
}

impl<'a> FeedParser<'a> {
    fn new(document: &'a str, required_channel: &'a str) -> Self {
        let mut reader = Reader::from_str(document);
        reader.config_mut().trim_text(false);
        Self {
            document,
            reader,
            required_channel,
            stack: Vec::new(),
            skip_depth: None,
            channel: None,
            item: None,
            text: String::new(),
            items: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<ManifestItem>, ParseError> {
        loop {
            let event = self.reader.read_event().map_err(|e| self.syntax(e.to_string()))?;
            match event {
                Event::Start(e) => {
                    let name = local_name(&e);
                    self.stack.push(name.clone());
                    if self.skip_depth.is_none() {
                        self.open(&name, &e)?;
                    }
                }
                Event::Empty(e) => {
                    let name = local_name(&e);
                    self.stack.push(name.clone());
                    let depth = self.stack.len();
                    if self.skip_depth.is_none() {
                        self.open(&name, &e)?;
                        if self.skip_depth == Some(depth) {
                            // an empty non-matching <channel/> has nothing to skip
                            self.skip_depth = None;
                        } else if self.close_at(&name, depth)? {
                            break;
                        }
                    }
                    self.stack.pop();
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    let depth = self.stack.len();
                    if self.stack.pop().as_deref() != Some(name.as_str()) {
                        return Err(self.syntax(format!("unexpected closing tag </{}>", name)));
                    }
                    match self.skip_depth {
                        Some(skip) if skip == depth => self.skip_depth = None,
                        Some(_) => {}
                        None => {
                            if self.close_at(&name, depth)? {
                                break;
                            }
                        }
                    }
                }
                Event::Text(e) => {
                    if self.collecting() {
                        let text = e.decode().map_err(|e| self.syntax(e.to_string()))?;
                        self.text.push_str(&text);
                    }
                }
                Event::CData(e) => {
                    if self.collecting() {
                        let raw = e.into_inner();
                        let text = std::str::from_utf8(&raw)
                            .map_err(|e| self.syntax(format!("invalid UTF-8 in CDATA: {}", e)))?;
                        self.text.push_str(text);
                    }
                }
                Event::GeneralRef(e) => {
                    if self.collecting() {
                        let name = std::str::from_utf8(&e)
                            .map_err(|e| self.syntax(format!("invalid entity name: {}", e)))?;
                        let entity = format!("&{};", name);
                        let resolved = quick_xml::escape::unescape(&entity)
                            .map_err(|e| self.syntax(e.to_string()))?;
                        self.text.push_str(&resolved);
                    }
                }
                Event::Eof => {
                    if let Some(open) = self.stack.last() {
                        return Err(self.syntax(format!("unexpected end of document inside <{}>", open)));
                    }
                    break;
                }
                _ => {}
            }
        }

        debug!(
            items = self.items.len(),
            channel = %self.required_channel,
            "Parsed appcast"
        );
        Ok(self.items)
    }

    fn collecting(&self) -> bool {
        self.skip_depth.is_none() && self.item.is_some()
    }

    fn syntax(&self, message: String) -> ParseError {
        ParseError::Syntax {
            line: line_at(self.document, &self.reader),
            message,
        }
    }

    fn open(&mut self, name: &str, e: &BytesStart<'_>) -> Result<(), ParseError> {
        let depth = self.stack.len();

        if let Some(builder) = self.item.as_mut() {
            // Markup nested in a field is part of that field's text.
            if depth == builder.depth + 1 {
                self.text.clear();
            }
            match name {
                "item" => return Err(ParseError::Structure("nested <item> element".into())),
                "tags" => {
                    if builder.in_tags {
                        return Err(ParseError::Structure("nested <tags> element".into()));
                    }
                    builder.in_tags = true;
                }
                "criticalUpdate" => {
                    let threshold = attr(e, "version", self.document, &self.reader)?;
                    builder.item.critical_update = match threshold.as_deref().map(str::trim) {
                        None | Some("") | Some("*") => CriticalUpdate::Always,
                        Some(v) => CriticalUpdate::Below(v.to_string()),
                    };
                }
                "description" => {
                    if let Some(url) = attr(e, "url", self.document, &self.reader)? {
                        let url = url.trim();
                        if !url.is_empty() {
                            builder.item.release_notes_link = Some(url.to_string());
                        }
                    }
                }
                "enclosure" => {
                    let enclosure = parse_enclosure(e, &mut builder.item, self.document, &self.reader)?;
                    builder.item.enclosure = Some(enclosure);
                }
                _ => {}
            }
            return Ok(());
        }

        match name {
            "channel" => {
                let channel = attr(e, "name", self.document, &self.reader)?
                    .map(|c| c.trim().to_string())
                    .unwrap_or_default();
                if channel_matches(&channel, self.required_channel) {
                    trace!(channel = %channel, "Entering matching channel");
                    self.channel = Some((channel, depth));
                } else {
                    trace!(channel = %channel, "Skipping channel");
                    self.skip_depth = Some(depth);
                }
            }
            "item" => {
                let channel = self
                    .channel
                    .as_ref()
                    .map(|(c, _)| c.clone())
                    .unwrap_or_default();
                self.item = Some(ItemBuilder {
                    item: ManifestItem {
                        channel,
                        ..ManifestItem::default()
                    },
                    depth,
                    in_tags: false,
                    pub_date: None,
                    item_channel: None,
                });
            }
            "tags" | "criticalUpdate" => {
                return Err(ParseError::Structure(format!(
                    "<{}> outside of an <item>",
                    name
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Handle a closing element at `depth`. Returns `true` to stop parsing.
    fn close_at(&mut self, name: &str, depth: usize) -> Result<bool, ParseError> {
        if let Some(builder) = self.item.as_mut() {
            if name == "item" && depth == builder.depth {
                self.text.clear();
                self.finish_item();
                return Ok(false);
            }
            if depth != builder.depth + 1 {
                return Ok(false);
            }
            let text = std::mem::take(&mut self.text);
            let value = text.trim();
            let item = &mut builder.item;
            match name {
                "title" => item.title = value.to_string(),
                "link" => item.link = value.to_string(),
                "description" => item.description = value.to_string(),
                "releaseNotesLink" if !value.is_empty() => {
                    item.release_notes_link = Some(value.to_string())
                }
                "version" => item.version = value.to_string(),
                "minimumSystemVersion" if !value.is_empty() => {
                    item.minimum_system_version = Some(value.to_string())
                }
                "installerArguments" => item.installer_args = value.to_string(),
                "published" => match value.parse::<i64>() {
                    Ok(secs) => {
                        item.published_epoch = Some(secs);
                        item.published_at = format_epoch(secs).unwrap_or_else(|| value.to_string());
                    }
                    Err(_) => item.published_at = value.to_string(),
                },
                "pubDate" => builder.pub_date = Some(value.to_string()),
                "channel" => builder.item_channel = Some(value.to_string()),
                "tags" => builder.in_tags = false,
                _ => {}
            }
            return Ok(false);
        }

        if name == "channel" {
            if let Some((channel, channel_depth)) = self.channel.take() {
                if channel_depth == depth {
                    debug!(channel = %channel, "Matching channel closed, stopping");
                    return Ok(true);
                }
                self.channel = Some((channel, channel_depth));
            }
        }
        Ok(false)
    }

    fn finish_item(&mut self) {
        let Some(builder) = self.item.take() else {
            return;
        };
        let mut item = builder.item;

        if item.published_at.is_empty() {
            if let Some(date) = builder.pub_date {
                item.published_at = date;
            }
        }
        if let Some(channel) = builder.item_channel {
            item.channel = channel;
        }
        if !channel_matches(&item.channel, self.required_channel) {
            trace!(channel = %item.channel, title = %item.title, "Dropping item from other channel");
            return;
        }

        trace!(title = %item.title, version = %item.effective_version(), "Parsed item");
        self.items.push(item);
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn line_at(document: &str, reader: &Reader<&[u8]>) -> usize {
    let pos = (reader.buffer_position() as usize).min(document.len());
    document.as_bytes()[..pos].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Decode every attribute of `e` as `(local name, unescaped value)`.
fn attributes(
    e: &BytesStart<'_>,
    document: &str,
    reader: &Reader<&[u8]>,
) -> Result<Vec<(String, String)>, ParseError> {
    let syntax = |message: String| ParseError::Syntax {
        line: line_at(document, reader),
        message,
    };

    let mut out = Vec::new();
    for attribute in e.attributes().with_checks(false) {
        let attribute = attribute.map_err(|e| syntax(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let raw = std::str::from_utf8(&attribute.value)
            .map_err(|e| syntax(format!("invalid UTF-8 in attribute {}: {}", key, e)))?;
        let value: Cow<'_, str> =
            quick_xml::escape::unescape(raw).map_err(|e| syntax(e.to_string()))?;
        out.push((key, value.into_owned()));
    }
    Ok(out)
}

fn attr(
    e: &BytesStart<'_>,
    name: &str,
    document: &str,
    reader: &Reader<&[u8]>,
) -> Result<Option<String>, ParseError> {
    Ok(attributes(e, document, reader)?
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value))
}

/// Set a platform label, rejecting a conflicting value.
fn set_label(slot: &mut Option<String>, attribute: &str, value: &str) -> Result<(), ParseError> {
    match slot {
        Some(existing) if existing != value => Err(ParseError::Structure(format!(
            "conflicting {} attributes: '{}' and '{}'",
            attribute, existing, value
        ))),
        _ => {
            *slot = Some(value.to_string());
            Ok(())
        }
    }
}

fn parse_enclosure(
    e: &BytesStart<'_>,
    item: &mut ManifestItem,
    document: &str,
    reader: &Reader<&[u8]>,
) -> Result<Enclosure, ParseError> {
    let mut enclosure = Enclosure::default();

    for (key, value) in attributes(e, document, reader)? {
        let value = value.trim();
        let text = || (!value.is_empty()).then(|| value.to_string());
        match key.as_str() {
            "url" => enclosure.url = value.to_string(),
            "name" => enclosure.name = text(),
            "version" => enclosure.version = text(),
            "length" => {
                if !value.is_empty() {
                    let length = value.parse::<u64>().map_err(|_| {
                        ParseError::Structure(format!("invalid enclosure length '{}'", value))
                    })?;
                    enclosure.length = Some(length);
                }
            }
            "type" => enclosure.content_type = text(),
            "os" if !value.is_empty() => set_label(&mut item.os_label, "os", value)?,
            "build" if !value.is_empty() => set_label(&mut item.build_label, "build", value)?,
            "shaSignature" => enclosure.sha_hash = text(),
            "md5Signature" => enclosure.md5_hash = text(),
            "edSignature" => enclosure.ed_signature = text(),
            "edKeyVersion" => enclosure.ed_key_version = text(),
            _ => {}
        }
    }

    Ok(enclosure)
}
