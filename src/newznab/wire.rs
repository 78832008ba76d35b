//! Newznab RSS wire format.
//!
//! Newznab responses are RSS 2.0 documents with an `atom:` self link, a
//! `newznab:response` pagination element on the channel, and any number of
//! `newznab:attr` name/value pairs per item. Parsing and emission are
//! hand-rolled over quick-xml events so that a parse -> emit -> parse round
//! trip is value-preserving. Protocol errors travel in-band as an
//! `<error code=".." description=".."/>` document.

use chrono::{DateTime, FixedOffset};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

pub const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
pub const NEWZNAB_NS: &str = "http://www.newznab.com/DTD/2010/feeds/attributes/";

pub const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// Format of `<pubDate>`: RFC 1123 with a numeric timezone.
const PUB_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("xml attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("invalid document: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssFeed {
    pub channel: RssChannel,
}

impl RssFeed {
    pub fn new(channel: RssChannel) -> Self {
        Self { channel }
    }

    /// A response envelope around already-built items, as returned to the
    /// downstream consumer.
    pub fn from_items(offset: u32, total: u32, items: Vec<Item>) -> Self {
        Self {
            channel: RssChannel {
                response: Some(NewznabResponse { offset, total }),
                items,
                ..RssChannel::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssChannel {
    pub atom_link: Option<AtomLink>,
    pub title: String,
    pub description: String,
    pub site_link: String,
    pub language: String,
    pub web_master: String,
    pub category: String,
    pub image: Option<ChannelImage>,
    pub response: Option<NewznabResponse>,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomLink {
    pub href: String,
    pub rel: String,
    pub link_type: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelImage {
    pub url: String,
    pub title: String,
    pub link: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NewznabResponse {
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Item {
    pub title: String,
    pub guid: RssGuid,
    pub link: String,
    pub comments: String,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub category: String,
    pub description: String,
    pub enclosure: RssEnclosure,
    pub attrs: Vec<NewznabAttr>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssGuid {
    pub is_permalink: bool,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssEnclosure {
    pub url: String,
    pub length: i64,
    pub enclosure_type: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewznabAttr {
    pub name: String,
    pub value: String,
}

/// In-band protocol error document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorEnvelope {
    pub code: u16,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl RssFeed {
    pub fn parse(xml: &str) -> Result<Self, WireError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        loop {
            match reader.read_event()? {
                Event::Start(e) if e.local_name().as_ref() == b"rss" => {
                    return parse_rss(&mut reader);
                }
                Event::Eof => {
                    return Err(WireError::Invalid("missing rss element".to_string()));
                }
                _ => {}
            }
        }
    }
}

fn parse_rss(reader: &mut Reader<&[u8]>) -> Result<RssFeed, WireError> {
    let mut channel = RssChannel::default();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"channel" => {
                channel = parse_channel(reader)?;
            }
            Event::Start(e) => {
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"rss" => break,
            Event::Eof => return Err(WireError::Invalid("unterminated rss".to_string())),
            _ => {}
        }
    }
    Ok(RssFeed { channel })
}

fn parse_channel(reader: &mut Reader<&[u8]>) -> Result<RssChannel, WireError> {
    let mut ch = RssChannel::default();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.name();
                let prefixed = name.prefix().is_some();
                match name.local_name().as_ref() {
                    b"link" if prefixed => {
                        ch.atom_link = Some(parse_atom_link(&e)?);
                        reader.read_to_end(e.name())?;
                    }
                    b"title" => ch.title = read_element_text(reader, &e)?,
                    b"description" => ch.description = read_element_text(reader, &e)?,
                    b"link" => ch.site_link = read_element_text(reader, &e)?,
                    b"language" => ch.language = read_element_text(reader, &e)?,
                    b"webMaster" => ch.web_master = read_element_text(reader, &e)?,
                    b"category" => ch.category = read_element_text(reader, &e)?,
                    b"image" => ch.image = Some(parse_image(reader)?),
                    b"response" => {
                        ch.response = Some(parse_response(&e)?);
                        reader.read_to_end(e.name())?;
                    }
                    b"item" => ch.items.push(parse_item(reader)?),
                    _ => {
                        reader.read_to_end(e.name())?;
                    }
                }
            }
            Event::Empty(e) => {
                let name = e.name();
                let prefixed = name.prefix().is_some();
                match name.local_name().as_ref() {
                    b"link" if prefixed => ch.atom_link = Some(parse_atom_link(&e)?),
                    b"response" => ch.response = Some(parse_response(&e)?),
                    _ => {}
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"channel" => break,
            Event::Eof => return Err(WireError::Invalid("unterminated channel".to_string())),
            _ => {}
        }
    }
    Ok(ch)
}

fn parse_atom_link(e: &BytesStart) -> Result<AtomLink, WireError> {
    Ok(AtomLink {
        href: attr(e, "href")?.unwrap_or_default(),
        rel: attr(e, "rel")?.unwrap_or_default(),
        link_type: attr(e, "type")?.unwrap_or_default(),
    })
}

fn parse_response(e: &BytesStart) -> Result<NewznabResponse, WireError> {
    Ok(NewznabResponse {
        offset: parse_number(e, "offset")?,
        total: parse_number(e, "total")?,
    })
}

fn parse_image(reader: &mut Reader<&[u8]>) -> Result<ChannelImage, WireError> {
    let mut img = ChannelImage::default();
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"url" => img.url = read_element_text(reader, &e)?,
                b"title" => img.title = read_element_text(reader, &e)?,
                b"link" => img.link = read_element_text(reader, &e)?,
                b"description" => img.description = read_element_text(reader, &e)?,
                _ => {
                    reader.read_to_end(e.name())?;
                }
            },
            Event::End(e) if e.local_name().as_ref() == b"image" => break,
            Event::Eof => return Err(WireError::Invalid("unterminated image".to_string())),
            _ => {}
        }
    }
    Ok(img)
}

fn parse_item(reader: &mut Reader<&[u8]>) -> Result<Item, WireError> {
    let mut item = Item::default();
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"title" => item.title = read_element_text(reader, &e)?,
                b"guid" => {
                    item.guid.is_permalink =
                        attr(&e, "isPermaLink")?.as_deref() == Some("true");
                    item.guid.value = read_element_text(reader, &e)?;
                }
                b"link" => item.link = read_element_text(reader, &e)?,
                b"comments" => item.comments = read_element_text(reader, &e)?,
                b"pubDate" => {
                    let raw = read_element_text(reader, &e)?;
                    item.pub_date = Some(parse_pub_date(&raw)?);
                }
                b"category" => item.category = read_element_text(reader, &e)?,
                b"description" => item.description = read_element_text(reader, &e)?,
                b"enclosure" => {
                    item.enclosure = parse_enclosure(&e)?;
                    reader.read_to_end(e.name())?;
                }
                b"attr" => {
                    item.attrs.push(parse_attr(&e)?);
                    reader.read_to_end(e.name())?;
                }
                _ => {
                    reader.read_to_end(e.name())?;
                }
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"enclosure" => item.enclosure = parse_enclosure(&e)?,
                b"attr" => item.attrs.push(parse_attr(&e)?),
                b"guid" => {
                    item.guid.is_permalink =
                        attr(&e, "isPermaLink")?.as_deref() == Some("true");
                }
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"item" => break,
            Event::Eof => return Err(WireError::Invalid("unterminated item".to_string())),
            _ => {}
        }
    }
    Ok(item)
}

fn parse_enclosure(e: &BytesStart) -> Result<RssEnclosure, WireError> {
    Ok(RssEnclosure {
        url: attr(e, "url")?.unwrap_or_default(),
        length: parse_number(e, "length")?,
        enclosure_type: attr(e, "type")?.unwrap_or_default(),
    })
}

fn parse_attr(e: &BytesStart) -> Result<NewznabAttr, WireError> {
    Ok(NewznabAttr {
        name: attr(e, "name")?.unwrap_or_default(),
        value: attr(e, "value")?.unwrap_or_default(),
    })
}

fn parse_pub_date(raw: &str) -> Result<DateTime<FixedOffset>, WireError> {
    DateTime::parse_from_rfc2822(raw)
        .map_err(|e| WireError::Invalid(format!("bad pubDate {raw:?}: {e}")))
}

fn parse_number<T: std::str::FromStr + Default>(
    e: &BytesStart,
    name: &str,
) -> Result<T, WireError> {
    match attr(e, name)? {
        None => Ok(T::default()),
        Some(raw) => raw
            .parse()
            .map_err(|_| WireError::Invalid(format!("bad {name} attribute {raw:?}"))),
    }
}

fn attr(e: &BytesStart, name: &str) -> Result<Option<String>, WireError> {
    match e.try_get_attribute(name)? {
        None => Ok(None),
        Some(a) => Ok(Some(a.unescape_value()?.into_owned())),
    }
}

/// Collect the text content of the element just opened by `start`, skipping
/// any nested markup.
fn read_element_text(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<String, WireError> {
    let end = start.name().as_ref().to_vec();
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(c.as_ref())),
            Event::Start(nested) => {
                reader.read_to_end(nested.name())?;
            }
            Event::End(e) if e.name().as_ref() == end.as_slice() => break,
            Event::Eof => {
                return Err(WireError::Invalid(format!(
                    "unterminated element {}",
                    String::from_utf8_lossy(&end)
                )));
            }
            _ => {}
        }
    }
    Ok(text)
}

impl ErrorEnvelope {
    pub fn parse(xml: &str) -> Result<Self, WireError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"error" => {
                    return Ok(Self {
                        code: parse_number(&e, "code")?,
                        description: attr(&e, "description")?.unwrap_or_default(),
                    });
                }
                Event::Eof => {
                    return Err(WireError::Invalid("missing error element".to_string()));
                }
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

impl RssFeed {
    pub fn to_xml(&self) -> Result<String, WireError> {
        let mut writer = Writer::new(Vec::new());

        let mut rss = BytesStart::new("rss");
        rss.push_attribute(("version", "2.0"));
        rss.push_attribute(("xmlns:atom", ATOM_NS));
        rss.push_attribute(("xmlns:newznab", NEWZNAB_NS));
        writer.write_event(Event::Start(rss))?;
        write_channel(&mut writer, &self.channel)?;
        writer.write_event(Event::End(BytesEnd::new("rss")))?;

        into_document(writer)
    }
}

fn write_channel(w: &mut Writer<Vec<u8>>, ch: &RssChannel) -> Result<(), WireError> {
    w.write_event(Event::Start(BytesStart::new("channel")))?;

    if let Some(al) = &ch.atom_link {
        let mut e = BytesStart::new("atom:link");
        e.push_attribute(("href", al.href.as_str()));
        e.push_attribute(("rel", al.rel.as_str()));
        e.push_attribute(("type", al.link_type.as_str()));
        w.write_event(Event::Empty(e))?;
    }
    write_text_element(w, "title", &ch.title)?;
    write_text_element(w, "description", &ch.description)?;
    write_text_element(w, "link", &ch.site_link)?;
    write_text_element(w, "language", &ch.language)?;
    write_text_element(w, "webMaster", &ch.web_master)?;
    write_text_element(w, "category", &ch.category)?;
    if let Some(img) = &ch.image {
        w.write_event(Event::Start(BytesStart::new("image")))?;
        write_text_element(w, "url", &img.url)?;
        write_text_element(w, "title", &img.title)?;
        write_text_element(w, "link", &img.link)?;
        write_text_element(w, "description", &img.description)?;
        w.write_event(Event::End(BytesEnd::new("image")))?;
    }
    if let Some(resp) = &ch.response {
        let mut e = BytesStart::new("newznab:response");
        e.push_attribute(("offset", resp.offset.to_string().as_str()));
        e.push_attribute(("total", resp.total.to_string().as_str()));
        w.write_event(Event::Empty(e))?;
    }
    for item in &ch.items {
        write_item(w, item)?;
    }

    w.write_event(Event::End(BytesEnd::new("channel")))?;
    Ok(())
}

fn write_item(w: &mut Writer<Vec<u8>>, item: &Item) -> Result<(), WireError> {
    w.write_event(Event::Start(BytesStart::new("item")))?;

    write_text_element(w, "title", &item.title)?;

    let mut guid = BytesStart::new("guid");
    guid.push_attribute((
        "isPermaLink",
        if item.guid.is_permalink { "true" } else { "false" },
    ));
    w.write_event(Event::Start(guid))?;
    w.write_event(Event::Text(BytesText::new(&item.guid.value)))?;
    w.write_event(Event::End(BytesEnd::new("guid")))?;

    write_text_element(w, "link", &item.link)?;
    write_text_element(w, "comments", &item.comments)?;
    if let Some(pub_date) = &item.pub_date {
        write_text_element(w, "pubDate", &pub_date.format(PUB_DATE_FORMAT).to_string())?;
    }
    write_text_element(w, "category", &item.category)?;
    write_text_element(w, "description", &item.description)?;

    let mut enclosure = BytesStart::new("enclosure");
    enclosure.push_attribute(("url", item.enclosure.url.as_str()));
    enclosure.push_attribute(("length", item.enclosure.length.to_string().as_str()));
    enclosure.push_attribute(("type", item.enclosure.enclosure_type.as_str()));
    w.write_event(Event::Empty(enclosure))?;

    for a in &item.attrs {
        let mut e = BytesStart::new("newznab:attr");
        e.push_attribute(("name", a.name.as_str()));
        e.push_attribute(("value", a.value.as_str()));
        w.write_event(Event::Empty(e))?;
    }

    w.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

impl ErrorEnvelope {
    pub fn to_xml(&self) -> Result<String, WireError> {
        let mut writer = Writer::new(Vec::new());
        let mut e = BytesStart::new("error");
        e.push_attribute(("code", self.code.to_string().as_str()));
        e.push_attribute(("description", self.description.as_str()));
        writer.write_event(Event::Empty(e))?;
        into_document(writer)
    }
}

fn write_text_element(w: &mut Writer<Vec<u8>>, name: &str, value: &str) -> Result<(), WireError> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(value)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn into_document(writer: Writer<Vec<u8>>) -> Result<String, WireError> {
    let body = String::from_utf8_lossy(&writer.into_inner()).into_owned();
    Ok(format!("{XML_HEADER}{body}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
