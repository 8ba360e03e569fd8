//! Incremental parser for the game server's XML-ish stream.
//!
//! The server writes markup in arbitrarily sized chunks, so a call to
//! [`StreamParser::parse`] may end in the middle of a tag, an attribute value,
//! an entity, or a text run. Everything needed to resume (open tags, the
//! active stream region, pending text, the unconsumed tail) lives on the
//! parser between calls.
//!
//! Stream regions (`<pushStream id='thoughts'/>` ... `<popStream/>`) are not
//! real nesting in the markup, so the parser builds a synthetic wrapper tag
//! for each region span and stamps the region id on every tag built inside.
//!
//! Malformed markup switches the parser into recovery: input is held until a
//! resync anchor (the `<prompt` that ends every server turn) shows up, and
//! parsing restarts there with a clean stack.

use crate::config::ParserConfig;
use crate::data::{TagNode, TagState};
use aho_corasick::AhoCorasick;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const PUSH_STREAM: &str = "pushStream";
const POP_STREAM: &str = "popStream";
/// `<stream id='x'>...</stream>`: region opened and closed like an element
const STREAM: &str = "stream";

/// Longest entity (`&#x1F600;` without the `;`) we hold back at a chunk cut
const MAX_ENTITY_LEN: usize = 10;

/// Where the parser is between calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserState {
    AtRoot,
    InsideTag(usize),
    InsideRegion { id: Option<String>, depth: usize },
    InErrorRecovery,
}

/// One open region span
#[derive(Debug)]
struct RegionFrame {
    wrapper: TagNode,
    /// Open-tag stack depth when the region was pushed. Nodes finished at this
    /// depth go to the wrapper; deeper ones belong to their parent, and tags
    /// opened before the push close into their own parent.
    base_depth: usize,
    /// Opened with `<stream>` rather than `<pushStream/>`
    element_form: bool,
}

impl RegionFrame {
    fn id(&self) -> Option<&str> {
        self.wrapper.region_id()
    }
}

/// Input held while waiting for a resync anchor
#[derive(Debug, Default)]
struct RecoveryBuffer {
    data: String,
    /// Bytes already scanned for an anchor
    scanned: usize,
}

/// Why a parse pass stopped early
enum Interruption {
    Malformed(String),
}

pub struct StreamParser {
    stack: Vec<TagNode>,
    regions: Vec<RegionFrame>,
    /// Character data not yet attached to a tag
    text: String,
    /// Unconsumed tail of the previous chunk (ended mid-token)
    pending: String,
    recovery: Option<RecoveryBuffer>,

    truncation_limit: usize,
    recovery_limit: usize,
    anchors: Vec<String>,
    anchor_matcher: Option<AhoCorasick>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::with_config(&ParserConfig::default())
    }

    pub fn with_config(config: &ParserConfig) -> Self {
        let mut anchors: Vec<String> = config
            .resync_anchors
            .iter()
            .filter(|anchor| !anchor.is_empty())
            .cloned()
            .collect();
        if anchors.is_empty() {
            warn!("No resync anchors configured, falling back to <prompt");
            anchors.push("<prompt".to_string());
        }

        // Plain substring search still works if the automaton can't be built
        let anchor_matcher = match AhoCorasick::new(&anchors) {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                warn!("Failed to build resync anchor matcher: {}", e);
                None
            }
        };

        Self {
            stack: Vec::new(),
            regions: Vec::new(),
            text: String::new(),
            pending: String::new(),
            recovery: None,
            truncation_limit: config.truncation_limit,
            recovery_limit: config.recovery_limit,
            anchors,
            anchor_matcher,
        }
    }

    /// Feed one chunk and return every tag completed by it, in order.
    ///
    /// Only closed tags are returned. A chunk that ends mid-token returns the
    /// tags finished before the cut; the rest is kept for the next call.
    pub fn parse(&mut self, chunk: &str) -> Vec<TagNode> {
        let mut completed = Vec::new();

        let resyncing = self.recovery.is_some();
        let input = if resyncing {
            match self.recover(chunk) {
                Some(resumed) => resumed,
                None => return completed,
            }
        } else {
            self.take_pending(chunk)
        };

        self.consume(&input, &mut completed);

        // The rest of a malformed chunk may already hold an anchor. Only one
        // retry, so an anchor that is itself malformed can't loop.
        if !resyncing && self.recovery.is_some() {
            if let Some(resumed) = self.recover("") {
                self.consume(&resumed, &mut completed);
            }
        }
        completed
    }

    /// Emit root-level text still waiting for the next tag.
    ///
    /// Text inside an open tag or region stays where it is.
    pub fn flush(&mut self) -> Vec<TagNode> {
        let mut completed = Vec::new();
        if self.recovery.is_none() && self.stack.is_empty() && self.regions.is_empty() {
            self.flush_text(&mut completed);
        }
        completed
    }

    /// Drop all state and start fresh
    pub fn reset(&mut self) {
        self.stack.clear();
        self.regions.clear();
        self.text.clear();
        self.pending.clear();
        self.recovery = None;
    }

    pub fn state(&self) -> ParserState {
        if self.recovery.is_some() {
            ParserState::InErrorRecovery
        } else if let Some(frame) = self.regions.last() {
            ParserState::InsideRegion {
                id: frame.id().map(str::to_string),
                depth: self.stack.len(),
            }
        } else if !self.stack.is_empty() {
            ParserState::InsideTag(self.stack.len())
        } else {
            ParserState::AtRoot
        }
    }

    pub fn in_recovery(&self) -> bool {
        self.recovery.is_some()
    }

    /// Id of the innermost active region
    pub fn active_region(&self) -> Option<&str> {
        self.regions.last().and_then(RegionFrame::id)
    }

    /// Bytes of unconsumed input carried into the next call
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn take_pending(&mut self, chunk: &str) -> String {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return chunk.to_string();
        }
        if pending.len() > self.truncation_limit {
            warn!(
                "Truncation buffer overflow ({} bytes > {}), discarding buffered input",
                pending.len(),
                self.truncation_limit
            );
            return chunk.to_string();
        }
        pending + chunk
    }

    /// Buffer a chunk while in recovery. Returns the input to resume parsing
    /// from once an anchor has been found.
    fn recover(&mut self, chunk: &str) -> Option<String> {
        let recovery = self.recovery.get_or_insert_with(RecoveryBuffer::default);
        recovery.data.push_str(chunk);

        if recovery.data.len() > self.recovery_limit {
            warn!(
                "Recovery buffer overflow ({} bytes > {}), resetting parser",
                recovery.data.len(),
                self.recovery_limit
            );
            self.reset();
            return None;
        }

        // Re-scan a little before the old end in case an anchor straddles chunks
        let longest = self.anchors.iter().map(String::len).max().unwrap_or(0);
        let mut from = recovery.scanned.saturating_sub(longest.saturating_sub(1));
        while !recovery.data.is_char_boundary(from) {
            from -= 1;
        }

        let haystack = &recovery.data[from..];
        let found = match &self.anchor_matcher {
            Some(matcher) => matcher.find(haystack).map(|m| m.start()),
            None => self
                .anchors
                .iter()
                .filter_map(|anchor| haystack.find(anchor.as_str()))
                .min(),
        };

        match found {
            Some(offset) => {
                let resumed = recovery.data[from + offset..].to_string();
                let skipped = from + offset;
                self.reset();
                info!("Resynchronized stream, discarded {} bytes", skipped);
                Some(resumed)
            }
            None => {
                recovery.scanned = recovery.data.len();
                debug!(
                    "Recovery holding {} bytes, no resync anchor yet",
                    recovery.data.len()
                );
                None
            }
        }
    }

    fn consume(&mut self, input: &str, completed: &mut Vec<TagNode>) {
        let (ready, tail) = input.split_at(complete_prefix_len(input));

        let mut reader = Reader::from_str(ready);
        {
            let config = reader.config_mut();
            config.trim_text(false);
            config.expand_empty_elements = true;
            // Open tags outlive a single reader, so nesting is checked here
            config.check_end_names = false;
            config.allow_unmatched_ends = true;
        }

        // Offset of the first byte not yet turned into an event
        let mut consumed = 0;
        loop {
            let result = match reader.read_event() {
                // Empty elements arrive as Start + End (expand_empty_elements)
                Ok(Event::Start(e)) => self.on_start(&e, completed),
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    self.on_end(&name, completed)
                }
                Ok(Event::Text(e)) => {
                    self.text.push_str(&decode_entities(&String::from_utf8_lossy(&e)));
                    Ok(())
                }
                Ok(Event::CData(e)) => {
                    self.text.push_str(&String::from_utf8_lossy(&e));
                    Ok(())
                }
                Ok(Event::Eof) => break,
                // Comments, declarations, processing instructions, doctypes
                Ok(_) => Ok(()),
                Err(e) => Err(Interruption::Malformed(e.to_string())),
            };

            if let Err(Interruption::Malformed(reason)) = result {
                let mut start = consumed.min(ready.len());
                while !ready.is_char_boundary(start) {
                    start -= 1;
                }
                let remainder = format!("{}{}", &ready[start..], tail);
                self.enter_recovery(&reason, remainder, completed);
                return;
            }
            consumed = reader.buffer_position() as usize;
        }

        if !tail.is_empty() {
            debug!("Chunk ended mid-token, carrying {} bytes", tail.len());
            self.pending = tail.to_string();
        }
    }

    fn enter_recovery(&mut self, reason: &str, remainder: String, completed: &mut Vec<TagNode>) {
        warn!(
            "Malformed stream markup ({}), holding input until resync anchor",
            reason
        );
        // Root-level text before the error is complete content
        if self.stack.is_empty() && self.regions.is_empty() {
            self.flush_text(completed);
        }
        self.pending.clear();

        // The failing token can't be its own resync point
        let mut rest = remainder.chars();
        rest.next();
        self.recovery = Some(RecoveryBuffer {
            data: rest.as_str().to_string(),
            scanned: 0,
        });
    }

    fn on_start(
        &mut self,
        start: &BytesStart,
        completed: &mut Vec<TagNode>,
    ) -> Result<(), Interruption> {
        let name = element_name(start);
        if !is_valid_name(&name) {
            return Err(Interruption::Malformed(format!(
                "invalid element name '{}'",
                name
            )));
        }
        let attributes = read_attributes(start)?;

        match name.as_str() {
            PUSH_STREAM | STREAM => {
                self.flush_text(completed);
                let id = attributes.get("id").cloned();
                if id.is_none() {
                    debug!("<{}> without an id", name);
                }
                if let Some(outer) = self.regions.last() {
                    debug!(
                        "Region {:?} pushed inside {:?}, suspending outer region",
                        id,
                        outer.id()
                    );
                }
                self.regions.push(RegionFrame {
                    wrapper: TagNode::region_wrapper(id),
                    base_depth: self.stack.len(),
                    element_form: name == STREAM,
                });
            }
            // Handled when the (expanded) end tag arrives
            POP_STREAM => {}
            _ => {
                self.flush_text(completed);
                let region = self.active_region().map(str::to_string);
                self.stack.push(TagNode::open(name, attributes, region));
            }
        }
        Ok(())
    }

    fn on_end(&mut self, name: &str, completed: &mut Vec<TagNode>) -> Result<(), Interruption> {
        if !is_valid_name(name) {
            return Err(Interruption::Malformed(format!(
                "invalid closing tag '</{}>'",
                name
            )));
        }

        match name {
            PUSH_STREAM => {}
            POP_STREAM => self.pop_region(completed),
            STREAM if self.regions.iter().any(|frame| frame.element_form) => {
                self.close_element_region(completed)
            }
            _ => self.close_tag(name, completed),
        }
        Ok(())
    }

    fn pop_region(&mut self, completed: &mut Vec<TagNode>) {
        let Some(mut frame) = self.regions.pop() else {
            debug!("popStream with no active region");
            return;
        };

        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            let region = frame.id().map(str::to_string);
            frame.wrapper.children.push(TagNode::text_node(text, region));
        }
        if self.stack.len() > frame.base_depth {
            debug!(
                "Region {:?} closed with {} tag(s) still open",
                frame.id(),
                self.stack.len() - frame.base_depth
            );
        }

        frame.wrapper.state = TagState::Closed;
        completed.push(frame.wrapper);
    }

    /// `</stream>` ends the nearest `<stream>` region, along with any pushed
    /// regions still open inside it
    fn close_element_region(&mut self, completed: &mut Vec<TagNode>) {
        while let Some(frame) = self.regions.last() {
            let element_form = frame.element_form;
            if !element_form {
                warn!(
                    "</stream> closing region {:?} that was never popped",
                    frame.id()
                );
            }
            self.pop_region(completed);
            if element_form {
                break;
            }
        }
    }

    fn close_tag(&mut self, name: &str, completed: &mut Vec<TagNode>) {
        let Some(position) = self.stack.iter().rposition(|tag| tag.name == name) else {
            warn!("Discarding closing tag </{}> with no matching open tag", name);
            return;
        };

        if position + 1 < self.stack.len() {
            let discarded: Vec<String> = self
                .stack
                .drain(position + 1..)
                .map(|tag| tag.name)
                .collect();
            warn!(
                "Tag stack mismatch closing </{}>, discarding unclosed {:?}",
                name, discarded
            );
            let depth = self.stack.len();
            for frame in &mut self.regions {
                frame.base_depth = frame.base_depth.min(depth);
            }
        }

        // Text read since a region was pushed inside this tag is region content
        if self
            .regions
            .last()
            .is_some_and(|frame| frame.base_depth > position)
        {
            self.flush_text(completed);
        }

        let Some(mut tag) = self.stack.pop() else {
            return;
        };
        let text = std::mem::take(&mut self.text);
        if !text.is_empty() {
            if tag.children.is_empty() {
                tag.text = Some(text);
            } else {
                let region = tag.region.clone();
                tag.children.push(TagNode::text_node(text, region));
            }
        }
        tag.state = TagState::Closed;

        self.attach(tag, completed);

        // Keep region bases valid for tags closed below them
        let depth = self.stack.len();
        for frame in &mut self.regions {
            frame.base_depth = frame.base_depth.min(depth);
        }
    }

    /// Attach a finished node at the current stack depth.
    ///
    /// The owner is the innermost region pushed before the node's position
    /// was opened. A node sitting at that region's base depth goes to its
    /// wrapper; anything deeper, or opened before every region, goes to the
    /// parent tag, else the root output.
    fn attach(&mut self, node: TagNode, completed: &mut Vec<TagNode>) {
        let depth = self.stack.len();
        if let Some(frame) = self
            .regions
            .iter_mut()
            .rev()
            .find(|frame| frame.base_depth <= depth)
        {
            if frame.base_depth == depth {
                frame.wrapper.children.push(node);
                return;
            }
        }
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => completed.push(node),
        }
    }

    fn flush_text(&mut self, completed: &mut Vec<TagNode>) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        let region = self.active_region().map(str::to_string);
        self.attach(TagNode::text_node(text, region), completed);
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

fn element_name(start: &BytesStart) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn read_attributes(start: &BytesStart) -> Result<HashMap<String, String>, Interruption> {
    let mut attributes = HashMap::new();
    // Repeated keys are tolerated; the last value wins
    for attr in start.attributes().with_checks(false) {
        let attr = attr.map_err(|e| Interruption::Malformed(format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = decode_entities(&String::from_utf8_lossy(&attr.value));
        attributes.insert(key, value);
    }
    Ok(attributes)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// Length of the longest prefix of `input` that ends on a token boundary.
///
/// Stops before markup with no closing `>` (quotes respected), an unfinished
/// comment or CDATA section, or a trailing entity that may continue in the
/// next chunk.
fn complete_prefix_len(input: &str) -> usize {
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut text_start = 0;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        match markup_len(&bytes[i..]) {
            Some(len) => {
                i += len;
                text_start = i;
            }
            None => return i,
        }
    }

    partial_entity_start(input, text_start).unwrap_or(bytes.len())
}

/// Length of the markup token at the start of `bytes`, if it is complete
fn markup_len(bytes: &[u8]) -> Option<usize> {
    const COMMENT: &[u8] = b"<!--";
    const CDATA: &[u8] = b"<![CDATA[";

    if bytes.starts_with(COMMENT) {
        return find(&bytes[COMMENT.len()..], b"-->").map(|p| COMMENT.len() + p + 3);
    }
    if bytes.starts_with(CDATA) {
        return find(&bytes[CDATA.len()..], b"]]>").map(|p| CDATA.len() + p + 3);
    }
    // Might still become a comment or CDATA section
    if COMMENT.starts_with(bytes) || CDATA.starts_with(bytes) {
        return None;
    }

    let mut quote = None;
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i + 1),
            None => {}
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Start of an unterminated entity at the end of the text run at `from`
fn partial_entity_start(input: &str, from: usize) -> Option<usize> {
    let run = &input[from..];
    let amp = run.rfind('&')?;
    let name = &run[amp + 1..];
    let could_continue = name.len() <= MAX_ENTITY_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '#');
    could_continue.then_some(from + amp)
}

/// Decode the predefined XML entities and numeric character references.
/// Anything unrecognized is left as written.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest
            .find(';')
            .filter(|&semi| semi <= MAX_ENTITY_LEN + 1)
            .and_then(|semi| decode_entity(&rest[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse::<u32>().ok()?
            };
            char::from_u32(code)
        }
    }
}
