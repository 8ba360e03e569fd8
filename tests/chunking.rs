//! Chunk boundaries must never change what comes out of the stack.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use tagstream::config::Config;
use tagstream::core::{EventBus, Pipeline, StreamBufferManager, StreamRouter};
use tagstream::data::TagNode;
use tagstream::parser::{ParserState, StreamParser};

const SESSION: &str = concat!(
    "<mode id=\"GAME\"/><streamWindow id='main' title='Story' location='center' target='drop'/>\n",
    "<pushStream id='thoughts'/><preset id='thought'>You hear the faint thoughts of Bob:</preset>",
    " \"Hello &amp; welcome.\"\n<popStream/>",
    "<compass><dir value=\"n\"/><dir value=\"out\"/></compass>",
    "<dialogData id='minivitals'><progressBar id='health' value='100' text='health 100%'/></dialogData>",
    "You also see <a exist=\"1234\" noun=\"gem\">a blue gem</a> and ",
    "<a exist=\"99\" noun=\"cloak\">a &quot;fine&quot; cloak</a>.\n",
    "<pushStream id='speech'/><preset id='speech'>You say</preset>, \"Hi.\"\n<popStream/>",
    "<clearStream id='inv'/><!-- a comment with > inside -->",
    "<stream id='inv'>a leather pack</stream>",
    "<prompt time=\"1700000000\">&gt;</prompt>\n",
    "Obvious paths: north, out",
);

fn parse_chunks(chunks: &[&str]) -> Vec<TagNode> {
    let mut parser = StreamParser::new();
    let mut tags: Vec<TagNode> = chunks.iter().flat_map(|chunk| parser.parse(chunk)).collect();
    tags.extend(parser.flush());
    assert_eq!(parser.state(), ParserState::AtRoot);
    assert!(!parser.in_recovery());
    tags
}

/// Split `input` into pieces of at most `size` bytes, on char boundaries
fn split_every(input: &str, size: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < input.len() {
        let mut end = (start + size).min(input.len());
        while !input.is_char_boundary(end) {
            end += 1;
        }
        pieces.push(&input[start..end]);
        start = end;
    }
    pieces
}

fn plain(tags: &[TagNode]) -> String {
    tags.iter().map(TagNode::plain_text).collect()
}

#[test]
fn every_two_way_split_matches_whole_parse() {
    let whole = parse_chunks(&[SESSION]);
    assert!(whole.len() > 10);

    for (cut, _) in SESSION.char_indices().skip(1) {
        let split = parse_chunks(&[&SESSION[..cut], &SESSION[cut..]]);
        assert_eq!(split, whole, "split at byte {}", cut);
    }
}

#[test]
fn fixed_size_chunking_matches_whole_parse() {
    let whole = parse_chunks(&[SESSION]);
    for size in 1..=64 {
        let pieces = split_every(SESSION, size);
        assert_eq!(parse_chunks(&pieces), whole, "chunk size {}", size);
    }
}

#[test]
fn multibyte_text_survives_every_split() {
    let input = "<preset id='speech'>Caf\u{e9} \u{2603} na\u{ef}ve</preset>\u{2014}done";
    let whole = parse_chunks(&[input]);
    for (cut, _) in input.char_indices().skip(1) {
        assert_eq!(parse_chunks(&[&input[..cut], &input[cut..]]), whole);
    }
    assert_eq!(plain(&whole), "Caf\u{e9} \u{2603} na\u{ef}ve\u{2014}done");
}

#[test]
fn no_text_is_lost() {
    let tags = parse_chunks(&split_every(SESSION, 3));
    assert_eq!(
        plain(&tags),
        concat!(
            "\n",
            "You hear the faint thoughts of Bob: \"Hello & welcome.\"\n",
            "You also see a blue gem and a \"fine\" cloak.\n",
            "You say, \"Hi.\"\n",
            "a leather pack",
            ">\n",
            "Obvious paths: north, out",
        )
    );
}

#[test]
fn region_wrappers_are_independent_of_chunking() {
    let wrappers = |tags: Vec<TagNode>| -> Vec<(Option<String>, String)> {
        tags.into_iter()
            .filter(TagNode::is_region_wrapper)
            .map(|w| (w.region_id().map(str::to_string), w.plain_text()))
            .collect()
    };

    let expected = vec![
        (
            Some("thoughts".to_string()),
            "You hear the faint thoughts of Bob: \"Hello & welcome.\"\n".to_string(),
        ),
        (Some("speech".to_string()), "You say, \"Hi.\"\n".to_string()),
        (Some("inv".to_string()), "a leather pack".to_string()),
    ];
    for size in [1, 2, 5, 17, SESSION.len()] {
        assert_eq!(wrappers(parse_chunks(&split_every(SESSION, size))), expected);
    }
}

#[test]
fn every_emitted_tag_is_closed() {
    for tag in parse_chunks(&split_every(SESSION, 4)) {
        tag.walk(&mut |node| assert!(node.is_closed(), "<{}> left open", node.name));
    }
}

#[test]
fn router_without_mirror_moves_region_text_to_buffers() {
    let router = StreamRouter::new(StreamBufferManager::new());
    let output = router.route(parse_chunks(&[SESSION]), false);

    let main = plain(&output);
    assert!(!main.contains("faint thoughts"));
    assert!(!main.contains("You say"));
    assert!(main.contains("a blue gem"));
    assert!(output.iter().all(|tag| !tag.is_region_wrapper()));

    let buffers = router.buffers();
    assert_eq!(buffers.channels(), vec!["inv", "speech", "thoughts"]);
    assert_eq!(buffers.messages("speech")[0].display, "You say, \"Hi.\"\n");
    assert_eq!(buffers.messages("speech")[0].region.as_deref(), Some("speech"));
}

#[test]
fn router_with_mirror_keeps_all_text() {
    let tags = parse_chunks(&[SESSION]);
    let everything = plain(&tags);

    let router = StreamRouter::new(StreamBufferManager::new());
    let output = router.route(tags, true);
    assert_eq!(plain(&output), everything);
    assert_eq!(router.buffers().len("thoughts"), 1);
}

#[tokio::test]
async fn pipeline_buffers_match_across_chunk_sizes() {
    let mut reference: Option<(String, Vec<String>)> = None;

    for size in [1, 7, 64, SESSION.len()] {
        let pipeline = Pipeline::new(&Config::default(), Arc::new(EventBus::new()));
        let mut output = Vec::new();
        for piece in split_every(SESSION, size) {
            output.extend(pipeline.process_chunk(piece).await.unwrap());
        }
        output.extend(pipeline.finish().await.unwrap());

        let buffered: Vec<String> = pipeline
            .buffers()
            .channels()
            .iter()
            .flat_map(|channel| pipeline.buffers().messages(channel))
            .map(|message| message.display)
            .collect();
        let run = (plain(&output), buffered);

        match &reference {
            Some(expected) => assert_eq!(&run, expected, "chunk size {}", size),
            None => reference = Some(run),
        }
    }
}

#[tokio::test]
async fn pipeline_publishes_allow_listed_tags_once() {
    let bus = Arc::new(EventBus::new());
    let health = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&health);
    bus.subscribe("progressBar:health", move |tag: &TagNode| {
        sink.lock().unwrap().push(tag.attr("value").unwrap_or_default().to_string());
        Ok(())
    });

    let pipeline = Pipeline::new(&Config::default(), Arc::clone(&bus));
    for piece in split_every(SESSION, 5) {
        pipeline.process_chunk(piece).await.unwrap();
    }
    pipeline.finish().await.unwrap();

    assert_eq!(*health.lock().unwrap(), vec!["100"]);
}
