//! Async front door to the parsing stack
//!
//! The parser lives on its own tokio task and is driven through a
//! [`ParserHandle`]; each request gets its reply over a oneshot channel, so
//! chunks are parsed strictly in the order they were sent. [`Pipeline`] puts
//! the handle together with the publisher, router and region buffers.

use crate::config::Config;
use crate::core::buffers::StreamBufferManager;
use crate::core::events::EventBus;
use crate::core::publisher::TagPublisher;
use crate::core::router::StreamRouter;
use crate::data::TagNode;
use crate::parser::{ParserState, StreamParser};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Server directive that empties a region's buffer
const CLEAR_STREAM: &str = "clearStream";

enum Request {
    Chunk {
        chunk: String,
        reply: oneshot::Sender<Vec<TagNode>>,
    },
    Flush {
        reply: oneshot::Sender<Vec<TagNode>>,
    },
    State {
        reply: oneshot::Sender<ParserState>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a parser running on a tokio task.
///
/// The task exits once every handle is dropped.
#[derive(Clone)]
pub struct ParserHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl ParserHandle {
    /// Move `parser` onto a new task. Must be called inside a tokio runtime.
    pub fn spawn(mut parser: StreamParser) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Chunk { chunk, reply } => {
                        let _ = reply.send(parser.parse(&chunk));
                    }
                    Request::Flush { reply } => {
                        let _ = reply.send(parser.flush());
                    }
                    Request::State { reply } => {
                        let _ = reply.send(parser.state());
                    }
                    Request::Reset { reply } => {
                        parser.reset();
                        let _ = reply.send(());
                    }
                }
            }
            debug!("Parser task finished");
        });

        Self { tx }
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Request) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| anyhow!("Parser task is not running"))?;
        response.await.context("Parser task dropped the request")
    }

    /// Parse one chunk, returning the tags it completed
    pub async fn feed(&self, chunk: impl Into<String>) -> Result<Vec<TagNode>> {
        let chunk = chunk.into();
        self.request(|reply| Request::Chunk { chunk, reply }).await
    }

    pub async fn flush(&self) -> Result<Vec<TagNode>> {
        self.request(|reply| Request::Flush { reply }).await
    }

    pub async fn state(&self) -> Result<ParserState> {
        self.request(|reply| Request::State { reply }).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Request::Reset { reply }).await
    }
}

/// Parser, publisher, router and buffers wired together per chunk
pub struct Pipeline {
    parser: ParserHandle,
    router: StreamRouter,
    publisher: TagPublisher,
    mirror: bool,
}

impl Pipeline {
    /// Build the stack from config. Must be called inside a tokio runtime.
    pub fn new(config: &Config, bus: Arc<EventBus>) -> Self {
        let buffers = StreamBufferManager::with_capacity(config.buffers.capacity);
        Self {
            parser: ParserHandle::spawn(StreamParser::with_config(&config.parser)),
            router: StreamRouter::new(buffers),
            publisher: TagPublisher::new(bus, &config.events.publish),
            mirror: config.router.mirror,
        }
    }

    pub fn parser(&self) -> &ParserHandle {
        &self.parser
    }

    pub fn buffers(&self) -> &StreamBufferManager {
        self.router.buffers()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.publisher.bus()
    }

    pub fn mirror(&self) -> bool {
        self.mirror
    }

    pub fn set_mirror(&mut self, mirror: bool) {
        self.mirror = mirror;
    }

    /// Parse a chunk and return what belongs in the main output
    pub async fn process_chunk(&self, chunk: impl Into<String>) -> Result<Vec<TagNode>> {
        let tags = self.parser.feed(chunk).await?;
        Ok(self.dispatch(tags))
    }

    /// Flush text the parser is still holding (end of input)
    pub async fn finish(&self) -> Result<Vec<TagNode>> {
        let tags = self.parser.flush().await?;
        Ok(self.dispatch(tags))
    }

    pub async fn reset(&self) -> Result<()> {
        info!("Resetting stream pipeline");
        self.parser.reset().await
    }

    fn dispatch(&self, tags: Vec<TagNode>) -> Vec<TagNode> {
        if tags.is_empty() {
            return tags;
        }
        self.publisher.publish(&tags);

        // Route one at a time so a clear lands between the tags around it
        let mut output = Vec::with_capacity(tags.len());
        for tag in tags {
            if tag.name == CLEAR_STREAM {
                match tag.attr("id") {
                    Some(id) => {
                        debug!("Clearing stream '{}'", id);
                        self.buffers().clear(id);
                    }
                    None => tracing::warn!("clearStream without an id"),
                }
            }
            output.extend(self.router.route(vec![tag], self.mirror));
        }
        output
    }
}
