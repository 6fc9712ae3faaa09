//! Blocks: the units a pipeline is made of.
//!
//! A block takes rendered arguments and produces a JSON value. Readers pull
//! data out of the page, effects act on the world, transforms reshape data,
//! and renderers produce something to show. Which blocks exist is up to the
//! host; the reducer finds them through a [`BlockRegistry`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::logger::Logger;

/// What a block does. Renderers are special: a headless run stops at the
/// first renderer instead of executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockKind {
    Reader,
    Effect,
    Transform,
    Renderer,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::Reader => "reader",
            BlockKind::Effect => "effect",
            BlockKind::Transform => "transform",
            BlockKind::Renderer => "renderer",
        };
        f.write_str(name)
    }
}

/// The part of the page a run reads from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "selector", rename_all = "camelCase")]
pub enum ReaderRoot {
    /// The whole document.
    #[default]
    Document,
    /// The element matched by this selector.
    Element(String),
}

/// What a block gets besides its arguments.
#[derive(Debug, Clone)]
pub struct BlockOptions {
    /// The run's context as the block sees it.
    pub ctxt: Map<String, Value>,
    pub logger: Logger,
    pub root: ReaderRoot,
    pub headless: bool,
}

/// A runnable block.
#[async_trait]
pub trait Block: Send + Sync {
    /// Registry id, e.g. `@brickyard/open-tab`.
    fn id(&self) -> &str;

    fn kind(&self) -> BlockKind;

    /// JSON Schema the rendered arguments must satisfy.
    fn input_schema(&self) -> Option<&Value> {
        None
    }

    async fn run(&self, args: Value, options: BlockOptions) -> Result<Value>;
}

/// Pulls data out of the page.
#[async_trait]
pub trait Reader: Send + Sync {
    fn id(&self) -> &str;

    async fn read(&self, root: &ReaderRoot) -> Result<Map<String, Value>>;
}

/// Runs a [`Reader`] as a block. Arguments are ignored; the reader reads
/// from the run's root.
pub struct ReaderBlock<R> {
    reader: R,
}

impl<R: Reader> ReaderBlock<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: Reader> Block for ReaderBlock<R> {
    fn id(&self) -> &str {
        self.reader.id()
    }

    fn kind(&self) -> BlockKind {
        BlockKind::Reader
    }

    async fn run(&self, _args: Value, options: BlockOptions) -> Result<Value> {
        Ok(Value::Object(self.reader.read(&options.root).await?))
    }
}

/// Several readers read as one. Later readers win on key collisions.
pub struct CompositeReader {
    id: String,
    readers: Vec<Arc<dyn Reader>>,
}

impl CompositeReader {
    pub fn new(id: impl Into<String>, readers: Vec<Arc<dyn Reader>>) -> Self {
        Self {
            id: id.into(),
            readers,
        }
    }
}

#[async_trait]
impl Reader for CompositeReader {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&self, root: &ReaderRoot) -> Result<Map<String, Value>> {
        let mut merged = Map::new();
        for reader in &self.readers {
            merged.extend(reader.read(root).await?);
        }
        Ok(merged)
    }
}

/// Finds blocks by id.
#[async_trait]
pub trait BlockRegistry: Send + Sync {
    async fn lookup(&self, id: &str) -> Option<Arc<dyn Block>>;
}

/// A fixed set of blocks held in memory.
#[derive(Default, Clone)]
pub struct InMemoryBlockRegistry {
    blocks: BTreeMap<String, Arc<dyn Block>>,
}

impl InMemoryBlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block, replacing any block with the same id.
    pub fn register(&mut self, block: impl Block + 'static) -> &mut Self {
        self.register_arc(Arc::new(block))
    }

    pub fn register_arc(&mut self, block: Arc<dyn Block>) -> &mut Self {
        self.blocks.insert(block.id().to_string(), block);
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(|id| id.as_str())
    }
}

#[async_trait]
impl BlockRegistry for InMemoryBlockRegistry {
    async fn lookup(&self, id: &str) -> Option<Arc<dyn Block>> {
        self.blocks.get(id).cloned()
    }
}

impl fmt::Debug for InMemoryBlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBlockRegistry")
            .field("blocks", &self.blocks.keys().collect::<Vec<_>>())
            .finish()
    }
}
