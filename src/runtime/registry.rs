//! Registry of bound stream visitors.
//!
//! Each live stream has at most one visitor, bound when the stream is
//! accepted or opened and dropped on the terminal closure notification.

use crate::transport::StreamId;
use crate::visitor::StreamVisitor;
use std::collections::HashMap;
use tracing::error;

/// Stream visitors keyed by stream id.
///
/// Provides O(1) bind, lookup, and remove operations.
#[derive(Default)]
pub struct VisitorRegistry {
    visitors: HashMap<StreamId, Box<dyn StreamVisitor>>,
}

impl VisitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a visitor to a stream.
    ///
    /// Rebinding is not supported: returns false and keeps the existing
    /// visitor if the stream already has one.
    pub fn bind(&mut self, stream_id: StreamId, visitor: Box<dyn StreamVisitor>) -> bool {
        if self.visitors.contains_key(&stream_id) {
            error!(stream_id = %stream_id, "Stream already has a visitor");
            return false;
        }
        self.visitors.insert(stream_id, visitor);
        true
    }

    /// Get the visitor bound to a stream.
    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut Box<dyn StreamVisitor>> {
        self.visitors.get_mut(&stream_id)
    }

    /// Drop the visitor of a closed stream.
    pub fn remove(&mut self, stream_id: StreamId) -> Option<Box<dyn StreamVisitor>> {
        self.visitors.remove(&stream_id)
    }

    /// Check if a stream has a visitor.
    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.visitors.contains_key(&stream_id)
    }

    /// Drop every visitor, e.g. when the session is gone.
    pub fn clear(&mut self) {
        self.visitors.clear();
    }

    /// Number of bound visitors.
    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }
}
