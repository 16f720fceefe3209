//! # Streaming Protocol
//!
//! Pull-based iteration over foreign generators and iterators. Every pull is
//! one round trip; once the end has been seen, pulls are answered locally.

use futures::Stream;
use futures::stream;
use tagpack::StreamRef;
use tagpack::Value;

use crate::bridge::Bridge;
use crate::context::CallerContext;
use crate::error::Result;
use crate::options::CallOptions;

/// One pull from a foreign stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    Item(Value),
    End,
}

impl StreamItem {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Item(value) => Some(value),
            Self::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

/// A forward-only, non-restartable cursor over a foreign stream.
///
/// Holds a clone of the caller context, so the session stays alive for as long
/// as the cursor does.
pub struct RefStream {
    bridge: Bridge,
    context: CallerContext,
    stream: StreamRef,
    options: CallOptions,
}

impl RefStream {
    pub(crate) fn new(bridge: Bridge, context: CallerContext, stream: StreamRef, options: CallOptions) -> Self {
        Self {
            bridge,
            context,
            stream,
            options,
        }
    }

    pub fn stream_ref(&self) -> &StreamRef {
        &self.stream
    }

    pub fn is_done(&self) -> bool {
        self.stream.exhausted
    }

    /// Pulls the next item.
    pub async fn next(&mut self) -> Result<StreamItem> {
        if self.stream.exhausted {
            return Ok(StreamItem::End);
        }

        let item = self.bridge.next(&self.context, &self.stream, self.options.clone()).await?;
        if item.is_end() {
            self.stream.exhausted = true;
        }
        Ok(item)
    }

    /// Adapts the cursor into a `futures::Stream`. An error ends the stream
    /// after it is yielded.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send {
        stream::unfold(self, |mut cursor| async move {
            match cursor.next().await {
                Ok(StreamItem::Item(value)) => Some((Ok(value), cursor)),
                Ok(StreamItem::End) => None,
                Err(e) => {
                    cursor.stream.exhausted = true;
                    Some((Err(e), cursor))
                }
            }
        })
    }
}
