//! Protocol state-transition payloads.
//!
//! Each population carries a directed path `root → pre… → <body> → post…`.
//! The pre-phase payloads drive the protocol into a fuzzable state before
//! every individual is sent; the post-phase payloads drive it back out.
//! Both sequences are fixed once finalized; traversal before finalization
//! is a programming error and fails fast.

use crate::error::{Error, Result};

/// Literal bytes sent around the fuzzed message.
#[derive(Debug, Clone)]
pub struct TransitionPayload {
    name: String,
    bytes: Vec<u8>,
    recv_after_send: bool,
}

impl TransitionPayload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>, recv_after_send: bool) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            recv_after_send,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn recv_after_send(&self) -> bool {
        self.recv_after_send
    }
}

#[derive(Debug, Default)]
pub struct TransitionGraph {
    pre: Vec<TransitionPayload>,
    post: Vec<TransitionPayload>,
    pre_done: bool,
    post_done: bool,
}

impl TransitionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pre-phase payload. Only legal before `finalize_pre`.
    pub fn pre(&mut self, payload: TransitionPayload) -> Result<()> {
        if self.pre_done || self.post_done {
            return Err(Error::Graph("pre-phase has already been finalized"));
        }
        self.pre.push(payload);
        Ok(())
    }

    /// Append a post-phase payload. Only legal between `finalize_pre` and
    /// `finalize_post`.
    pub fn post(&mut self, payload: TransitionPayload) -> Result<()> {
        if !self.pre_done || self.post_done {
            return Err(Error::Graph(
                "pre-phase must be finalized and post-phase still open",
            ));
        }
        self.post.push(payload);
        Ok(())
    }

    pub fn finalize_pre(&mut self) -> Result<()> {
        if self.pre_done {
            return Err(Error::Graph("pre-phase is already finalized"));
        }
        self.pre_done = true;
        Ok(())
    }

    pub fn finalize_post(&mut self) -> Result<()> {
        if !self.pre_done || self.post_done {
            return Err(Error::Graph(
                "pre-phase must be finalized and post-phase still open",
            ));
        }
        self.post_done = true;
        Ok(())
    }

    pub fn finalized(&self) -> bool {
        self.pre_done && self.post_done
    }

    /// Pre-phase payloads in send order.
    pub fn pre_phase(&self) -> Result<&[TransitionPayload]> {
        if !self.finalized() {
            return Err(Error::Graph("graph has to be finalized first"));
        }
        Ok(&self.pre)
    }

    /// Post-phase payloads in send order.
    pub fn post_phase(&self) -> Result<&[TransitionPayload]> {
        if !self.finalized() {
            return Err(Error::Graph("graph has to be finalized first"));
        }
        Ok(&self.post)
    }
}
