use super::ContextId;
use crate::pmu::RegMask;

/// Message queue capacity.
pub const PFM_MAX_MSGS: usize = 32;

/// Size in bytes of an encoded [`Message`].
pub const MSG_SIZE: usize = 56;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MsgKind {
    /// Counters overflowed with notification requested.
    Overflow = 1,
    /// The monitored task exited.
    End = 2,
}

/// Notification delivered through the message queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    pub kind: MsgKind,
    pub ctx: ContextId,
    /// Overflowed counters, empty for [`MsgKind::End`].
    pub ovfl_pmds: RegMask,
    /// Event id of the first notifying counter.
    pub eventid: u64,
    pub tstamp: u64,
}

impl Message {
    /// Fixed-size little-endian record, as returned by
    /// [`ContextHandle::read`][crate::ContextHandle::read].
    pub fn to_bytes(&self) -> [u8; MSG_SIZE] {
        let mut buf = [0; MSG_SIZE];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.ctx.to_le_bytes());
        for (i, word) in self.ovfl_pmds.0.iter().enumerate() {
            let at = 8 + i * 8;
            buf[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }
        buf[40..48].copy_from_slice(&self.eventid.to_le_bytes());
        buf[48..56].copy_from_slice(&self.tstamp.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; MSG_SIZE] = buf.get(..MSG_SIZE)?.try_into().ok()?;
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };

        let kind = match u32_at(0) {
            1 => MsgKind::Overflow,
            2 => MsgKind::End,
            _ => return None,
        };
        let mut ovfl_pmds = RegMask::EMPTY;
        for (i, word) in ovfl_pmds.0.iter_mut().enumerate() {
            *word = u64_at(8 + i * 8);
        }

        Some(Self {
            kind,
            ctx: u32_at(4),
            ovfl_pmds,
            eventid: u64_at(40),
            tstamp: u64_at(48),
        })
    }
}

/// Bounded FIFO ring.
pub(crate) struct MsgQueue {
    ring: [Option<Message>; PFM_MAX_MSGS],
    head: usize,
    len: usize,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self {
            ring: [None; PFM_MAX_MSGS],
            head: 0,
            len: 0,
        }
    }

    /// Hands the message back if the ring is full.
    pub fn push(&mut self, msg: Message) -> Result<(), Message> {
        if self.len == PFM_MAX_MSGS {
            return Err(msg);
        }
        let tail = (self.head + self.len) % PFM_MAX_MSGS;
        self.ring[tail] = Some(msg);
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Message> {
        if self.len == 0 {
            return None;
        }
        let msg = self.ring[self.head].take();
        self.head = (self.head + 1) % PFM_MAX_MSGS;
        self.len -= 1;
        msg
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
