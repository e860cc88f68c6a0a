//! Completion-vector selection.

use std::net::SocketAddr;

use crate::channel::ChannelType;

/// What is known about a channel when its completion vector is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityContext {
    pub kind: ChannelType,
    pub local: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
}

/// Picks the completion vector a new channel's completion queue binds to.
pub trait CompletionVectorSelector: Send + Sync {
    fn next_vector(&self, ctx: &AffinityContext) -> u32;
}

/// Always returns the same vector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixedVector(pub u32);

impl CompletionVectorSelector for FixedVector {
    fn next_vector(&self, _ctx: &AffinityContext) -> u32 {
        self.0
    }
}

impl<F> CompletionVectorSelector for F
where
    F: Fn(&AffinityContext) -> u32 + Send + Sync,
{
    fn next_vector(&self, ctx: &AffinityContext) -> u32 {
        self(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(kind: ChannelType) -> AffinityContext {
        AffinityContext {
            kind,
            local: None,
            peer: Some("10.0.0.1:1955".parse().unwrap()),
        }
    }

    #[test]
    fn test_fixed_default_is_zero() {
        let selector = FixedVector::default();
        assert_eq!(selector.next_vector(&ctx(ChannelType::ReadRequestor)), 0);
        assert_eq!(selector.next_vector(&ctx(ChannelType::ReadResponder)), 0);
    }

    #[test]
    fn test_closure_selector() {
        let selector = |ctx: &AffinityContext| if ctx.kind.is_passive() { 3 } else { 1 };
        assert_eq!(selector.next_vector(&ctx(ChannelType::ReadResponder)), 3);
        assert_eq!(selector.next_vector(&ctx(ChannelType::ReadRequestor)), 1);
    }
}
