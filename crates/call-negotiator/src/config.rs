/// What to do with an offer that arrives while we are still waiting for the
/// answer to our own offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlarePolicy {
    /// Keep our offer and ignore theirs.
    #[default]
    RejectBusy,
    /// When both ends advertise a peer id, the end with the smaller id drops
    /// its offer and answers the remote one. Without both ids this behaves
    /// like `RejectBusy`.
    PeerIdTieBreak,
}

#[derive(Debug, Clone, Default)]
pub struct NegotiatorConfig {
    /// Stable identifier advertised in our offers.
    pub local_peer_id: Option<String>,
    pub glare: GlarePolicy,
}

impl NegotiatorConfig {
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.local_peer_id = Some(peer_id.into());
        self
    }

    pub fn with_glare(mut self, glare: GlarePolicy) -> Self {
        self.glare = glare;
        self
    }

    /// Whether we should abandon our own offer in favour of the remote one.
    pub(crate) fn yields_to(&self, remote_peer_id: Option<&str>) -> bool {
        match (self.glare, self.local_peer_id.as_deref(), remote_peer_id) {
            (GlarePolicy::PeerIdTieBreak, Some(local), Some(remote)) => local < remote,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_busy_never_yields() {
        let config = NegotiatorConfig::default().with_peer_id("a");
        assert!(!config.yields_to(Some("z")));
    }

    #[test]
    fn tie_break_yields_only_to_larger_id() {
        let config = NegotiatorConfig::default()
            .with_peer_id("m")
            .with_glare(GlarePolicy::PeerIdTieBreak);
        assert!(config.yields_to(Some("z")));
        assert!(!config.yields_to(Some("a")));
        assert!(!config.yields_to(Some("m")));
        assert!(!config.yields_to(None));
    }
}
