//! Who may open a session, and whether they may drive input.

use std::collections::HashSet;
use tether_protocol::{AcceptMode, ConnectRequest, PolicyConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept { control: bool },
    Reject { reason: String },
}

pub trait AcceptPolicy: Send + Sync {
    fn decide(&self, peer_id: &str, request: &ConnectRequest) -> Decision;
}

/// Accept every peer that knows the shared API key. Control is granted
/// unless the viewer opts out or the host disallows it.
pub struct AcceptAll {
    pub allow_control: bool,
}

impl AcceptPolicy for AcceptAll {
    fn decide(&self, _peer_id: &str, request: &ConnectRequest) -> Decision {
        Decision::Accept {
            control: self.allow_control && request.wants_control(),
        }
    }
}

pub struct AllowList {
    peers: HashSet<String>,
    allow_control: bool,
}

impl AllowList {
    pub fn new(peers: impl IntoIterator<Item = String>, allow_control: bool) -> Self {
        Self {
            peers: peers.into_iter().collect(),
            allow_control,
        }
    }
}

impl AcceptPolicy for AllowList {
    fn decide(&self, peer_id: &str, request: &ConnectRequest) -> Decision {
        if self.peers.contains(peer_id) {
            Decision::Accept {
                control: self.allow_control && request.wants_control(),
            }
        } else {
            Decision::Reject {
                reason: "peer not allowed".into(),
            }
        }
    }
}

pub fn from_config(config: &PolicyConfig) -> Box<dyn AcceptPolicy> {
    match config.accept {
        AcceptMode::All => Box::new(AcceptAll {
            allow_control: config.allow_control,
        }),
        AcceptMode::AllowList => Box::new(AllowList::new(
            config.allowed_peers.iter().cloned(),
            config.allow_control,
        )),
    }
}
